#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use letschat::{
    auth::{users, Claims, Identity},
    gateway::Gateway,
    AppState,
};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

pub const SECRET: &[u8] = b"test-secret";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub db_pool: SqlitePool,
    pub gateway: Gateway,
    _dir: tempfile::TempDir,
}

/// Boots the full router on an ephemeral port backed by a throwaway database.
pub async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("chat.db").display());
    let db_pool = letschat::db::connect(&url, 8).await.expect("Failed to open DB");

    let state = AppState::new(db_pool.clone(), SECRET);
    let gateway = state.gateway.clone();
    let app = letschat::app(state, "http://localhost:5173").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        base_url: format!("http://{addr}"),
        db_pool,
        gateway,
        _dir: dir,
    }
}

impl TestServer {
    /// Seeds a user and returns a bearer token for it.
    pub async fn user(&self, id: &str, username: &str) -> String {
        users::insert(&self.db_pool, &Identity {
            id: id.to_owned(),
            username: username.to_owned(),
            email: format!("{username}@example.com"),
        })
        .await
        .unwrap();
        token(id, 3600)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self, token: &str) -> Ws {
        let mut request = self.ws_url().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("websocket handshake failed");
        ws
    }

    /// Polls until the gateway reaches the expected state.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Gateway) -> bool) {
        for _ in 0..200 {
            if check(&self.gateway) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    pub async fn wait_for_members(&self, room: &str, count: usize) {
        self.wait_until(&format!("{count} members in {room}"), |g| {
            g.registry().members(room).len() == count
        })
        .await;
    }
}

pub fn token(id: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        id: id.to_owned(),
        exp: time::OffsetDateTime::now_utc().unix_timestamp() + ttl_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

pub async fn emit(ws: &mut Ws, event: Value) {
    ws.send(Message::text(event.to_string())).await.unwrap();
}

/// Next server event as JSON, or `None` if nothing arrives in time.
pub async fn next_event(ws: &mut Ws, wait: Duration) -> Option<Value> {
    loop {
        match tokio::time::timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

pub async fn expect_event(ws: &mut Ws) -> Value {
    next_event(ws, Duration::from_secs(2))
        .await
        .expect("expected a server event")
}

pub async fn expect_silence(ws: &mut Ws) {
    if let Some(event) = next_event(ws, Duration::from_millis(200)).await {
        panic!("unexpected event {event}");
    }
}
