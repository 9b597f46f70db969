use std::time::Duration;

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::auth::{self, Identity, IdentityVerifier, TokenQuery};

use super::{events::ClientEvent, registry::OUTBOX_CAPACITY, session::Session, EventError, Gateway};

// a peer that takes longer than this to accept one frame is treated as gone
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// GET /ws
///
/// The credential is checked before the upgrade: a missing or bad one gets a
/// plain 401 and the websocket never opens.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn room_ws(
    State(verifier): State<IdentityVerifier>,
    State(gateway): State<Gateway>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,

    ws: WebSocketUpgrade,
) -> Response {
    let credential = auth::credential(&headers, query);
    let identity = match verifier.verify(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(reason = err.code(), "websocket handshake rejected");
            return err.into_response();
        }
    };

    ws.on_upgrade(move |socket| run_session(socket, gateway, identity))
}

/// Drives one connection until either side closes it. Events from the client
/// are handled strictly in arrival order.
pub(crate) async fn run_session(socket: WebSocket, gateway: Gateway, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut queued) = mpsc::channel::<Message>(OUTBOX_CAPACITY);

    let session = Session::open(gateway.registry(), identity, outbox);
    tracing::info!(
        session_id = %session.id(),
        user_id = %session.identity().id,
        username = %session.identity().username,
        "session opened"
    );

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = queued.recv().await {
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let result = match ClientEvent::parse(text.as_str()) {
                        Ok(event) => gateway.dispatch(&session, event).await,
                        Err(err) => Err(EventError::from(err)),
                    };
                    if let Err(err) = result {
                        report(&session, &err);
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(session_id = %session.id(), "binary frame ignored");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(session_id = %session.id(), error = %err, "websocket read failed");
                    break;
                }
            },
            // writer gone means the peer stopped accepting frames
            _ = &mut writer => break,
        }
    }

    drop(session);
    writer.abort();
}

fn report(session: &Session, err: &EventError) {
    match err {
        EventError::PersistenceFailure(_) | EventError::Directory(_) => {
            tracing::warn!(session_id = %session.id(), error = %err, "event failed")
        }
        _ => tracing::debug!(session_id = %session.id(), error = %err, "event dropped"),
    }
}
