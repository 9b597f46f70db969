pub mod appresult;
pub mod auth;
pub mod channels;
pub mod client;
pub mod config;
pub mod db;
pub mod gateway;
pub mod messages;

use axum::{
    extract::FromRef,
    http::{header::{AUTHORIZATION, CONTENT_TYPE}, HeaderValue, Method},
    routing::get,
    Router,
};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub gateway: gateway::Gateway,
    pub verifier: auth::IdentityVerifier,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, jwt_secret: impl AsRef<[u8]>) -> Self {
        AppState {
            gateway: gateway::Gateway::new(db_pool.clone()),
            verifier: auth::IdentityVerifier::new(jwt_secret, db_pool.clone()),
            db_pool,
        }
    }
}

/// The full HTTP surface: REST routes, the websocket gateway, CORS and
/// request tracing.
pub fn app(state: AppState, cors_origin: &str) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(cors_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Ok(Router::new()
        .route("/", get(|| async { "Realtime chat backend with auth" }))

        .merge(channels::router())
        .merge(messages::router())
        .merge(gateway::router())

        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}
