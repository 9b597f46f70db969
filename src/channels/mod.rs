pub mod directory;

use axum::{debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::{auth::AuthUser, AppResult, AppState};

pub use directory::Channel;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/channels", get(list_channels).post(create_channel))
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewChannelBody {
    name: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_channels(
    State(db_pool): State<SqlitePool>,
) -> AppResult<Json<Vec<Channel>>> {
    Ok(Json(directory::list(&db_pool).await?))
}

/// Directory write only. Announcing the channel to live sessions is the
/// `create_channel` websocket event.
#[debug_handler(state = AppState)]
pub(crate) async fn create_channel(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,

    Json(NewChannelBody { name }): Json<NewChannelBody>,
) -> AppResult<Response> {
    let name = name.trim();
    if name.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Channel name cannot be empty" })),
        ).into_response());
    }

    let created = directory::create(&db_pool, name, &identity.id).await?;
    if created.created {
        tracing::info!(channel = %created.channel.name, user_id = %identity.id, "channel created");
    }

    let status = if created.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(created.channel)).into_response())
}
