pub mod store;

use axum::{debug_handler, extract::{Path, State}, routing::get, Json, Router};
use sqlx::SqlitePool;

use crate::{auth::AuthUser, AppResult, AppState};

pub use store::{Message, HISTORY_LIMIT};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/messages/{room}", get(room_history))
}

/// Canonical form of a room name: surrounding whitespace is not part of it.
/// `None` for a name that is blank.
pub fn room_name(room: &str) -> Option<&str> {
    Some(room.trim()).filter(|room| !room.is_empty())
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_history(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Path(room): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    let Some(room) = room_name(&room) else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(store::history(&db_pool, room, HISTORY_LIMIT).await?))
}
