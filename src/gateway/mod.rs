mod dispatch;
pub mod events;
mod ordering;
pub mod registry;
mod session;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use dispatch::{EventError, Gateway, MAX_TEXT_LEN};
pub use events::{ClientEvent, ServerEvent};
pub use registry::{RoomRegistry, SessionId};
pub use session::Session;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
}
