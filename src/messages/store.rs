use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::Identity, db};

/// Most recent messages returned by a history read.
pub const HISTORY_LIMIT: u32 = 1000;

/// One chat line. `username` is captured at send time and never refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    pub fn new(room: &str, sender: &Identity, text: &str) -> Message {
        let (_, created_at) = db::now_millis();
        Message {
            id: Uuid::now_v7(),
            room: room.to_owned(),
            user_id: sender.id.clone(),
            username: sender.username.clone(),
            text: text.to_owned(),
            created_at,
        }
    }
}

type MessageRow = (String, String, String, String, String, i64);

fn from_row((id, room, user_id, username, text, created_at): MessageRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        room,
        user_id,
        username,
        text,
        created_at: db::from_millis(created_at),
    })
}

/// Durable append. Returns once the row is committed.
pub async fn append(db_pool: &SqlitePool, message: &Message) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO messages (id,room,user_id,username,text,created_at) VALUES (?,?,?,?,?,?)")
        .bind(message.id.to_string())
        .bind(&message.room)
        .bind(&message.user_id)
        .bind(&message.username)
        .bind(&message.text)
        .bind(db::to_millis(message.created_at))
        .execute(db_pool)
        .await?;
    Ok(())
}

/// Newest `created_at` stored for `room`, in unix millis.
pub async fn latest_stamp(db_pool: &SqlitePool, room: &str) -> Result<Option<i64>, sqlx::Error> {
    let (latest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(created_at) FROM messages WHERE room=?")
        .bind(room)
        .fetch_one(db_pool)
        .await?;
    Ok(latest)
}

/// The newest `limit` messages of `room`, oldest first. Equal timestamps keep
/// insertion order.
pub async fn history(db_pool: &SqlitePool, room: &str, limit: u32) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id,room,user_id,username,text,created_at FROM (
            SELECT rowid AS seq,id,room,user_id,username,text,created_at FROM messages
            WHERE room=?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
        ) ORDER BY created_at ASC, seq ASC",
    )
    .bind(room)
    .bind(limit)
    .fetch_all(db_pool)
    .await?
    .into_iter()
    .map(from_row)
    .collect()
}
