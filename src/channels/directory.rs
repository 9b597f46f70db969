use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db;

/// Durable directory record for a named room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of a create: `created` is false when the name already existed and
/// the stored record was returned instead.
#[derive(Debug)]
pub struct Created {
    pub channel: Channel,
    pub created: bool,
}

type ChannelRow = (String, String, String, i64);

fn from_row((id, name, created_by, created_at): ChannelRow) -> Result<Channel, sqlx::Error> {
    Ok(Channel {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        name,
        created_by,
        created_at: db::from_millis(created_at),
    })
}

pub async fn create(db_pool: &SqlitePool, name: &str, created_by: &str) -> Result<Created, sqlx::Error> {
    let id = Uuid::now_v7();
    let (millis, _) = db::now_millis();

    let inserted = sqlx::query(
        "INSERT INTO channels (id,name,created_by,created_at) VALUES (?,?,?,?)
         ON CONFLICT(name) DO NOTHING",
    )
    .bind(id.to_string())
    .bind(name)
    .bind(created_by)
    .bind(millis)
    .execute(db_pool)
    .await?
    .rows_affected()
        == 1;

    let channel = find_by_name(db_pool, name)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;

    Ok(Created { channel, created: inserted })
}

pub async fn find_by_name(db_pool: &SqlitePool, name: &str) -> Result<Option<Channel>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>("SELECT id,name,created_by,created_at FROM channels WHERE name=?")
        .bind(name)
        .fetch_optional(db_pool)
        .await?
        .map(from_row)
        .transpose()
}

/// All channels in creation order.
pub async fn list(db_pool: &SqlitePool) -> Result<Vec<Channel>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        "SELECT id,name,created_by,created_at FROM channels ORDER BY created_at,rowid",
    )
    .fetch_all(db_pool)
    .await?
    .into_iter()
    .map(from_row)
    .collect()
}
