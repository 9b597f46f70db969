use sqlx::SqlitePool;

use super::Identity;

pub async fn find(db_pool: &SqlitePool, id: &str) -> Result<Option<Identity>, sqlx::Error> {
    let row: Option<(String, String, String)> =
        sqlx::query_as("SELECT id,username,email FROM users WHERE id=?")
            .bind(id)
            .fetch_optional(db_pool)
            .await?;

    Ok(row.map(|(id, username, email)| Identity { id, username, email }))
}

/// Seeds or refreshes a user row. Registration itself lives outside this crate.
pub async fn insert(db_pool: &SqlitePool, identity: &Identity) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (id,username,email) VALUES (?,?,?)
         ON CONFLICT(id) DO UPDATE SET username=excluded.username, email=excluded.email",
    )
    .bind(&identity.id)
    .bind(&identity.username)
    .bind(&identity.email)
    .execute(db_pool)
    .await?;
    Ok(())
}
