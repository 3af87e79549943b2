//! User persistence. `email` carries a unique index.

use sqlx::PgPool;

use super::{from_json, to_json};
use crate::state::UserRecord;

/// Insert or replace a user.
pub async fn upsert(pool: &PgPool, user: &UserRecord) -> Result<(), sqlx::Error> {
    let data = to_json(user)?;
    sqlx::query(
        "INSERT INTO users (id, email, active, data, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE
         SET email = EXCLUDED.email, active = EXCLUDED.active,
             data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
    )
    .bind(*user.id.as_uuid())
    .bind(user.email.as_str())
    .bind(user.active)
    .bind(&data)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load all users.
pub async fn load_all(pool: &PgPool) -> Result<Vec<UserRecord>, sqlx::Error> {
    let rows: Vec<serde_json::Value> =
        sqlx::query_scalar("SELECT data FROM users ORDER BY created_at")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(from_json).collect()
}
