//! Visit persistence.

use nutri_core::VisitId;
use sqlx::PgPool;

use super::{from_json, to_json};
use crate::state::VisitRecord;

/// Insert or replace a visit.
pub async fn upsert(pool: &PgPool, visit: &VisitRecord) -> Result<(), sqlx::Error> {
    let data = to_json(visit)?;
    sqlx::query(
        "INSERT INTO visits (id, patient_id, scheduled_at, data, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE
         SET scheduled_at = EXCLUDED.scheduled_at, data = EXCLUDED.data,
             updated_at = EXCLUDED.updated_at",
    )
    .bind(*visit.id.as_uuid())
    .bind(*visit.patient_id.as_uuid())
    .bind(visit.scheduled_at)
    .bind(&data)
    .bind(visit.created_at)
    .bind(visit.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a visit. Returns whether a row was removed.
pub async fn delete(pool: &PgPool, id: VisitId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM visits WHERE id = $1")
        .bind(*id.as_uuid())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Load all visits.
pub async fn load_all(pool: &PgPool) -> Result<Vec<VisitRecord>, sqlx::Error> {
    let rows: Vec<serde_json::Value> =
        sqlx::query_scalar("SELECT data FROM visits ORDER BY scheduled_at")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(from_json).collect()
}
