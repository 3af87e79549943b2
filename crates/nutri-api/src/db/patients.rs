//! Patient persistence. Soft-deleted patients stay in the table with
//! `active = false`.

use sqlx::PgPool;

use super::{from_json, to_json};
use crate::state::PatientRecord;

/// Insert or replace a patient.
pub async fn upsert(pool: &PgPool, patient: &PatientRecord) -> Result<(), sqlx::Error> {
    let data = to_json(patient)?;
    sqlx::query(
        "INSERT INTO patients (id, active, data, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (id) DO UPDATE
         SET active = EXCLUDED.active, data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
    )
    .bind(*patient.id.as_uuid())
    .bind(patient.active)
    .bind(&data)
    .bind(patient.created_at)
    .bind(patient.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load all patients, including inactive ones.
pub async fn load_all(pool: &PgPool) -> Result<Vec<PatientRecord>, sqlx::Error> {
    let rows: Vec<serde_json::Value> =
        sqlx::query_scalar("SELECT data FROM patients ORDER BY created_at")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(from_json).collect()
}
