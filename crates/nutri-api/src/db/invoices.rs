//! Invoice persistence. `number` carries a unique index; lifecycle rules
//! are enforced by `nutri_core::Invoice`, not in SQL.

use nutri_core::Invoice;
use sqlx::PgPool;

use super::{from_json, to_json};

/// Insert or replace an invoice.
pub async fn upsert(pool: &PgPool, invoice: &Invoice) -> Result<(), sqlx::Error> {
    let data = to_json(invoice)?;
    sqlx::query(
        "INSERT INTO invoices (id, number, patient_id, status, data, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE
         SET status = EXCLUDED.status, data = EXCLUDED.data",
    )
    .bind(*invoice.id.as_uuid())
    .bind(&invoice.number)
    .bind(*invoice.patient_id.as_uuid())
    .bind(invoice.status.as_str())
    .bind(&data)
    .bind(invoice.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load all invoices.
pub async fn load_all(pool: &PgPool) -> Result<Vec<Invoice>, sqlx::Error> {
    let rows: Vec<serde_json::Value> =
        sqlx::query_scalar("SELECT data FROM invoices ORDER BY created_at")
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(from_json).collect()
}
