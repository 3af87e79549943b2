//! # Database Persistence Layer
//!
//! Optional Postgres persistence via SQLx. When `DATABASE_URL` is set,
//! users, patients, visits, invoices and the audit chain are written
//! through to PostgreSQL and reloaded on start-up. When absent, the API
//! operates in in-memory-only mode (suitable for development and testing).
//!
//! Records are stored as a JSONB `data` column next to the columns that
//! carry constraints or indexes, so schema evolution of the record types
//! does not require a migration.

pub mod audit;
pub mod invoices;
pub mod patients;
pub mod users;
pub mod visits;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Initialize the database connection pool and run migrations.
///
/// Returns `None` if `DATABASE_URL` is not set (in-memory-only mode).
/// Returns `Err` if the URL is set but the connection or migration fails.
pub async fn init_pool() -> Result<Option<PgPool>, sqlx::Error> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            tracing::warn!(
                "DATABASE_URL not set; running in-memory only mode. \
                 State will not survive restarts."
            );
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(Some(pool))
}

/// Serialize a record for the `data` column.
fn to_json<T: Serialize>(record: &T) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::to_value(record).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize record");
        sqlx::Error::Encode(Box::new(e))
    })
}

/// Deserialize a `data` column back into a record.
fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, sqlx::Error> {
    serde_json::from_value(value).map_err(|e| {
        tracing::error!(error = %e, "failed to deserialize stored record");
        sqlx::Error::Decode(Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_helpers_round_trip_and_report_decode_errors() {
        let value = to_json(&vec![1, 2, 3]).unwrap();
        let back: Vec<u32> = from_json(value).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        let err = from_json::<Vec<u32>>(serde_json::json!({"not": "a list"})).unwrap_err();
        assert!(matches!(err, sqlx::Error::Decode(_)));
    }
}
