//! Audit entry persistence: the immutable hash chain.
//!
//! Hashes are computed by [`crate::audit::AuditLog`] before the row is
//! written; the table only stores them.

use chrono::{DateTime, Utc};
use nutri_core::UserId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::AuditEntry;

/// Append an entry to the log.
pub async fn insert(pool: &PgPool, entry: &AuditEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_events (id, actor_id, action, resource_type, resource_id,
         metadata, previous_hash, event_hash, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(entry.id)
    .bind(entry.actor.map(|a| *a.as_uuid()))
    .bind(&entry.action)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(&entry.metadata)
    .bind(&entry.previous_hash)
    .bind(&entry.hash)
    .bind(entry.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Database row for audit events.
#[derive(sqlx::FromRow)]
struct AuditEventRow {
    id: Uuid,
    actor_id: Option<Uuid>,
    action: String,
    resource_type: String,
    resource_id: String,
    metadata: serde_json::Value,
    previous_hash: String,
    event_hash: String,
    created_at: DateTime<Utc>,
}

impl AuditEventRow {
    fn into_entry(self) -> AuditEntry {
        AuditEntry {
            id: self.id,
            actor: self.actor_id.map(UserId::from_uuid),
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            metadata: self.metadata,
            previous_hash: self.previous_hash,
            hash: self.event_hash,
            created_at: self.created_at,
        }
    }
}

/// Load the whole chain, oldest first.
pub async fn load_all(pool: &PgPool) -> Result<Vec<AuditEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AuditEventRow>(
        "SELECT id, actor_id, action, resource_type, resource_id,
         metadata, previous_hash, event_hash, created_at
         FROM audit_events ORDER BY seq ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(AuditEventRow::into_entry).collect())
}
