//! # Audit Trail
//!
//! Every mutation (login outcome, user and role changes, patient and visit
//! edits, invoice transitions, emails sent, job runs) appends an entry whose
//! SHA-256 hash chains to the previous entry, forming a tamper-evident log.
//! Entries are kept in memory and, when a database is connected, appended
//! to `audit_events` as well.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nutri_core::UserId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

/// Hash used as `previous_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Acting user, if any (scheduler runs have none).
    #[schema(value_type = Option<String>)]
    pub actor: Option<UserId>,
    /// Dotted action name, e.g. `patient.create`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Compute the chained hash of an entry.
pub fn chain_hash(
    previous_hash: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(resource_type.as_bytes());
    hasher.update(resource_id.as_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Result of re-walking the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ChainIntegrity {
    pub total_events: usize,
    pub broken_links: usize,
    pub chain_valid: bool,
}

/// Append-only in-memory audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry chained to the current tail.
    pub fn append(
        &self,
        actor: Option<UserId>,
        action: &str,
        resource_type: &str,
        resource_id: impl ToString,
        metadata: serde_json::Value,
    ) -> AuditEntry {
        let resource_id = resource_id.to_string();
        let created_at = Utc::now();
        let mut entries = self.entries.write();
        let previous_hash = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let hash = chain_hash(&previous_hash, action, resource_type, &resource_id, created_at);
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            actor,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            metadata,
            previous_hash,
            hash,
            created_at,
        };
        entries.push(entry.clone());
        entry
    }

    /// Replace the contents with entries loaded from storage (oldest first).
    pub fn restore(&self, loaded: Vec<AuditEntry>) {
        *self.entries.write() = loaded;
    }

    /// Entries matching the filters, newest first, at most `limit`.
    pub fn query(
        &self,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        actor: Option<UserId>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| resource_type.map_or(true, |t| e.resource_type == t))
            .filter(|e| resource_id.map_or(true, |id| e.resource_id == id))
            .filter(|e| actor.map_or(true, |a| e.actor == Some(a)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-walk the chain checking both links and hashes.
    pub fn verify(&self) -> ChainIntegrity {
        let entries = self.entries.read();
        let mut broken_links = 0;
        let mut expected_prev = GENESIS_HASH.to_string();
        for (i, e) in entries.iter().enumerate() {
            // A restored log may start mid-chain.
            let link_ok = i == 0 || e.previous_hash == expected_prev;
            let hash_ok = e.hash
                == chain_hash(
                    &e.previous_hash,
                    &e.action,
                    &e.resource_type,
                    &e.resource_id,
                    e.created_at,
                );
            if !link_ok || !hash_ok {
                broken_links += 1;
            }
            expected_prev = e.hash.clone();
        }
        ChainIntegrity {
            total_events: entries.len(),
            broken_links,
            chain_valid: broken_links == 0,
        }
    }
}
