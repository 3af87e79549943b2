//! # Audit Trail Queries

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use nutri_core::{Permission, UserId};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::audit::{AuditEntry, ChainIntegrity};
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::extract_query;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AuditQuery {
    /// e.g. `patient`, `invoice`, `user`.
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Acting user ID.
    pub actor: Option<Uuid>,
    /// Defaults to 100, capped at 1000.
    pub limit: Option<usize>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/audit", get(list_audit))
        .route("/v1/audit/verify", get(verify_chain))
}

/// GET /v1/audit — Audit entries, newest first.
#[utoipa::path(
    get,
    path = "/v1/audit",
    params(AuditQuery),
    responses((status = 200, description = "Audit entries", body = Vec<AuditEntry>)),
    tag = "audit"
)]
async fn list_audit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    require_permission(&caller, Permission::AuditRead)?;
    let q = extract_query(query)?;
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.audit.query(
        q.resource_type.as_deref(),
        q.resource_id.as_deref(),
        q.actor.map(UserId::from_uuid),
        limit,
    )))
}

/// GET /v1/audit/verify — Re-walk the hash chain.
#[utoipa::path(
    get,
    path = "/v1/audit/verify",
    responses((status = 200, description = "Chain integrity", body = ChainIntegrity)),
    tag = "audit"
)]
async fn verify_chain(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<ChainIntegrity>, AppError> {
    require_permission(&caller, Permission::AuditRead)?;
    let integrity = state.audit.verify();
    if !integrity.chain_valid {
        tracing::error!(
            broken_links = integrity.broken_links,
            total = integrity.total_events,
            "audit chain integrity check failed"
        );
    }
    Ok(Json(integrity))
}
