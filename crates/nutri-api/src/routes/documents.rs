//! # Patient Documents
//!
//! Metadata only. The file bytes live in external object storage; the
//! record carries the name, type, size and an optional content hash.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use nutri_core::{DocumentId, PatientId, Permission};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::patients::{load_patient, visible_patient_ids};
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{check_len, extract_query, extract_validated_json, Validate};
use crate::state::{AppState, DocumentRecord};

/// Largest accepted document.
pub const MAX_DOCUMENT_BYTES: u64 = 25 * 1024 * 1024;

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "text/plain",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterDocumentRequest {
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    pub title: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the content.
    pub sha256: Option<String>,
}

impl Validate for RegisterDocumentRequest {
    fn validate(&self) -> Result<(), String> {
        check_len("title", &self.title, 200)?;
        let name = self.file_name.trim();
        if name.is_empty()
            || name.len() > 255
            || name.contains(['/', '\\'])
            || name.starts_with('.')
        {
            return Err("file_name must be a plain file name".into());
        }
        if !ALLOWED_CONTENT_TYPES.contains(&self.content_type.as_str()) {
            return Err(format!("content_type '{}' is not accepted", self.content_type));
        }
        if self.size_bytes == 0 || self.size_bytes > MAX_DOCUMENT_BYTES {
            return Err(format!("size_bytes must be 1-{MAX_DOCUMENT_BYTES}"));
        }
        if let Some(hash) = &self.sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("sha256 must be 64 hex characters".into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct DocumentListQuery {
    pub patient_id: Option<Uuid>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/documents", get(list_documents).post(register_document))
        .route("/v1/documents/:id", get(get_document).delete(delete_document))
}

fn load_document(
    state: &AppState,
    caller: &CallerIdentity,
    id: Uuid,
) -> Result<DocumentRecord, AppError> {
    let doc = state
        .documents
        .get(&id)
        .ok_or_else(|| AppError::not_found("document", id))?;
    load_patient(state, caller, doc.patient_id).map_err(|_| AppError::not_found("document", id))?;
    Ok(doc)
}

/// GET /v1/documents — Documents of visible patients, newest first.
#[utoipa::path(
    get,
    path = "/v1/documents",
    params(DocumentListQuery),
    responses((status = 200, description = "Documents", body = Vec<DocumentRecord>)),
    tag = "documents"
)]
async fn list_documents(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<DocumentListQuery>, QueryRejection>,
) -> Result<Json<Vec<DocumentRecord>>, AppError> {
    require_permission(&caller, Permission::DocumentsRead)?;
    let q = extract_query(query)?;
    let visible = visible_patient_ids(&state, &caller);
    let mut docs = state.documents.filter(|d| {
        visible.contains(&d.patient_id) && q.patient_id.map_or(true, |p| d.patient_id.as_uuid() == &p)
    });
    docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(docs))
}

/// POST /v1/documents — Register document metadata.
#[utoipa::path(
    post,
    path = "/v1/documents",
    request_body = RegisterDocumentRequest,
    responses(
        (status = 201, description = "Registered", body = DocumentRecord),
        (status = 400, description = "Validation error", body = crate::error::ErrorBody),
        (status = 404, description = "Patient not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "documents"
)]
async fn register_document(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<RegisterDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DocumentRecord>), AppError> {
    require_permission(&caller, Permission::DocumentsWrite)?;
    let req = extract_validated_json(body)?;
    load_patient(&state, &caller, req.patient_id)?;
    let doc = DocumentRecord {
        id: DocumentId::new(),
        patient_id: req.patient_id,
        title: req.title.trim().to_string(),
        file_name: req.file_name.trim().to_string(),
        content_type: req.content_type,
        size_bytes: req.size_bytes,
        sha256: req.sha256.map(|h| h.to_ascii_lowercase()),
        uploaded_by: caller.user_id(),
        created_at: Utc::now(),
    };
    state.documents.insert(*doc.id.as_uuid(), doc.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "document.create",
            "document",
            doc.id,
            serde_json::json!({ "patient_id": doc.patient_id, "file_name": doc.file_name }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(doc)))
}

/// GET /v1/documents/:id — Get document metadata.
#[utoipa::path(
    get,
    path = "/v1/documents/{id}",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 200, description = "Document", body = DocumentRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "documents"
)]
async fn get_document(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentRecord>, AppError> {
    require_permission(&caller, Permission::DocumentsRead)?;
    load_document(&state, &caller, id).map(Json)
}

/// DELETE /v1/documents/:id — Delete document metadata.
#[utoipa::path(
    delete,
    path = "/v1/documents/{id}",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "documents"
)]
async fn delete_document(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::DocumentsWrite)?;
    load_document(&state, &caller, id)?;
    state.documents.remove(&id);
    state
        .record_audit(Some(caller.user_id()), "document.delete", "document", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}
