//! # Custom Field Definitions
//!
//! Practice-defined extra fields on patients and visits. Values are
//! validated against these definitions whenever a record's fields are
//! written.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use nutri_core::{CustomFieldDefinition, CustomFieldId, CustomFieldTarget, CustomFieldType, Permission};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CustomFieldView {
    #[schema(value_type = String)]
    pub id: CustomFieldId,
    pub key: String,
    pub label: String,
    /// `{"type": "select", "options": [...]}` or `{"type": "text"}` etc.
    #[schema(value_type = Object)]
    pub field_type: CustomFieldType,
    pub required: bool,
    /// `patient` or `visit`.
    #[schema(value_type = String)]
    pub target: CustomFieldTarget,
}

impl From<&CustomFieldDefinition> for CustomFieldView {
    fn from(d: &CustomFieldDefinition) -> Self {
        Self {
            id: d.id,
            key: d.key.clone(),
            label: d.label.clone(),
            field_type: d.field_type.clone(),
            required: d.required,
            target: d.target,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCustomFieldRequest {
    pub key: String,
    pub label: String,
    #[schema(value_type = Object)]
    pub field_type: CustomFieldType,
    #[serde(default)]
    pub required: bool,
    #[schema(value_type = String)]
    pub target: CustomFieldTarget,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CustomFieldQuery {
    /// `patient` or `visit`.
    #[param(value_type = Option<String>)]
    pub target: Option<CustomFieldTarget>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/custom-fields", get(list_fields).post(create_field))
        .route("/v1/custom-fields/:id", delete(delete_field))
}

/// GET /v1/custom-fields — Definitions by target and key.
#[utoipa::path(
    get,
    path = "/v1/custom-fields",
    params(CustomFieldQuery),
    responses((status = 200, description = "Definitions", body = Vec<CustomFieldView>)),
    tag = "custom_fields"
)]
async fn list_fields(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<CustomFieldQuery>, QueryRejection>,
) -> Result<Json<Vec<CustomFieldView>>, AppError> {
    require_permission(&caller, Permission::CustomFieldsRead)?;
    let q = extract_query(query)?;
    let mut defs = state
        .custom_fields
        .filter(|d| q.target.map_or(true, |t| d.target == t));
    defs.sort_by(|a, b| {
        (a.target == CustomFieldTarget::Visit, &a.key).cmp(&(b.target == CustomFieldTarget::Visit, &b.key))
    });
    Ok(Json(defs.iter().map(CustomFieldView::from).collect()))
}

/// POST /v1/custom-fields — Define a custom field.
#[utoipa::path(
    post,
    path = "/v1/custom-fields",
    request_body = CreateCustomFieldRequest,
    responses(
        (status = 201, description = "Created", body = CustomFieldView),
        (status = 400, description = "Invalid key, label or options", body = crate::error::ErrorBody),
        (status = 409, description = "Key already defined for the target", body = crate::error::ErrorBody),
    ),
    tag = "custom_fields"
)]
async fn create_field(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateCustomFieldRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CustomFieldView>), AppError> {
    require_permission(&caller, Permission::CustomFieldsManage)?;
    let req = extract_json(body)?;
    let def = CustomFieldDefinition {
        id: CustomFieldId::new(),
        key: req.key.trim().to_string(),
        label: req.label.trim().to_string(),
        field_type: req.field_type,
        required: req.required,
        target: req.target,
    };
    def.validate()?;
    if state
        .custom_fields
        .find(|d| d.target == def.target && d.key == def.key)
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "custom field '{}' already exists",
            def.key
        )));
    }
    state.custom_fields.insert(*def.id.as_uuid(), def.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "custom_field.create",
            "custom_field",
            def.id,
            serde_json::json!({ "key": def.key, "target": def.target }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(CustomFieldView::from(&def))))
}

/// DELETE /v1/custom-fields/:id — Remove a definition that holds no values.
#[utoipa::path(
    delete,
    path = "/v1/custom-fields/{id}",
    params(("id" = Uuid, Path, description = "Custom field ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
        (status = 409, description = "Records still hold values", body = crate::error::ErrorBody),
    ),
    tag = "custom_fields"
)]
async fn delete_field(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::CustomFieldsManage)?;
    let def = state
        .custom_fields
        .get(&id)
        .ok_or_else(|| AppError::not_found("custom field", id))?;
    let in_use = match def.target {
        CustomFieldTarget::Patient => state
            .patients
            .filter(|p| p.custom_fields.contains_key(&def.key))
            .len(),
        CustomFieldTarget::Visit => state
            .visits
            .filter(|v| v.custom_fields.contains_key(&def.key))
            .len(),
    };
    if in_use > 0 {
        return Err(AppError::Conflict(format!(
            "custom field '{}' holds values on {in_use} records",
            def.key
        )));
    }
    state.custom_fields.remove(&id);
    state
        .record_audit(
            Some(caller.user_id()),
            "custom_field.delete",
            "custom_field",
            id,
            serde_json::json!({ "key": def.key }),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}
