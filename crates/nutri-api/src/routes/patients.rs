//! # Patient Files
//!
//! Patient visibility is scoped: callers without `patients.read_all` only
//! see patients whose `dietitian_ids` include them. A patient outside the
//! caller's scope answers 404, exactly like a missing one, so that ids
//! cannot be probed. Deleting a patient clears its `active` flag.

use std::collections::BTreeMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use nutri_core::custom_field::validate_all;
use nutri_core::{CustomFieldTarget, Email, PatientId, Permission, UserId};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query, extract_validated_json, Validate};
use crate::state::{AppState, PatientRecord};

// ── Request DTOs ────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePatientRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub notes: Option<String>,
    /// Users to link. The creator is linked automatically unless they can
    /// already see every patient.
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub dietitian_ids: Vec<UserId>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

impl Validate for CreatePatientRequest {
    fn validate(&self) -> Result<(), String> {
        validate_name("first_name", &self.first_name)?;
        validate_name("last_name", &self.last_name)?;
        if let Some(email) = &self.email {
            Email::new(email).map_err(|e| e.to_string())?;
        }
        validate_birth_date(self.birth_date)
    }
}

/// Partial update. Omitted fields keep their value.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePatientRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl Validate for UpdatePatientRequest {
    fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.first_name {
            validate_name("first_name", name)?;
        }
        if let Some(name) = &self.last_name {
            validate_name("last_name", name)?;
        }
        if let Some(email) = &self.email {
            Email::new(email).map_err(|e| e.to_string())?;
        }
        validate_birth_date(self.birth_date)
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), String> {
    let len = value.trim().len();
    if len == 0 || len > 100 {
        return Err(format!("{field} must be 1-100 characters"));
    }
    Ok(())
}

fn validate_birth_date(date: Option<NaiveDate>) -> Result<(), String> {
    match date {
        Some(d) if d > Utc::now().date_naive() => Err("birth_date must not be in the future".into()),
        _ => Ok(()),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LinkDietitianRequest {
    #[schema(value_type = String)]
    pub user_id: UserId,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct PatientListQuery {
    /// Case-insensitive match on name or email.
    pub q: Option<String>,
    /// Only patients linked to this user.
    pub dietitian_id: Option<Uuid>,
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/patients", get(list_patients).post(create_patient))
        .route(
            "/v1/patients/:id",
            get(get_patient).put(update_patient).delete(delete_patient),
        )
        .route("/v1/patients/:id/dietitians", post(link_dietitian))
        .route(
            "/v1/patients/:id/dietitians/:user_id",
            delete(unlink_dietitian),
        )
        .route("/v1/patients/:id/custom-fields", put(replace_custom_fields))
}

// ── Scope helpers ───────────────────────────────────────────────────

/// Load an active patient the caller may see, or 404.
pub(crate) fn load_patient(
    state: &AppState,
    caller: &CallerIdentity,
    id: PatientId,
) -> Result<PatientRecord, AppError> {
    state
        .patients
        .get(id.as_uuid())
        .filter(|p| p.active && caller.can_access_patient(&p.dietitian_ids))
        .ok_or_else(|| AppError::not_found("patient", id))
}

/// Ids of the active patients visible to the caller.
pub(crate) fn visible_patient_ids(state: &AppState, caller: &CallerIdentity) -> Vec<PatientId> {
    state
        .patients
        .filter(|p| p.active && caller.can_access_patient(&p.dietitian_ids))
        .into_iter()
        .map(|p| p.id)
        .collect()
}

fn ensure_active_user(state: &AppState, id: UserId) -> Result<(), AppError> {
    match state.users.get(id.as_uuid()) {
        Some(u) if u.active => Ok(()),
        _ => Err(AppError::Validation(format!("user {id} does not exist or is inactive"))),
    }
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /v1/patients — Patients visible to the caller, by last name.
#[utoipa::path(
    get,
    path = "/v1/patients",
    params(PatientListQuery),
    responses((status = 200, description = "Patients", body = Vec<PatientRecord>)),
    tag = "patients"
)]
async fn list_patients(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<PatientListQuery>, QueryRejection>,
) -> Result<Json<Vec<PatientRecord>>, AppError> {
    require_permission(&caller, Permission::PatientsRead)?;
    let query = extract_query(query)?;
    let needle = query.q.as_deref().map(|q| q.trim().to_lowercase());
    let dietitian = query.dietitian_id.map(UserId::from_uuid);

    let mut patients = state.patients.filter(|p| {
        p.active
            && caller.can_access_patient(&p.dietitian_ids)
            && dietitian.map_or(true, |d| p.dietitian_ids.contains(&d))
            && needle.as_deref().map_or(true, |n| {
                p.full_name().to_lowercase().contains(n)
                    || p.email.as_ref().is_some_and(|e| e.as_str().contains(n))
            })
    });
    patients.sort_by(|a, b| {
        (a.last_name.to_lowercase(), a.first_name.to_lowercase())
            .cmp(&(b.last_name.to_lowercase(), b.first_name.to_lowercase()))
    });
    Ok(Json(patients))
}

/// POST /v1/patients — Create a patient.
#[utoipa::path(
    post,
    path = "/v1/patients",
    request_body = CreatePatientRequest,
    responses(
        (status = 201, description = "Patient created", body = PatientRecord),
        (status = 400, description = "Validation error", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn create_patient(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreatePatientRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PatientRecord>), AppError> {
    require_permission(&caller, Permission::PatientsWrite)?;
    let req = extract_validated_json(body)?;
    validate_all(&state.custom_fields.list(), CustomFieldTarget::Patient, &req.custom_fields)?;

    let mut dietitian_ids: Vec<UserId> = Vec::new();
    for id in req.dietitian_ids {
        ensure_active_user(&state, id)?;
        if !dietitian_ids.contains(&id) {
            dietitian_ids.push(id);
        }
    }
    if !caller.has(Permission::PatientsReadAll) && !dietitian_ids.contains(&caller.user_id()) {
        dietitian_ids.push(caller.user_id());
    }

    let now = Utc::now();
    let patient = PatientRecord {
        id: PatientId::new(),
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        email: req.email.as_deref().map(Email::new).transpose()?,
        phone: req.phone,
        birth_date: req.birth_date,
        notes: req.notes,
        dietitian_ids,
        custom_fields: req.custom_fields,
        active: true,
        created_by: caller.user_id(),
        created_at: now,
        updated_at: now,
    };
    state.persist_patient(&patient).await?;
    state.patients.insert(*patient.id.as_uuid(), patient.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "patient.create",
            "patient",
            patient.id,
            serde_json::json!({}),
        )
        .await;
    Ok((StatusCode::CREATED, Json(patient)))
}

/// GET /v1/patients/:id — Get a patient.
#[utoipa::path(
    get,
    path = "/v1/patients/{id}",
    params(("id" = Uuid, Path, description = "Patient ID")),
    responses(
        (status = 200, description = "Patient", body = PatientRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn get_patient(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<PatientRecord>, AppError> {
    require_permission(&caller, Permission::PatientsRead)?;
    load_patient(&state, &caller, PatientId::from_uuid(id)).map(Json)
}

/// PUT /v1/patients/:id — Update a patient.
#[utoipa::path(
    put,
    path = "/v1/patients/{id}",
    params(("id" = Uuid, Path, description = "Patient ID")),
    request_body = UpdatePatientRequest,
    responses(
        (status = 200, description = "Updated", body = PatientRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn update_patient(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<UpdatePatientRequest>, JsonRejection>,
) -> Result<Json<PatientRecord>, AppError> {
    require_permission(&caller, Permission::PatientsWrite)?;
    let patient_id = PatientId::from_uuid(id);
    load_patient(&state, &caller, patient_id)?;
    let req = extract_validated_json(body)?;
    let email = req.email.as_deref().map(Email::new).transpose()?;

    let (updated, ()) = state
        .commit_patient(patient_id, |p| {
            if let Some(v) = &req.first_name {
                p.first_name = v.trim().to_string();
            }
            if let Some(v) = &req.last_name {
                p.last_name = v.trim().to_string();
            }
            if email.is_some() {
                p.email = email;
            }
            if req.phone.is_some() {
                p.phone = req.phone.clone();
            }
            if req.birth_date.is_some() {
                p.birth_date = req.birth_date;
            }
            if req.notes.is_some() {
                p.notes = req.notes.clone();
            }
            p.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(Some(caller.user_id()), "patient.update", "patient", id, serde_json::json!({}))
        .await;
    Ok(Json(updated))
}

/// DELETE /v1/patients/:id — Soft-delete a patient.
#[utoipa::path(
    delete,
    path = "/v1/patients/{id}",
    params(("id" = Uuid, Path, description = "Patient ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn delete_patient(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::PatientsDelete)?;
    load_patient(&state, &caller, PatientId::from_uuid(id))?;
    state
        .commit_patient(PatientId::from_uuid(id), |p| {
            p.active = false;
            p.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(Some(caller.user_id()), "patient.delete", "patient", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/patients/:id/dietitians — Link a user to a patient.
#[utoipa::path(
    post,
    path = "/v1/patients/{id}/dietitians",
    params(("id" = Uuid, Path, description = "Patient ID")),
    request_body = LinkDietitianRequest,
    responses(
        (status = 200, description = "Linked", body = PatientRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn link_dietitian(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<LinkDietitianRequest>, JsonRejection>,
) -> Result<Json<PatientRecord>, AppError> {
    require_permission(&caller, Permission::PatientsWrite)?;
    load_patient(&state, &caller, PatientId::from_uuid(id))?;
    let req = extract_json(body)?;
    ensure_active_user(&state, req.user_id)?;
    let (updated, ()) = state
        .commit_patient(PatientId::from_uuid(id), |p| {
            if !p.dietitian_ids.contains(&req.user_id) {
                p.dietitian_ids.push(req.user_id);
                p.updated_at = Utc::now();
            }
            Ok(())
        })
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            "patient.link_dietitian",
            "patient",
            id,
            serde_json::json!({ "user_id": req.user_id }),
        )
        .await;
    Ok(Json(updated))
}

/// DELETE /v1/patients/:id/dietitians/:user_id — Unlink a user.
#[utoipa::path(
    delete,
    path = "/v1/patients/{id}/dietitians/{user_id}",
    params(
        ("id" = Uuid, Path, description = "Patient ID"),
        ("user_id" = Uuid, Path, description = "User ID"),
    ),
    responses(
        (status = 200, description = "Unlinked", body = PatientRecord),
        (status = 404, description = "Not found or not linked", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn unlink_dietitian(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<PatientRecord>, AppError> {
    require_permission(&caller, Permission::PatientsWrite)?;
    load_patient(&state, &caller, PatientId::from_uuid(id))?;
    let user_id = UserId::from_uuid(user_id);
    let (updated, ()) = state
        .commit_patient(PatientId::from_uuid(id), |p| {
            let before = p.dietitian_ids.len();
            p.dietitian_ids.retain(|d| *d != user_id);
            if p.dietitian_ids.len() == before {
                return Err(AppError::not_found("dietitian link", user_id));
            }
            p.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            "patient.unlink_dietitian",
            "patient",
            id,
            serde_json::json!({ "user_id": user_id }),
        )
        .await;
    Ok(Json(updated))
}

/// PUT /v1/patients/:id/custom-fields — Replace all custom field values.
#[utoipa::path(
    put,
    path = "/v1/patients/{id}/custom-fields",
    params(("id" = Uuid, Path, description = "Patient ID")),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Saved", body = PatientRecord),
        (status = 400, description = "Unknown field, missing required field or wrong type", body = crate::error::ErrorBody),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "patients"
)]
async fn replace_custom_fields(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<BTreeMap<String, serde_json::Value>>, JsonRejection>,
) -> Result<Json<PatientRecord>, AppError> {
    require_permission(&caller, Permission::PatientsWrite)?;
    load_patient(&state, &caller, PatientId::from_uuid(id))?;
    let values = extract_json(body)?;
    validate_all(&state.custom_fields.list(), CustomFieldTarget::Patient, &values)?;
    let keys: Vec<String> = values.keys().cloned().collect();
    let (updated, ()) = state
        .commit_patient(PatientId::from_uuid(id), |p| {
            p.custom_fields = values;
            p.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            "patient.custom_fields",
            "patient",
            id,
            serde_json::json!({ "keys": keys }),
        )
        .await;
    Ok(Json(updated))
}
