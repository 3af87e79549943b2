//! # Visits
//!
//! A visit is visible when its patient is. Visits are hard-deleted.

use std::collections::BTreeMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use nutri_core::custom_field::validate_all;
use nutri_core::{CustomFieldTarget, PatientId, Permission, UserId, VisitId};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::patients::load_patient;
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_query, extract_validated_json, Validate};
use crate::state::{AppState, PatientRecord, VisitRecord, VisitStatus};

const MAX_DURATION_MINUTES: u32 = 480;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateVisitRequest {
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    /// Defaults to the caller.
    #[schema(value_type = Option<String>)]
    pub dietitian_id: Option<UserId>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default = "default_duration")]
    pub duration_minutes: u32,
    pub notes: Option<String>,
    pub next_visit_date: Option<NaiveDate>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

fn default_duration() -> u32 {
    45
}

fn validate_duration(minutes: u32) -> Result<(), String> {
    if minutes == 0 || minutes > MAX_DURATION_MINUTES {
        return Err(format!("duration_minutes must be 1-{MAX_DURATION_MINUTES}"));
    }
    Ok(())
}

impl Validate for CreateVisitRequest {
    fn validate(&self) -> Result<(), String> {
        validate_duration(self.duration_minutes)?;
        if let Some(next) = self.next_visit_date {
            if next < self.scheduled_at.date_naive() {
                return Err("next_visit_date must not precede the visit".into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateVisitRequest {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
    pub status: Option<VisitStatus>,
    pub notes: Option<String>,
    pub next_visit_date: Option<NaiveDate>,
    /// Replaces every custom field value when present.
    #[schema(value_type = Option<Object>)]
    pub custom_fields: Option<BTreeMap<String, serde_json::Value>>,
}

impl Validate for UpdateVisitRequest {
    fn validate(&self) -> Result<(), String> {
        if let Some(minutes) = self.duration_minutes {
            validate_duration(minutes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct VisitListQuery {
    pub patient_id: Option<Uuid>,
    pub dietitian_id: Option<Uuid>,
    pub status: Option<VisitStatus>,
    /// Inclusive lower bound on `scheduled_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `scheduled_at`.
    pub to: Option<DateTime<Utc>>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/visits", get(list_visits).post(create_visit))
        .route(
            "/v1/visits/:id",
            get(get_visit).put(update_visit).delete(delete_visit),
        )
}

/// Load a visit together with its patient, or 404 if either is out of scope.
pub(crate) fn load_visit(
    state: &AppState,
    caller: &CallerIdentity,
    id: VisitId,
) -> Result<(VisitRecord, PatientRecord), AppError> {
    let visit = state
        .visits
        .get(id.as_uuid())
        .ok_or_else(|| AppError::not_found("visit", id))?;
    let patient =
        load_patient(state, caller, visit.patient_id).map_err(|_| AppError::not_found("visit", id))?;
    Ok((visit, patient))
}

/// GET /v1/visits — Visits of visible patients, by scheduled time.
#[utoipa::path(
    get,
    path = "/v1/visits",
    params(VisitListQuery),
    responses((status = 200, description = "Visits", body = Vec<VisitRecord>)),
    tag = "visits"
)]
async fn list_visits(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<VisitListQuery>, QueryRejection>,
) -> Result<Json<Vec<VisitRecord>>, AppError> {
    require_permission(&caller, Permission::VisitsRead)?;
    let q = extract_query(query)?;
    let visible = super::patients::visible_patient_ids(&state, &caller);
    let mut visits = state.visits.filter(|v| {
        visible.contains(&v.patient_id)
            && q.patient_id.map_or(true, |p| v.patient_id.as_uuid() == &p)
            && q.dietitian_id.map_or(true, |d| v.dietitian_id.as_uuid() == &d)
            && q.status.map_or(true, |s| v.status == s)
            && q.from.map_or(true, |from| v.scheduled_at >= from)
            && q.to.map_or(true, |to| v.scheduled_at < to)
    });
    visits.sort_by_key(|v| v.scheduled_at);
    Ok(Json(visits))
}

/// POST /v1/visits — Schedule a visit.
#[utoipa::path(
    post,
    path = "/v1/visits",
    request_body = CreateVisitRequest,
    responses(
        (status = 201, description = "Visit created", body = VisitRecord),
        (status = 400, description = "Validation error", body = crate::error::ErrorBody),
        (status = 404, description = "Patient not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "visits"
)]
async fn create_visit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateVisitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<VisitRecord>), AppError> {
    require_permission(&caller, Permission::VisitsWrite)?;
    let req = extract_validated_json(body)?;
    load_patient(&state, &caller, req.patient_id)?;
    let dietitian_id = req.dietitian_id.unwrap_or_else(|| caller.user_id());
    match state.users.get(dietitian_id.as_uuid()) {
        Some(u) if u.active => {}
        _ => {
            return Err(AppError::Validation(format!(
                "dietitian {dietitian_id} does not exist or is inactive"
            )))
        }
    }
    validate_all(&state.custom_fields.list(), CustomFieldTarget::Visit, &req.custom_fields)?;

    let now = Utc::now();
    let visit = VisitRecord {
        id: VisitId::new(),
        patient_id: req.patient_id,
        dietitian_id,
        scheduled_at: req.scheduled_at,
        duration_minutes: req.duration_minutes,
        status: VisitStatus::Scheduled,
        notes: req.notes,
        next_visit_date: req.next_visit_date,
        custom_fields: req.custom_fields,
        created_at: now,
        updated_at: now,
    };
    state.persist_visit(&visit).await?;
    state.visits.insert(*visit.id.as_uuid(), visit.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "visit.create",
            "visit",
            visit.id,
            serde_json::json!({ "patient_id": visit.patient_id }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(visit)))
}

/// GET /v1/visits/:id — Get a visit.
#[utoipa::path(
    get,
    path = "/v1/visits/{id}",
    params(("id" = Uuid, Path, description = "Visit ID")),
    responses(
        (status = 200, description = "Visit", body = VisitRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "visits"
)]
async fn get_visit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<VisitRecord>, AppError> {
    require_permission(&caller, Permission::VisitsRead)?;
    let (visit, _) = load_visit(&state, &caller, VisitId::from_uuid(id))?;
    Ok(Json(visit))
}

/// PUT /v1/visits/:id — Update a visit.
#[utoipa::path(
    put,
    path = "/v1/visits/{id}",
    params(("id" = Uuid, Path, description = "Visit ID")),
    request_body = UpdateVisitRequest,
    responses(
        (status = 200, description = "Updated", body = VisitRecord),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "visits"
)]
async fn update_visit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<UpdateVisitRequest>, JsonRejection>,
) -> Result<Json<VisitRecord>, AppError> {
    require_permission(&caller, Permission::VisitsWrite)?;
    let (current, _) = load_visit(&state, &caller, VisitId::from_uuid(id))?;
    let req = extract_validated_json(body)?;
    if let Some(fields) = &req.custom_fields {
        validate_all(&state.custom_fields.list(), CustomFieldTarget::Visit, fields)?;
    }
    let previous_status = current.status;
    let (updated, ()) = state
        .commit_visit(VisitId::from_uuid(id), |v| {
            let scheduled = req.scheduled_at.unwrap_or(v.scheduled_at);
            if let Some(next) = req.next_visit_date.or(v.next_visit_date) {
                if next < scheduled.date_naive() {
                    return Err(AppError::Validation(
                        "next_visit_date must not precede the visit".into(),
                    ));
                }
            }
            v.scheduled_at = scheduled;
            if let Some(minutes) = req.duration_minutes {
                v.duration_minutes = minutes;
            }
            if let Some(status) = req.status {
                v.status = status;
            }
            if req.notes.is_some() {
                v.notes = req.notes.clone();
            }
            if req.next_visit_date.is_some() {
                v.next_visit_date = req.next_visit_date;
            }
            if let Some(fields) = req.custom_fields.clone() {
                v.custom_fields = fields;
            }
            v.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            "visit.update",
            "visit",
            id,
            serde_json::json!({ "from_status": previous_status, "status": updated.status }),
        )
        .await;
    Ok(Json(updated))
}

/// DELETE /v1/visits/:id — Delete a visit.
#[utoipa::path(
    delete,
    path = "/v1/visits/{id}",
    params(("id" = Uuid, Path, description = "Visit ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "visits"
)]
async fn delete_visit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::VisitsDelete)?;
    let visit_id = VisitId::from_uuid(id);
    let (visit, _) = load_visit(&state, &caller, visit_id)?;
    state.delete_visit(visit_id).await?;
    state.visits.remove(&id);
    state
        .record_audit(
            Some(caller.user_id()),
            "visit.delete",
            "visit",
            id,
            serde_json::json!({ "patient_id": visit.patient_id }),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}
