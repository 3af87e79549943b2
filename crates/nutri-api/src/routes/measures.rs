//! # Measures
//!
//! Measure definitions (including calculated ones such as BMI) and the
//! per-patient measurement history. Recording numeric values recomputes
//! every calculated measure that depends on them, directly or through
//! another calculated measure, and stores the results as derived
//! measurements.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use nutri_core::{
    Formula, MeasureDefinition, MeasureId, MeasureKind, PatientId, Permission, ValidationError,
    VisitId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::patients::load_patient;
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query, extract_validated_json, Validate};
use crate::state::{AppState, MeasurementRecord};

// ── DTOs ────────────────────────────────────────────────────────────

/// A measure definition as exposed over HTTP.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeasureDefinitionView {
    #[schema(value_type = String)]
    pub id: MeasureId,
    pub code: String,
    pub name: String,
    pub unit: Option<String>,
    /// `numeric`, `text`, `boolean` or `calculated`.
    #[schema(value_type = String)]
    pub kind: MeasureKind,
    pub formula: Option<String>,
    /// Codes the formula reads.
    pub inputs: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl From<&MeasureDefinition> for MeasureDefinitionView {
    fn from(d: &MeasureDefinition) -> Self {
        Self {
            id: d.id,
            code: d.code.clone(),
            name: d.name.clone(),
            unit: d.unit.clone(),
            kind: d.kind,
            formula: d.formula.as_ref().map(|f| f.source().to_string()),
            inputs: d
                .formula
                .as_ref()
                .map(|f| f.variables().into_iter().collect())
                .unwrap_or_default(),
            min: d.min,
            max: d.max,
        }
    }
}

/// Create a definition, or replace the one with the same code.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveMeasureRequest {
    pub code: String,
    pub name: String,
    pub unit: Option<String>,
    #[schema(value_type = String)]
    pub kind: MeasureKind,
    pub formula: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateFormulaRequest {
    pub formula: String,
    /// Optional sample values to evaluate the formula against.
    #[serde(default)]
    pub sample: HashMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FormulaCheck {
    pub valid: bool,
    pub error: Option<String>,
    pub variables: Vec<String>,
    /// Variables that are not numeric or calculated measure codes.
    pub unknown_variables: Vec<String>,
    /// Result for `sample`, when every variable was supplied.
    pub result: Option<f64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordMeasuresRequest {
    #[schema(value_type = Option<String>)]
    pub visit_id: Option<VisitId>,
    /// Defaults to now.
    pub measured_at: Option<DateTime<Utc>>,
    /// Measure code → value.
    #[schema(value_type = Object)]
    pub values: BTreeMap<String, Value>,
}

impl Validate for RecordMeasuresRequest {
    fn validate(&self) -> Result<(), String> {
        if self.values.is_empty() {
            return Err("values must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct MeasurementQuery {
    /// Only this measure code.
    pub code: Option<String>,
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/measures/definitions",
            get(list_definitions).post(save_definition),
        )
        .route("/v1/measures/definitions/:id", delete(delete_definition))
        .route("/v1/measures/formula/validate", post(validate_formula))
        .route(
            "/v1/patients/:id/measures",
            get(list_measurements).post(record_measurements),
        )
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /v1/measures/definitions — Measure definitions by code.
#[utoipa::path(
    get,
    path = "/v1/measures/definitions",
    responses((status = 200, description = "Definitions", body = Vec<MeasureDefinitionView>)),
    tag = "measures"
)]
async fn list_definitions(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<MeasureDefinitionView>>, AppError> {
    require_permission(&caller, Permission::MeasuresRead)?;
    let defs = state
        .measures
        .read()
        .definitions()
        .map(MeasureDefinitionView::from)
        .collect();
    Ok(Json(defs))
}

/// POST /v1/measures/definitions — Create or replace a definition.
#[utoipa::path(
    post,
    path = "/v1/measures/definitions",
    request_body = SaveMeasureRequest,
    responses(
        (status = 201, description = "Created", body = MeasureDefinitionView),
        (status = 200, description = "Replaced", body = MeasureDefinitionView),
        (status = 400, description = "Invalid code, formula, bounds or dependency cycle", body = crate::error::ErrorBody),
    ),
    tag = "measures"
)]
async fn save_definition(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<SaveMeasureRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MeasureDefinitionView>), AppError> {
    require_permission(&caller, Permission::MeasuresManage)?;
    let req = extract_json(body)?;
    let formula = req.formula.as_deref().map(Formula::parse).transpose()?;
    let code = req.code.trim().to_string();

    let (status, view) = {
        let mut catalog = state.measures.write();
        let existing = catalog.get(&code).map(|d| d.id);
        let def = MeasureDefinition {
            id: existing.unwrap_or_default(),
            code: code.clone(),
            name: req.name.trim().to_string(),
            unit: req.unit,
            kind: req.kind,
            formula,
            min: req.min,
            max: req.max,
        };
        let view = MeasureDefinitionView::from(&def);
        catalog.upsert(def)?;
        let status = if existing.is_some() {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        (status, view)
    };
    state
        .record_audit(
            Some(caller.user_id()),
            "measure.save",
            "measure",
            view.id,
            serde_json::json!({ "code": view.code, "formula": view.formula }),
        )
        .await;
    Ok((status, Json(view)))
}

/// DELETE /v1/measures/definitions/:id — Remove a definition.
#[utoipa::path(
    delete,
    path = "/v1/measures/definitions/{id}",
    params(("id" = Uuid, Path, description = "Measure ID")),
    responses(
        (status = 204, description = "Removed"),
        (status = 400, description = "A calculated measure depends on it", body = crate::error::ErrorBody),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "measures"
)]
async fn delete_definition(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::MeasuresManage)?;
    let measure_id = MeasureId::from_uuid(id);
    let code = {
        let mut catalog = state.measures.write();
        let code = catalog
            .get_by_id(&measure_id)
            .map(|d| d.code.clone())
            .ok_or_else(|| AppError::not_found("measure", id))?;
        catalog.remove(&code)?;
        code
    };
    state
        .record_audit(
            Some(caller.user_id()),
            "measure.delete",
            "measure",
            id,
            serde_json::json!({ "code": code }),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/measures/formula/validate — Check a formula without saving it.
#[utoipa::path(
    post,
    path = "/v1/measures/formula/validate",
    request_body = ValidateFormulaRequest,
    responses((status = 200, description = "Check result", body = FormulaCheck)),
    tag = "measures"
)]
async fn validate_formula(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<ValidateFormulaRequest>, JsonRejection>,
) -> Result<Json<FormulaCheck>, AppError> {
    require_permission(&caller, Permission::MeasuresRead)?;
    let req = extract_json(body)?;
    let formula = match Formula::parse(&req.formula) {
        Ok(f) => f,
        Err(e) => {
            return Ok(Json(FormulaCheck {
                valid: false,
                error: Some(e.to_string()),
                variables: Vec::new(),
                unknown_variables: Vec::new(),
                result: None,
            }))
        }
    };
    let variables: Vec<String> = formula.variables().into_iter().collect();
    let unknown_variables: Vec<String> = {
        let catalog = state.measures.read();
        variables
            .iter()
            .filter(|v| !catalog.get(v).is_some_and(|d| d.kind.is_numeric()))
            .cloned()
            .collect()
    };
    let (result, error) = if req.sample.is_empty() {
        (None, None)
    } else {
        match formula.evaluate(&req.sample) {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e.to_string())),
        }
    };
    Ok(Json(FormulaCheck {
        valid: unknown_variables.is_empty() && error.is_none(),
        error: error.or_else(|| {
            (!unknown_variables.is_empty())
                .then(|| format!("unknown measures: {}", unknown_variables.join(", ")))
        }),
        variables,
        unknown_variables,
        result,
    }))
}

/// GET /v1/patients/:id/measures — A patient's measurements, newest first.
#[utoipa::path(
    get,
    path = "/v1/patients/{id}/measures",
    params(("id" = Uuid, Path, description = "Patient ID"), MeasurementQuery),
    responses(
        (status = 200, description = "Measurements", body = Vec<MeasurementRecord>),
        (status = 404, description = "Patient not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "measures"
)]
async fn list_measurements(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    query: Result<Query<MeasurementQuery>, QueryRejection>,
) -> Result<Json<Vec<MeasurementRecord>>, AppError> {
    require_permission(&caller, Permission::MeasuresRead)?;
    let patient = load_patient(&state, &caller, PatientId::from_uuid(id))?;
    let q = extract_query(query)?;
    let mut records = state.measurements.filter(|m| {
        m.patient_id == patient.id && q.code.as_deref().map_or(true, |c| m.code == c)
    });
    records.sort_by(|a, b| b.measured_at.cmp(&a.measured_at));
    Ok(Json(records))
}

/// POST /v1/patients/:id/measures — Record measure values.
///
/// Returns the stored records, derived values included.
#[utoipa::path(
    post,
    path = "/v1/patients/{id}/measures",
    params(("id" = Uuid, Path, description = "Patient ID")),
    request_body = RecordMeasuresRequest,
    responses(
        (status = 201, description = "Recorded", body = Vec<MeasurementRecord>),
        (status = 400, description = "Unknown code, wrong type or out of bounds", body = crate::error::ErrorBody),
        (status = 404, description = "Patient not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "measures"
)]
async fn record_measurements(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<RecordMeasuresRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Vec<MeasurementRecord>>), AppError> {
    require_permission(&caller, Permission::MeasuresWrite)?;
    let patient = load_patient(&state, &caller, PatientId::from_uuid(id))?;
    let req = extract_validated_json(body)?;
    if let Some(visit_id) = req.visit_id {
        match state.visits.get(visit_id.as_uuid()) {
            Some(v) if v.patient_id == patient.id => {}
            _ => return Err(AppError::not_found("visit", visit_id)),
        }
    }
    let measured_at = req.measured_at.unwrap_or_else(Utc::now);

    let catalog = state.measures.read().clone();
    for (code, value) in &req.values {
        let def = catalog.get(code).ok_or_else(|| ValidationError::Measure {
            code: code.clone(),
            reason: "unknown measure".into(),
        })?;
        check_value(def, value)?;
    }

    let record = |code: &str, value: Value, derived: bool| MeasurementRecord {
        id: Uuid::new_v4(),
        patient_id: patient.id,
        visit_id: req.visit_id,
        code: code.to_string(),
        value,
        derived,
        measured_at,
        recorded_by: caller.user_id(),
    };
    let mut created: Vec<MeasurementRecord> = req
        .values
        .iter()
        .map(|(code, value)| record(code, value.clone(), false))
        .collect();

    // Latest numeric inputs for this patient, overlaid with the new values.
    let mut history = state
        .measurements
        .filter(|m| m.patient_id == patient.id && !m.derived && m.measured_at <= measured_at);
    history.sort_by_key(|m| m.measured_at);
    let mut inputs: HashMap<String, f64> = HashMap::new();
    for m in history.iter().chain(created.iter()) {
        if let Some(v) = m.value.as_f64() {
            inputs.insert(m.code.clone(), v);
        }
    }

    let derived = catalog.compute_derived(&inputs);
    let mut changed: BTreeSet<String> = req.values.keys().cloned().collect();
    loop {
        let before = changed.len();
        for def in catalog.definitions() {
            let Some(formula) = &def.formula else { continue };
            if derived.contains_key(&def.code)
                && formula.variables().iter().any(|v| changed.contains(v))
            {
                changed.insert(def.code.clone());
            }
        }
        if changed.len() == before {
            break;
        }
    }
    for (code, value) in &derived {
        if changed.contains(code) && !req.values.contains_key(code) {
            created.push(record(code, serde_json::json!(round2(*value)), true));
        }
    }

    for m in &created {
        state.measurements.insert(m.id, m.clone());
    }
    let codes: Vec<&str> = created.iter().map(|m| m.code.as_str()).collect();
    state
        .record_audit(
            Some(caller.user_id()),
            "measure.record",
            "patient",
            patient.id,
            serde_json::json!({ "codes": codes }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Check that `value` matches the definition's kind and bounds.
fn check_value(def: &MeasureDefinition, value: &Value) -> Result<(), AppError> {
    let type_error = |expected: &str| ValidationError::Measure {
        code: def.code.clone(),
        reason: format!("expected a {expected} value"),
    };
    match def.kind {
        MeasureKind::Numeric => {
            let v = value.as_f64().ok_or_else(|| type_error("numeric"))?;
            def.check_value(v)?;
        }
        MeasureKind::Text => {
            value.as_str().ok_or_else(|| type_error("text"))?;
        }
        MeasureKind::Boolean => {
            value.as_bool().ok_or_else(|| type_error("boolean"))?;
        }
        MeasureKind::Calculated => {
            return Err(ValidationError::Measure {
                code: def.code.clone(),
                reason: "calculated measures are computed, not recorded".into(),
            }
            .into())
        }
    }
    Ok(())
}
