//! # AI Follow-Up Drafts & Patient Emails
//!
//! The language model never sees patient data. Visit notes and extra
//! instructions are pseudonymized (real values replaced by `{{name}}`
//! placeholders) before the prompt is built, and the model is asked to
//! write with placeholders only. Real values are substituted into the draft
//! here, by literal string replacement, when the draft is returned and
//! again when an email is sent.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use nutri_core::{Email, EmailLogId, FollowUpContext, Permission, PlaceholderValues, VisitId};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::patients::visible_patient_ids;
use super::visits::load_visit;
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{
    check_len, extract_json, extract_query, extract_validated_json, Validate,
};
use crate::state::{AppState, EmailLogRecord, EmailStatus, PatientRecord, VisitRecord};

// ── DTOs ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct FollowUpRequest {
    /// Extra guidance for the draft, e.g. "focus on hydration".
    pub instructions: Option<String>,
    /// Language of the draft. Defaults to English.
    pub language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FollowUpDraft {
    /// Model output, with placeholders.
    pub draft: String,
    /// Draft with real values substituted.
    pub rendered: String,
    /// Placeholders the model used that have no value.
    pub unresolved: Vec<String>,
    /// Placeholders offered to the model.
    pub placeholders: Vec<String>,
    pub model: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendFollowUpRequest {
    pub subject: String,
    /// Email text; `{{placeholders}}` are substituted before sending.
    pub body: String,
    /// Defaults to the patient's email address.
    pub to: Option<String>,
}

impl Validate for SendFollowUpRequest {
    fn validate(&self) -> Result<(), String> {
        check_len("subject", &self.subject, 200)?;
        if self.body.trim().is_empty() {
            return Err("body must not be empty".into());
        }
        if let Some(to) = &self.to {
            Email::new(to).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct EmailListQuery {
    pub patient_id: Option<Uuid>,
    #[param(value_type = Option<String>)]
    pub status: Option<EmailStatus>,
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/visits/:id/followup", post(generate_followup))
        .route("/v1/visits/:id/followup/send", post(send_followup))
        .route("/v1/emails", get(list_emails))
}

// ── Placeholder context ─────────────────────────────────────────────

/// Latest numeric value of `code` for the patient.
fn latest_value(state: &AppState, patient: &PatientRecord, code: &str) -> Option<f64> {
    state
        .measurements
        .filter(|m| m.patient_id == patient.id && m.code == code)
        .into_iter()
        .max_by_key(|m| m.measured_at)
        .and_then(|m| m.value.as_f64())
}

fn followup_context(state: &AppState, visit: &VisitRecord, patient: &PatientRecord) -> FollowUpContext {
    let dietitian_name = state
        .users
        .get(visit.dietitian_id.as_uuid())
        .map(|u| u.display_name)
        .unwrap_or_default();
    FollowUpContext {
        patient_first_name: patient.first_name.clone(),
        patient_last_name: patient.last_name.clone(),
        dietitian_name,
        visit_date: Some(visit.scheduled_at.date_naive()),
        next_visit_date: visit.next_visit_date,
        weight_kg: latest_value(state, patient, "weight"),
        bmi: latest_value(state, patient, "bmi"),
        practice_name: state.config.practice_name.clone(),
        patient_email: patient.email.as_ref().map(|e| e.as_str().to_string()),
        patient_phone: patient.phone.clone(),
    }
}

fn system_prompt(placeholders: &[String], language: &str) -> String {
    let list = placeholders
        .iter()
        .map(|p| format!("{{{{{p}}}}}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You write short, warm follow-up emails from a dietitian to a patient after a \
         consultation. Write in {language}. Never invent names, dates or measurements. \
         Refer to people, dates and measurements only through these placeholders, written \
         exactly as shown: {list}. Return only the email body."
    )
}

/// The user prompt, with every known real value replaced by its placeholder.
fn user_prompt(values: &PlaceholderValues, notes: Option<&str>, instructions: Option<&str>) -> String {
    let mut prompt = String::from("Consultation notes:\n");
    prompt.push_str(&values.pseudonymize(notes.unwrap_or("(none)")));
    if let Some(extra) = instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nAdditional instructions:\n");
        prompt.push_str(&values.pseudonymize(extra));
    }
    prompt
}

// ── Handlers ────────────────────────────────────────────────────────

/// POST /v1/visits/:id/followup — Draft a follow-up email with the AI provider.
#[utoipa::path(
    post,
    path = "/v1/visits/{id}/followup",
    params(("id" = Uuid, Path, description = "Visit ID")),
    request_body = FollowUpRequest,
    responses(
        (status = 200, description = "Draft", body = FollowUpDraft),
        (status = 404, description = "Visit not found or out of scope", body = crate::error::ErrorBody),
        (status = 502, description = "AI provider failed", body = crate::error::ErrorBody),
        (status = 503, description = "AI provider not configured", body = crate::error::ErrorBody),
    ),
    tag = "followups"
)]
async fn generate_followup(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<FollowUpRequest>, JsonRejection>,
) -> Result<Json<FollowUpDraft>, AppError> {
    require_permission(&caller, Permission::FollowupsGenerate)?;
    let ai = state
        .ai
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("AI provider is not configured".into()))?;
    let (visit, patient) = load_visit(&state, &caller, VisitId::from_uuid(id))?;
    let req = extract_json(body)?;

    let context = followup_context(&state, &visit, &patient);
    let values = context.values();
    let placeholders = context.available_placeholders();
    let language = req.language.as_deref().unwrap_or("English");
    let system = system_prompt(&placeholders, language);
    let prompt = user_prompt(&values, visit.notes.as_deref(), req.instructions.as_deref());

    let draft = ai.complete(&system, &prompt).await?;
    let rendered = values.render(&draft);
    let unresolved: Vec<String> = values.unresolved(&draft).into_iter().collect();
    if !unresolved.is_empty() {
        tracing::warn!(visit_id = %id, ?unresolved, "draft uses unknown placeholders");
    }
    state
        .record_audit(
            Some(caller.user_id()),
            "followup.generate",
            "visit",
            id,
            serde_json::json!({ "model": ai.model() }),
        )
        .await;
    Ok(Json(FollowUpDraft {
        draft,
        rendered,
        unresolved,
        placeholders,
        model: ai.model().to_string(),
    }))
}

/// POST /v1/visits/:id/followup/send — Queue and deliver a follow-up email.
#[utoipa::path(
    post,
    path = "/v1/visits/{id}/followup/send",
    params(("id" = Uuid, Path, description = "Visit ID")),
    request_body = SendFollowUpRequest,
    responses(
        (status = 201, description = "Email logged; `status` tells whether delivery succeeded", body = EmailLogRecord),
        (status = 400, description = "No recipient or unresolved placeholders", body = crate::error::ErrorBody),
        (status = 404, description = "Visit not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "followups"
)]
async fn send_followup(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<SendFollowUpRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EmailLogRecord>), AppError> {
    require_permission(&caller, Permission::EmailsSend)?;
    let (visit, patient) = load_visit(&state, &caller, VisitId::from_uuid(id))?;
    let req = extract_validated_json(body)?;

    let to = match req.to.as_deref() {
        Some(addr) => Email::new(addr)?,
        None => patient
            .email
            .clone()
            .ok_or_else(|| AppError::Validation("patient has no email address".into()))?,
    };
    let values = followup_context(&state, &visit, &patient).values();
    let subject = values.render(req.subject.trim());
    let text = values.render(&req.body);
    let unresolved: Vec<String> = values
        .unresolved(&subject)
        .into_iter()
        .chain(values.unresolved(&text))
        .collect();
    if !unresolved.is_empty() {
        return Err(AppError::Validation(format!(
            "unresolved placeholders: {}",
            unresolved.join(", ")
        )));
    }

    let record = EmailLogRecord {
        id: EmailLogId::new(),
        patient_id: patient.id,
        visit_id: Some(visit.id),
        to,
        subject,
        body: text,
        status: EmailStatus::Queued,
        attempts: 0,
        last_error: None,
        created_by: caller.user_id(),
        created_at: Utc::now(),
        sent_at: None,
    };
    state.emails.insert(*record.id.as_uuid(), record.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "email.queue",
            "email",
            record.id,
            serde_json::json!({ "patient_id": patient.id, "visit_id": visit.id }),
        )
        .await;
    let delivered = crate::mail::deliver_logged(&state, record.id).await?;
    Ok((StatusCode::CREATED, Json(delivered)))
}

/// GET /v1/emails — Email log for visible patients, newest first.
#[utoipa::path(
    get,
    path = "/v1/emails",
    params(EmailListQuery),
    responses((status = 200, description = "Email log", body = Vec<EmailLogRecord>)),
    tag = "followups"
)]
async fn list_emails(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<EmailListQuery>, QueryRejection>,
) -> Result<Json<Vec<EmailLogRecord>>, AppError> {
    require_permission(&caller, Permission::EmailsRead)?;
    let q = extract_query(query)?;
    let visible = visible_patient_ids(&state, &caller);
    let mut emails = state.emails.filter(|e| {
        visible.contains(&e.patient_id)
            && q.patient_id.map_or(true, |p| e.patient_id.as_uuid() == &p)
            && q.status.map_or(true, |s| e.status == s)
    });
    emails.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(emails))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> FollowUpContext {
        FollowUpContext {
            patient_first_name: "Marta".into(),
            patient_last_name: "Kowalska".into(),
            dietitian_name: "Dr. Nowak".into(),
            weight_kg: Some(81.25),
            patient_email: Some("marta.k@example.pl".into()),
            patient_phone: Some("601 222 333".into()),
            ..FollowUpContext::default()
        }
    }

    #[test]
    fn prompt_never_contains_real_values() {
        let values = context().values();
        let prompt = user_prompt(
            &values,
            Some("Marta Kowalska lost 2 kg. Marta wants more recipes."),
            Some("Sign as Dr. Nowak"),
        );
        assert!(!prompt.contains("Marta"));
        assert!(!prompt.contains("Kowalska"));
        assert!(!prompt.contains("Nowak"));
        assert!(prompt.contains("{{patient_name}} lost 2 kg"));
        assert!(prompt.contains("{{dietitian_name}}"));
    }

    #[test]
    fn prompt_hides_shouted_names_and_contact_details() {
        let values = context().values();
        let prompt = user_prompt(
            &values,
            Some("MARTA KOWALSKA asked to be reached at Marta.K@example.pl or 601 222 333."),
            None,
        );
        let lower = prompt.to_lowercase();
        assert!(!lower.contains("marta"), "{prompt}");
        assert!(!lower.contains("kowalska"), "{prompt}");
        assert!(!prompt.contains("601 222 333"), "{prompt}");
        assert!(prompt.contains("{{patient_name}} asked to be reached at {{patient_email}} or {{patient_phone}}."));
    }

    #[test]
    fn system_prompt_lists_placeholders() {
        let ctx = context();
        let system = system_prompt(&ctx.available_placeholders(), "Polish");
        assert!(system.contains("{{patient_first_name}}"));
        assert!(system.contains("{{weight}}"));
        assert!(system.contains("Polish"));
        assert!(!system.contains("Marta"));
    }

    #[test]
    fn missing_notes_are_marked() {
        let prompt = user_prompt(&PlaceholderValues::new(), None, Some("  "));
        assert_eq!(prompt, "Consultation notes:\n(none)");
    }
}
