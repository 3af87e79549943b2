//! # Scheduler Job Control

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use nutri_core::schedule::{Job, JobOutcome};
use nutri_core::Permission;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobView {
    pub name: String,
    /// e.g. `every 5m`, `daily 06:00`, `weekly mon 08:00`.
    pub schedule: String,
    pub enabled: bool,
    /// A run has been requested for the next poll.
    pub triggered: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    /// `{"status": "success"|"failed", "detail": "..."}`.
    #[schema(value_type = Option<Object>)]
    pub last_outcome: Option<JobOutcome>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            schedule: job.schedule.to_string(),
            enabled: job.enabled,
            triggered: job.triggered,
            next_run: job.next_run,
            last_run: job.last_run,
            last_outcome: job.last_outcome.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TriggerResult {
    pub job: JobView,
    #[schema(value_type = Object)]
    pub outcome: JobOutcome,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/scheduler/jobs", get(list_jobs))
        .route("/v1/scheduler/jobs/:name/enable", post(enable_job))
        .route("/v1/scheduler/jobs/:name/disable", post(disable_job))
        .route("/v1/scheduler/jobs/:name/trigger", post(trigger_job))
}

/// GET /v1/scheduler/jobs — Registered jobs ordered by name.
#[utoipa::path(
    get,
    path = "/v1/scheduler/jobs",
    responses((status = 200, description = "Jobs", body = Vec<JobView>)),
    tag = "scheduler"
)]
async fn list_jobs(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<JobView>>, AppError> {
    require_permission(&caller, Permission::SchedulerManage)?;
    let jobs = state.jobs.lock().jobs().map(JobView::from).collect();
    Ok(Json(jobs))
}

/// POST /v1/scheduler/jobs/:name/enable — Enable a job, rescheduling it from now.
#[utoipa::path(
    post,
    path = "/v1/scheduler/jobs/{name}/enable",
    params(("name" = String, Path, description = "Job name")),
    responses(
        (status = 200, description = "Enabled", body = JobView),
        (status = 404, description = "Unknown job", body = crate::error::ErrorBody),
    ),
    tag = "scheduler"
)]
async fn enable_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(name): Path<String>,
) -> Result<Json<JobView>, AppError> {
    require_permission(&caller, Permission::SchedulerManage)?;
    let view = {
        let mut jobs = state.jobs.lock();
        JobView::from(jobs.enable(&name, Utc::now())?)
    };
    state
        .record_audit(Some(caller.user_id()), "job.enable", "job", &name, serde_json::json!({}))
        .await;
    Ok(Json(view))
}

/// POST /v1/scheduler/jobs/:name/disable — Stop scheduled runs of a job.
#[utoipa::path(
    post,
    path = "/v1/scheduler/jobs/{name}/disable",
    params(("name" = String, Path, description = "Job name")),
    responses(
        (status = 200, description = "Disabled", body = JobView),
        (status = 404, description = "Unknown job", body = crate::error::ErrorBody),
    ),
    tag = "scheduler"
)]
async fn disable_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(name): Path<String>,
) -> Result<Json<JobView>, AppError> {
    require_permission(&caller, Permission::SchedulerManage)?;
    let view = {
        let mut jobs = state.jobs.lock();
        JobView::from(jobs.disable(&name)?)
    };
    state
        .record_audit(Some(caller.user_id()), "job.disable", "job", &name, serde_json::json!({}))
        .await;
    Ok(Json(view))
}

/// POST /v1/scheduler/jobs/:name/trigger — Run a job now.
#[utoipa::path(
    post,
    path = "/v1/scheduler/jobs/{name}/trigger",
    params(("name" = String, Path, description = "Job name")),
    responses(
        (status = 200, description = "Job ran", body = TriggerResult),
        (status = 404, description = "Unknown job", body = crate::error::ErrorBody),
    ),
    tag = "scheduler"
)]
async fn trigger_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(name): Path<String>,
) -> Result<Json<TriggerResult>, AppError> {
    require_permission(&caller, Permission::SchedulerManage)?;
    let outcome = crate::scheduler::run_now(&state, &name, caller.user_id()).await?;
    let job = {
        let jobs = state.jobs.lock();
        jobs.get(&name)
            .map(JobView::from)
            .ok_or_else(|| AppError::not_found("job", &name))?
    };
    Ok(Json(TriggerResult { job, outcome }))
}
