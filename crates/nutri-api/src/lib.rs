//! # nutri-api — Axum API Service for the Nutri Practice Backend
//!
//! A role-based REST backend for a dietitian practice. Every authenticated
//! request resolves the caller's role to a permission set; handlers check
//! the permission they need and, for patient data, whether the caller is
//! linked to the patient.
//!
//! ## API Surface
//!
//! | Prefix                         | Module                       |
//! |--------------------------------|------------------------------|
//! | `/v1/auth/*`                   | [`routes::auth`]             |
//! | `/v1/users/*`, `/v1/roles/*`   | [`routes::users`]            |
//! | `/v1/patients/*`               | [`routes::patients`]         |
//! | `/v1/visits/*`                 | [`routes::visits`]           |
//! | `/v1/measures/*`               | [`routes::measures`]         |
//! | `/v1/invoices/*`               | [`routes::billing`]          |
//! | `/v1/documents/*`              | [`routes::documents`]        |
//! | `/v1/ingredients`, `/v1/recipes/*` | [`routes::recipes`]      |
//! | `/v1/custom-fields/*`          | [`routes::custom_fields`]    |
//! | `/v1/visits/:id/followup*`, `/v1/emails` | [`routes::followups`] |
//! | `/v1/scheduler/*`              | [`routes::scheduler`]        |
//! | `/v1/audit/*`                  | [`routes::audit`]            |
//!
//! ## Middleware Stack (execution order)
//!
//! ```text
//! TraceLayer → MetricsMiddleware → AuthMiddleware → Handler
//! ```
//!
//! Health probes and `POST /v1/auth/login` bypass authentication.

pub mod ai;
pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod mail;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod token;
pub mod upstream;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::middleware::metrics::{metrics_handler, metrics_middleware, ApiMetrics};
use crate::state::AppState;

/// Assemble the full application router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    let metrics = ApiMetrics::new();

    // Authenticated API routes.
    let api = Router::new()
        .merge(routes::auth::router())
        .merge(routes::users::router())
        .merge(routes::patients::router())
        .merge(routes::visits::router())
        .merge(routes::measures::router())
        .merge(routes::billing::router())
        .merge(routes::documents::router())
        .merge(routes::recipes::router())
        .merge(routes::custom_fields::router())
        .merge(routes::followups::router())
        .merge(routes::scheduler::router())
        .merge(routes::audit::router())
        .merge(openapi::router())
        .route("/metrics", get(metrics_handler))
        .layer(from_fn_with_state(state.clone(), auth::auth_middleware));

    // Unauthenticated routes.
    let public = Router::new()
        .merge(routes::auth::public_router())
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness));

    Router::new()
        .merge(public)
        .merge(api)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(axum::Extension(metrics))
        .with_state(state)
}

/// Liveness probe: 200 while the process is running.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe: 200 when the application is ready to serve.
async fn readiness() -> &'static str {
    "ready"
}
