//! # API Error Types
//!
//! Structured error type implementing `axum::response::IntoResponse`.
//! Maps domain errors from `nutri-core` to HTTP status codes and returns a
//! JSON body with error code, message and optional details. Internal error
//! details are logged, never returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use nutri_core::billing::InvoiceError;
use nutri_core::rbac::RoleTableError;
use nutri_core::{
    AccessDenied, FormulaError, LoginLocked, PasswordError, ScheduleError, ValidationError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// `details` is only populated for client errors that carry structured
/// context (e.g. the lock expiry of a locked account).
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Inner error detail.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g. "NOT_FOUND", "VALIDATION_ERROR").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details, present only for some client errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Application-level error type that implements [`IntoResponse`] for Axum.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found, or outside the caller's patient scope (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request content failed business validation (400).
    #[error("validation error: {0}")]
    Validation(String),

    /// Request body could not be parsed (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials (401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted (403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Conflict with current resource state (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Account locked after repeated failed logins (423).
    #[error("account locked until {until}")]
    Locked {
        /// When the lock expires.
        until: DateTime<Utc>,
    },

    /// External provider returned an error or was unreachable (502).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Optional dependency not configured (503).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error (500). Message is logged but not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Return the HTTP status code and machine-readable error code.
    pub(crate) fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Locked { .. } => (StatusCode::LOCKED, "ACCOUNT_LOCKED"),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            Self::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Shorthand for a 404 naming the missing resource.
    pub fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{resource} {id} not found"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            Self::Upstream(_) => "An upstream provider failed".to_string(),
            other => other.to_string(),
        };

        match &self {
            Self::Internal(_) => tracing::error!(error = %self, "internal server error"),
            Self::Upstream(_) => tracing::error!(error = %self, "upstream provider error"),
            Self::ServiceUnavailable(_) => tracing::warn!(error = %self, "service unavailable"),
            _ => {}
        }

        let details = match &self {
            Self::Locked { until } => Some(serde_json::json!({ "locked_until": until })),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<AccessDenied> for AppError {
    fn from(err: AccessDenied) -> Self {
        Self::Forbidden(err.to_string())
    }
}

impl From<LoginLocked> for AppError {
    fn from(err: LoginLocked) -> Self {
        Self::Locked { until: err.until }
    }
}

impl From<FormulaError> for AppError {
    fn from(err: FormulaError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<PasswordError> for AppError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::Policy(_) => Self::Validation(err.to_string()),
            PasswordError::MalformedHash => Self::Internal(err.to_string()),
        }
    }
}

/// Invalid lifecycle transitions are conflicts; bad amounts are validation errors.
impl From<InvoiceError> for AppError {
    fn from(err: InvoiceError) -> Self {
        match &err {
            InvoiceError::InvalidAmount(_) | InvoiceError::Overpayment { .. } => {
                Self::Validation(err.to_string())
            }
            InvoiceError::InvalidTransition { .. }
            | InvoiceError::NotDraft(_)
            | InvoiceError::Empty
            | InvoiceError::HasPayments => Self::Conflict(err.to_string()),
        }
    }
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match &err {
            ScheduleError::Parse { .. } => Self::Validation(err.to_string()),
            ScheduleError::UnknownJob(name) => Self::not_found("job", name),
            ScheduleError::DuplicateJob(_) => Self::Conflict(err.to_string()),
        }
    }
}

impl From<RoleTableError> for AppError {
    fn from(err: RoleTableError) -> Self {
        match &err {
            RoleTableError::Yaml(_) | RoleTableError::Validation(_) => {
                Self::Validation(err.to_string())
            }
            RoleTableError::AdminImmutable => Self::Conflict(err.to_string()),
            RoleTableError::UnknownRole(role) => Self::not_found("role", role),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(format!("database error: {err}"))
    }
}
