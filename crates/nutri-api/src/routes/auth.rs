//! # Authentication Endpoints
//!
//! - `POST /v1/auth/login`: exchange email + password for an access token
//!   (unauthenticated; repeated failures lock the account, 423)
//! - `GET /v1/auth/me`: the caller's profile and effective permissions
//! - `POST /v1/auth/password`: change the caller's password
//! - `GET /v1/auth/api-keys`, `POST /v1/auth/api-keys`,
//!   `DELETE /v1/auth/api-keys/:id`: manage the caller's API keys

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use nutri_core::lockout::FailureOutcome;
use nutri_core::{ApiKeyId, Email, Permission, PasswordPolicy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{
    generate_api_key, hash_api_key, hash_password_blocking, require_permission,
    verify_password_blocking, CallerIdentity,
};
use crate::error::AppError;
use crate::extractors::{check_len, extract_json, extract_validated_json, Validate};
use crate::state::{ApiKeyRecord, AppState, UserView};
use crate::token;

// ── Request/Response DTOs ───────────────────────────────────────────

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    /// Token lifetime in seconds.
    pub expires_in: i64,
    pub user: UserView,
}

/// The caller's profile.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user: UserView,
    /// Effective permission codes (every code for administrators).
    pub permissions: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

impl Validate for ChangePasswordRequest {
    fn validate(&self) -> Result<(), String> {
        PasswordPolicy::default()
            .check(&self.new_password)
            .map_err(|e| e.to_string())?;
        if self.new_password == self.current_password {
            return Err("new password must differ from the current one".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiKeyRequest {
    pub name: String,
}

impl Validate for CreateApiKeyRequest {
    fn validate(&self) -> Result<(), String> {
        check_len("name", &self.name, 100)
    }
}

/// A newly created key. `key` is shown once and never again.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatedApiKey {
    pub key: String,
    pub api_key: ApiKeyRecord,
}

// ── Router ──────────────────────────────────────────────────────────

/// Unauthenticated routes.
pub fn public_router() -> Router<AppState> {
    Router::new().route("/v1/auth/login", post(login))
}

/// Authenticated routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/auth/me", get(me))
        .route("/v1/auth/password", post(change_password))
        .route("/v1/auth/api-keys", get(list_api_keys).post(create_api_key))
        .route("/v1/auth/api-keys/:id", delete(revoke_api_key))
}

// ── Handlers ────────────────────────────────────────────────────────

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("invalid email or password".into())
}

/// POST /v1/auth/login — Exchange credentials for an access token.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ErrorBody),
        (status = 423, description = "Account locked", body = crate::error::ErrorBody),
    ),
    tag = "auth"
)]
async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let req = extract_json(body)?;
    let email = Email::new(&req.email).map_err(|_| invalid_credentials())?;
    let user = state
        .find_user_by_email(&email)
        .ok_or_else(invalid_credentials)?;
    if !user.active {
        tracing::warn!(user_id = %user.id, "login attempt on deactivated account");
        return Err(invalid_credentials());
    }

    let now = Utc::now();
    user.attempts.check(now)?;

    if !verify_password_blocking(&req.password, &user.password_hash).await? {
        let policy = state.config.lockout;
        let (updated, outcome) = state
            .commit_user(user.id, |u| {
                u.updated_at = now;
                Ok(u.attempts.record_failure(now, &policy))
            })
            .await?;
        state
            .record_audit(
                Some(user.id),
                "auth.login_failed",
                "user",
                user.id,
                serde_json::json!({ "failed_attempts": updated.attempts.failed_attempts }),
            )
            .await;
        return match outcome {
            FailureOutcome::Locked(locked) => {
                tracing::warn!(user_id = %user.id, until = %locked.until, "account locked");
                Err(locked.into())
            }
            _ => Err(invalid_credentials()),
        };
    }

    let user = if user.attempts.failed_attempts > 0 || user.attempts.locked_until.is_some() {
        let (updated, ()) = state
            .commit_user(user.id, |u| {
                u.attempts.record_success();
                u.updated_at = now;
                Ok(())
            })
            .await?;
        updated
    } else {
        user
    };

    let access_token = token::issue(
        state.config.jwt_secret.expose(),
        user.id,
        user.role.as_str(),
        now,
        state.config.jwt_ttl_secs,
    )
    .map_err(|e| AppError::Internal(e.to_string()))?;
    state
        .record_audit(Some(user.id), "auth.login", "user", user.id, serde_json::json!({}))
        .await;

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer".into(),
        expires_in: state.config.jwt_ttl_secs,
        user: UserView::from(&user),
    }))
}

/// GET /v1/auth/me — The caller's profile.
#[utoipa::path(
    get,
    path = "/v1/auth/me",
    responses((status = 200, description = "Caller profile", body = MeResponse)),
    tag = "auth"
)]
async fn me(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<MeResponse>, AppError> {
    let user = state
        .users
        .get(caller.user_id().as_uuid())
        .ok_or_else(|| AppError::not_found("user", caller.user_id()))?;
    let permissions = Permission::ALL
        .iter()
        .filter(|p| caller.has(**p))
        .map(|p| p.code().to_string())
        .collect();
    Ok(Json(MeResponse {
        user: UserView::from(&user),
        permissions,
    }))
}

/// POST /v1/auth/password — Change the caller's password.
#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "Policy violation", body = crate::error::ErrorBody),
        (status = 401, description = "Current password wrong", body = crate::error::ErrorBody),
    ),
    tag = "auth"
)]
async fn change_password(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let req = extract_validated_json(body)?;
    let id = caller.user_id();
    let user = state
        .users
        .get(id.as_uuid())
        .ok_or_else(|| AppError::not_found("user", id))?;
    if !verify_password_blocking(&req.current_password, &user.password_hash).await? {
        return Err(AppError::Unauthorized("current password is incorrect".into()));
    }
    let hash = hash_password_blocking(&req.new_password, state.config.password_iterations).await?;
    state
        .commit_user(id, |u| {
            u.password_hash = hash;
            u.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(Some(id), "auth.password_changed", "user", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/auth/api-keys — The caller's API keys.
#[utoipa::path(
    get,
    path = "/v1/auth/api-keys",
    responses((status = 200, description = "API keys", body = Vec<ApiKeyRecord>)),
    tag = "auth"
)]
async fn list_api_keys(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<ApiKeyRecord>>, AppError> {
    require_permission(&caller, Permission::ApiKeysManage)?;
    let mut keys = state.api_keys.filter(|k| k.user_id == caller.user_id());
    keys.sort_by_key(|k| k.created_at);
    Ok(Json(keys))
}

/// POST /v1/auth/api-keys — Create an API key for the caller.
#[utoipa::path(
    post,
    path = "/v1/auth/api-keys",
    request_body = CreateApiKeyRequest,
    responses(
        (status = 201, description = "Key created; the key is only returned here", body = CreatedApiKey),
        (status = 403, description = "Missing api_keys.manage", body = crate::error::ErrorBody),
    ),
    tag = "auth"
)]
async fn create_api_key(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedApiKey>), AppError> {
    require_permission(&caller, Permission::ApiKeysManage)?;
    let req = extract_validated_json(body)?;
    let key = generate_api_key();
    let record = ApiKeyRecord {
        id: ApiKeyId::new(),
        user_id: caller.user_id(),
        name: req.name.trim().to_string(),
        prefix: key.chars().take(10).collect(),
        key_hash: hash_api_key(&key),
        revoked: false,
        created_at: Utc::now(),
        last_used_at: None,
    };
    state.api_keys.insert(*record.id.as_uuid(), record.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "api_key.create",
            "api_key",
            record.id,
            serde_json::json!({ "name": record.name }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(CreatedApiKey { key, api_key: record })))
}

/// DELETE /v1/auth/api-keys/:id — Revoke one of the caller's keys.
#[utoipa::path(
    delete,
    path = "/v1/auth/api-keys/{id}",
    params(("id" = Uuid, Path, description = "API key ID")),
    responses(
        (status = 204, description = "Revoked"),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "auth"
)]
async fn revoke_api_key(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::ApiKeysManage)?;
    let owner = caller.user_id();
    let revoked = state
        .api_keys
        .try_update(&id, |k| {
            if k.user_id != owner && !caller.principal.is_admin() {
                return Err(AppError::not_found("api key", id));
            }
            k.revoked = true;
            Ok(())
        })
        .ok_or_else(|| AppError::not_found("api key", id))?;
    revoked?;
    state
        .record_audit(Some(owner), "api_key.revoke", "api_key", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}
