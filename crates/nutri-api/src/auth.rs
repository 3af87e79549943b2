//! # Authentication & Authorization Middleware
//!
//! Two credential types are accepted:
//!
//! ```text
//! Authorization: Bearer <jwt>   issued by POST /v1/auth/login
//! X-API-Key: nk_<random>        issued by POST /v1/auth/api-keys
//! ```
//!
//! Either way the middleware resolves the caller's *current* user record and
//! role, so deactivating a user or editing a role takes effect on the next
//! request. The resolved [`CallerIdentity`] is injected into the request
//! extensions and extracted by handlers via `FromRequestParts`.

use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use nutri_core::{ApiKeyId, Permission, Principal, UserId};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{AppError, ErrorBody, ErrorDetail};
use crate::state::{AppState, UserRecord};
use crate::token;

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Prefix of every issued API key.
pub const API_KEY_PREFIX: &str = "nk_";

// ── CallerIdentity ──────────────────────────────────────────────────────────

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    ApiKey(ApiKeyId),
}

/// Identity of the authenticated caller, available to all route handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub principal: Principal,
    pub method: AuthMethod,
}

impl CallerIdentity {
    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.principal.has(permission)
    }

    /// Whether the caller may see a patient with the given linked users.
    pub fn can_access_patient(&self, linked: &[UserId]) -> bool {
        self.principal.can_access_patient(linked)
    }
}

/// Extracts the identity that the auth middleware injected into extensions.
/// Returns 401 if no identity is present.
#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for CallerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("no caller identity in request context".into()))
    }
}

/// Require a permission. Returns 403 Forbidden when the caller's role lacks it.
pub fn require_permission(caller: &CallerIdentity, permission: Permission) -> Result<(), AppError> {
    caller.principal.authorize(permission).map_err(AppError::from)
}

// ── API keys ────────────────────────────────────────────────────────────────

/// Generate a fresh API key: `nk_` followed by 32 random bytes, base64url.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hex SHA-256 of an API key, the only form that is stored.
pub fn hash_api_key(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Constant-time comparison of two secrets.
///
/// When lengths differ, performs a dummy comparison to avoid leaking length
/// information through timing variance.
fn constant_time_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

// ── Passwords ───────────────────────────────────────────────────────────────

/// [`nutri_core::hash_password`] on the blocking pool. PBKDF2 at production
/// iteration counts takes tens of milliseconds and must not stall a runtime
/// worker.
pub async fn hash_password_blocking(password: &str, iterations: u32) -> Result<String, AppError> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || nutri_core::hash_password(&password, iterations))
        .await
        .map_err(|e| AppError::Internal(format!("password hashing task failed: {e}")))
}

/// [`nutri_core::verify_password`] on the blocking pool.
pub async fn verify_password_blocking(password: &str, encoded: &str) -> Result<bool, AppError> {
    let password = password.to_owned();
    let encoded = encoded.to_owned();
    let verified =
        tokio::task::spawn_blocking(move || nutri_core::verify_password(&password, &encoded))
            .await
            .map_err(|e| AppError::Internal(format!("password verification task failed: {e}")))?;
    Ok(verified?)
}

// ── Resolution ──────────────────────────────────────────────────────────────

fn active_user(state: &AppState, user_id: UserId) -> Result<UserRecord, String> {
    match state.users.get(user_id.as_uuid()) {
        Some(user) if user.active => Ok(user),
        Some(_) => Err("user is deactivated".into()),
        None => Err("unknown user".into()),
    }
}

fn resolve(state: &AppState, user: &UserRecord) -> Result<Principal, String> {
    state
        .roles
        .read()
        .principal(user.id, &user.role)
        .map_err(|e| e.to_string())
}

fn authenticate_token(
    state: &AppState,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<CallerIdentity, String> {
    let claims =
        token::verify(state.config.jwt_secret.expose(), raw, now).map_err(|e| e.to_string())?;
    let user = active_user(state, claims.sub)?;
    Ok(CallerIdentity {
        principal: resolve(state, &user)?,
        method: AuthMethod::Token,
    })
}

fn authenticate_api_key(
    state: &AppState,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<CallerIdentity, String> {
    let hash = hash_api_key(raw);
    let key = state
        .api_keys
        .find(|k| !k.revoked && constant_time_eq(&hash, &k.key_hash))
        .ok_or_else(|| "invalid API key".to_string())?;
    let user = active_user(state, key.user_id)?;
    let principal = resolve(state, &user)?;
    state
        .api_keys
        .update(key.id.as_uuid(), |k| k.last_used_at = Some(now));
    Ok(CallerIdentity {
        principal,
        method: AuthMethod::ApiKey(key.id),
    })
}

/// Resolve the caller from request headers.
pub fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<CallerIdentity, String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| "authorization header is not valid ASCII".to_string())?;
        return match value.strip_prefix("Bearer ") {
            Some(raw) => authenticate_token(state, raw.trim(), now),
            None => Err("authorization header must use Bearer scheme".into()),
        };
    }
    if let Some(value) = headers.get(API_KEY_HEADER) {
        let raw = value
            .to_str()
            .map_err(|_| "API key header is not valid ASCII".to_string())?;
        return authenticate_api_key(state, raw.trim(), now);
    }
    Err("missing credentials".into())
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Authenticate the request and inject [`CallerIdentity`] into its extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state, request.headers(), Utc::now()) {
        Ok(identity) => {
            tracing::debug!(
                user_id = %identity.user_id(),
                role = %identity.principal.role,
                method = ?identity.method,
                "authenticated"
            );
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(msg) => {
            tracing::warn!(reason = %msg, "authentication failed");
            unauthorized_response(&msg)
        }
    }
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            details: None,
        },
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
