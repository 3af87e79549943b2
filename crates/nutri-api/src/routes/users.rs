//! # User & Role Administration
//!
//! Users are soft-deleted: `DELETE /v1/users/:id` clears the `active` flag,
//! after which the account can no longer authenticate. Role edits replace
//! a role's permission set in the shared [`RoleTable`](nutri_core::RoleTable)
//! and take effect on the caller's next request.

use std::collections::BTreeSet;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use nutri_core::{Email, LoginAttempts, PasswordPolicy, Permission, RoleName, UserId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{hash_password_blocking, require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_validated_json, Validate};
use crate::state::{AppState, UserRecord, UserView};

// ── Request/Response DTOs ───────────────────────────────────────────

#[derive(Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: String,
    /// Role name, e.g. `DIETITIAN`.
    pub role: String,
    pub password: String,
}

impl Validate for CreateUserRequest {
    fn validate(&self) -> Result<(), String> {
        Email::new(&self.email).map_err(|e| e.to_string())?;
        RoleName::new(&self.role).map_err(|e| e.to_string())?;
        validate_display_name(&self.display_name)?;
        PasswordPolicy::default()
            .check(&self.password)
            .map_err(|e| e.to_string())
    }
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
    /// Administrative password reset.
    pub password: Option<String>,
}

impl Validate for UpdateUserRequest {
    fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.display_name {
            validate_display_name(name)?;
        }
        if let Some(role) = &self.role {
            RoleName::new(role).map_err(|e| e.to_string())?;
        }
        if let Some(password) = &self.password {
            PasswordPolicy::default()
                .check(password)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn validate_display_name(name: &str) -> Result<(), String> {
    let len = name.trim().len();
    if len == 0 || len > 200 {
        return Err("display_name must be 1-200 characters".into());
    }
    Ok(())
}

/// A role and the permission codes it grants.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleView {
    pub name: String,
    pub permissions: Vec<String>,
}

/// A permission code.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PermissionView {
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRoleRequest {
    pub permissions: Vec<String>,
}

impl Validate for UpdateRoleRequest {
    fn validate(&self) -> Result<(), String> {
        for code in &self.permissions {
            Permission::from_code(code).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/users", get(list_users).post(create_user))
        .route(
            "/v1/users/:id",
            get(get_user).put(update_user).delete(deactivate_user),
        )
        .route("/v1/users/:id/unlock", post(unlock_user))
        .route("/v1/roles", get(list_roles))
        .route("/v1/roles/:name", put(update_role))
        .route("/v1/permissions", get(list_permissions))
}

// ── Handlers ────────────────────────────────────────────────────────

fn ensure_role_exists(state: &AppState, role: &RoleName) -> Result<(), AppError> {
    if state.roles.read().contains(role) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("unknown role '{role}'")))
    }
}

/// GET /v1/users — List users, active first, then by email.
#[utoipa::path(
    get,
    path = "/v1/users",
    responses((status = 200, description = "Users", body = Vec<UserView>)),
    tag = "users"
)]
async fn list_users(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<UserView>>, AppError> {
    require_permission(&caller, Permission::UsersRead)?;
    let mut users = state.users.list();
    users.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then_with(|| a.email.as_str().cmp(b.email.as_str()))
    });
    Ok(Json(users.iter().map(UserView::from).collect()))
}

/// POST /v1/users — Create a user.
#[utoipa::path(
    post,
    path = "/v1/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = UserView),
        (status = 400, description = "Validation error", body = crate::error::ErrorBody),
        (status = 409, description = "Email already registered", body = crate::error::ErrorBody),
    ),
    tag = "users"
)]
async fn create_user(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserView>), AppError> {
    require_permission(&caller, Permission::UsersManage)?;
    let req = extract_validated_json(body)?;
    let email = Email::new(&req.email)?;
    let role = RoleName::new(&req.role)?;
    ensure_role_exists(&state, &role)?;
    if state.find_user_by_email(&email).is_some() {
        return Err(AppError::Conflict(format!("email {email} is already registered")));
    }

    let now = Utc::now();
    let user = UserRecord {
        id: UserId::new(),
        email,
        display_name: req.display_name.trim().to_string(),
        role,
        password_hash: hash_password_blocking(&req.password, state.config.password_iterations)
            .await?,
        active: true,
        attempts: LoginAttempts::default(),
        created_at: now,
        updated_at: now,
    };
    state.persist_user(&user).await?;
    state.users.insert(*user.id.as_uuid(), user.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "user.create",
            "user",
            user.id,
            serde_json::json!({ "email": user.email, "role": user.role }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(UserView::from(&user))))
}

/// GET /v1/users/:id — Get a user.
#[utoipa::path(
    get,
    path = "/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = UserView),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "users"
)]
async fn get_user(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<UserView>, AppError> {
    require_permission(&caller, Permission::UsersRead)?;
    let user = state
        .users
        .get(&id)
        .ok_or_else(|| AppError::not_found("user", id))?;
    Ok(Json(UserView::from(&user)))
}

/// PUT /v1/users/:id — Update name, role, active flag or password.
#[utoipa::path(
    put,
    path = "/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "Updated", body = UserView),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
        (status = 409, description = "Would remove the caller's own access", body = crate::error::ErrorBody),
    ),
    tag = "users"
)]
async fn update_user(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<UserView>, AppError> {
    require_permission(&caller, Permission::UsersManage)?;
    let req = extract_validated_json(body)?;
    let role = req.role.as_deref().map(RoleName::new).transpose()?;
    if let Some(role) = &role {
        ensure_role_exists(&state, role)?;
    }
    let is_self = caller.user_id().as_uuid() == &id;
    if is_self && (req.active == Some(false) || role.as_ref().is_some_and(|r| r != &caller.principal.role)) {
        return Err(AppError::Conflict(
            "cannot deactivate or change the role of your own account".into(),
        ));
    }
    let password_hash = match req.password.as_deref() {
        Some(p) => Some(hash_password_blocking(p, state.config.password_iterations).await?),
        None => None,
    };

    let now = Utc::now();
    let (updated, ()) = state
        .commit_user(UserId::from_uuid(id), |u| {
            if let Some(name) = &req.display_name {
                u.display_name = name.trim().to_string();
            }
            if let Some(role) = role.clone() {
                u.role = role;
            }
            if let Some(active) = req.active {
                u.active = active;
            }
            if let Some(hash) = password_hash {
                u.password_hash = hash;
            }
            u.updated_at = now;
            Ok(())
        })
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            "user.update",
            "user",
            id,
            serde_json::json!({
                "role": role,
                "active": req.active,
                "password_reset": req.password.is_some(),
            }),
        )
        .await;
    Ok(Json(UserView::from(&updated)))
}

/// DELETE /v1/users/:id — Deactivate a user.
#[utoipa::path(
    delete,
    path = "/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
        (status = 409, description = "Cannot deactivate yourself", body = crate::error::ErrorBody),
    ),
    tag = "users"
)]
async fn deactivate_user(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::UsersManage)?;
    if caller.user_id().as_uuid() == &id {
        return Err(AppError::Conflict("cannot deactivate your own account".into()));
    }
    state
        .commit_user(UserId::from_uuid(id), |u| {
            u.active = false;
            u.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(Some(caller.user_id()), "user.deactivate", "user", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/users/:id/unlock — Clear a login lockout.
#[utoipa::path(
    post,
    path = "/v1/users/{id}/unlock",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Unlocked", body = UserView),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "users"
)]
async fn unlock_user(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<UserView>, AppError> {
    require_permission(&caller, Permission::UsersManage)?;
    let (updated, ()) = state
        .commit_user(UserId::from_uuid(id), |u| {
            u.attempts.unlock();
            u.updated_at = Utc::now();
            Ok(())
        })
        .await?;
    state
        .record_audit(Some(caller.user_id()), "user.unlock", "user", id, serde_json::json!({}))
        .await;
    Ok(Json(UserView::from(&updated)))
}

/// GET /v1/roles — Roles and their permissions.
#[utoipa::path(
    get,
    path = "/v1/roles",
    responses((status = 200, description = "Roles", body = Vec<RoleView>)),
    tag = "roles"
)]
async fn list_roles(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<RoleView>>, AppError> {
    require_permission(&caller, Permission::RolesRead)?;
    let roles = state
        .roles
        .read()
        .iter()
        .map(|(name, perms)| RoleView {
            name: name.to_string(),
            permissions: perms.iter().map(|p| p.code().to_string()).collect(),
        })
        .collect();
    Ok(Json(roles))
}

/// GET /v1/permissions — The permission catalogue.
#[utoipa::path(
    get,
    path = "/v1/permissions",
    responses((status = 200, description = "Permission codes", body = Vec<PermissionView>)),
    tag = "roles"
)]
async fn list_permissions(caller: CallerIdentity) -> Result<Json<Vec<PermissionView>>, AppError> {
    require_permission(&caller, Permission::RolesRead)?;
    Ok(Json(
        Permission::ALL
            .iter()
            .map(|p| PermissionView {
                code: p.code().to_string(),
            })
            .collect(),
    ))
}

/// PUT /v1/roles/:name — Create or replace a role's permission set.
#[utoipa::path(
    put,
    path = "/v1/roles/{name}",
    params(("name" = String, Path, description = "Role name")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role saved", body = RoleView),
        (status = 400, description = "Unknown permission code", body = crate::error::ErrorBody),
        (status = 409, description = "ADMIN cannot be edited", body = crate::error::ErrorBody),
    ),
    tag = "roles"
)]
async fn update_role(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(name): Path<String>,
    body: Result<Json<UpdateRoleRequest>, JsonRejection>,
) -> Result<Json<RoleView>, AppError> {
    require_permission(&caller, Permission::RolesManage)?;
    let req = extract_validated_json(body)?;
    let role = RoleName::new(&name)?;
    let permissions = req
        .permissions
        .iter()
        .map(|c| Permission::from_code(c))
        .collect::<Result<BTreeSet<_>, _>>()?;
    state
        .roles
        .write()
        .set_role(role.clone(), permissions.clone())?;
    let codes: Vec<String> = permissions.iter().map(|p| p.code().to_string()).collect();
    state
        .record_audit(
            Some(caller.user_id()),
            "role.update",
            "role",
            &role,
            serde_json::json!({ "permissions": codes }),
        )
        .await;
    Ok(Json(RoleView {
        name: role.to_string(),
        permissions: codes,
    }))
}
