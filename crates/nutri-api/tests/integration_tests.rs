//! # Integration Tests for nutri-api
//!
//! Drives the assembled router with `tower::ServiceExt::oneshot`: health
//! probes, login and lockout, permission checks, role editing, API keys,
//! patient scoping, custom fields, measures, recipes, the invoice
//! lifecycle, follow-up emails, scheduler control, audit and OpenAPI
//! generation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use nutri_api::config::AppConfig;
use nutri_api::state::{AppState, UserRecord};
use nutri_core::{hash_password, Email, LockoutPolicy, LoginAttempts, RoleName, RoleTable, UserId};

const PASSWORD: &str = "C0rrect-Horse-Battery";

/// Helper: state with cheap password hashing and a tight lockout policy.
fn test_state() -> AppState {
    AppState::with_config(
        AppConfig {
            password_iterations: 1_000,
            lockout: LockoutPolicy::new(3, 15),
            ..AppConfig::default()
        },
        RoleTable::builtin(),
        None,
    )
}

/// Helper: insert an active user with the given role.
fn add_user(state: &AppState, email: &str, role: &str) -> UserRecord {
    let now = Utc::now();
    let user = UserRecord {
        id: UserId::new(),
        email: Email::new(email).unwrap(),
        display_name: email.split('@').next().unwrap().to_string(),
        role: RoleName::new(role).unwrap(),
        password_hash: hash_password(PASSWORD, 1_000),
        active: true,
        attempts: LoginAttempts::default(),
        created_at: now,
        updated_at: now,
    };
    state.users.insert(*user.id.as_uuid(), user.clone());
    user
}

/// Helper: a bearer token for `user`.
fn token_for(state: &AppState, user: &UserRecord) -> String {
    nutri_api::token::issue(
        state.config.jwt_secret.expose(),
        user.id,
        user.role.as_str(),
        Utc::now(),
        3600,
    )
    .unwrap()
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Helper: send a request and decode the JSON body (`Null` when empty).
async fn call(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

async fn create_patient(app: &axum::Router, token: &str, first: &str, last: &str) -> Value {
    let (status, body) = call(
        app,
        request(
            "POST",
            "/v1/patients",
            Some(token),
            Some(json!({
                "first_name": first,
                "last_name": last,
                "email": format!("{}@example.org", first.to_lowercase()),
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

fn key_request(method: &str, uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

// -- Health Probes ------------------------------------------------------------

#[tokio::test]
async fn test_health_probes_need_no_credentials() {
    let app = nutri_api::app(test_state());
    let (status, body) = call(&app, request("GET", "/health/liveness", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
    let (status, body) = call(&app, request("GET", "/health/readiness", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ready".into()));
}

// -- Authentication -----------------------------------------------------------

#[tokio::test]
async fn test_missing_or_bad_credentials_return_401() {
    let app = nutri_api::app(test_state());
    let (status, body) = call(&app, request("GET", "/v1/patients", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = call(&app, request("GET", "/v1/patients", Some("not.a.jwt"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_then_me() {
    let state = test_state();
    add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let app = nutri_api::app(state);

    let (status, body) = call(
        &app,
        request(
            "POST",
            "/v1/auth/login",
            None,
            Some(json!({ "email": "Anna@Example.org", "password": PASSWORD })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["token_type"], "Bearer");
    let token = body["access_token"].as_str().unwrap().to_string();

    let (status, me) = call(&app, request("GET", "/v1/auth/me", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["user"]["email"], "anna@example.org");
    let permissions = me["permissions"].as_array().unwrap();
    assert!(permissions.iter().any(|p| p == "patients.read"));
    assert!(!permissions.iter().any(|p| p == "users.manage"));
}

#[tokio::test]
async fn test_unknown_user_and_wrong_password_look_the_same() {
    let state = test_state();
    add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let app = nutri_api::app(state);

    let (s1, b1) = call(
        &app,
        request(
            "POST",
            "/v1/auth/login",
            None,
            Some(json!({ "email": "nobody@example.org", "password": PASSWORD })),
        ),
    )
    .await;
    let (s2, b2) = call(
        &app,
        request(
            "POST",
            "/v1/auth/login",
            None,
            Some(json!({ "email": "anna@example.org", "password": "wrong" })),
        ),
    )
    .await;
    assert_eq!(s1, StatusCode::UNAUTHORIZED);
    assert_eq!(s2, StatusCode::UNAUTHORIZED);
    assert_eq!(b1["error"]["message"], b2["error"]["message"]);
}

#[tokio::test]
async fn test_repeated_failures_lock_the_account() {
    let state = test_state();
    let user = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let app = nutri_api::app(state.clone());
    let bad = json!({ "email": "anna@example.org", "password": "wrong" });

    for _ in 0..2 {
        let (status, _) = call(&app, request("POST", "/v1/auth/login", None, Some(bad.clone()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = call(&app, request("POST", "/v1/auth/login", None, Some(bad))).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"]["code"], "ACCOUNT_LOCKED");
    assert!(body["error"]["details"]["locked_until"].is_string());

    // The correct password is refused while locked.
    let good = json!({ "email": "anna@example.org", "password": PASSWORD });
    let (status, _) = call(&app, request("POST", "/v1/auth/login", None, Some(good.clone()))).await;
    assert_eq!(status, StatusCode::LOCKED);

    // An administrator unlocks; login succeeds again.
    let admin = add_user(&state, "admin@example.org", RoleName::ADMIN);
    let admin_token = token_for(&state, &admin);
    let (status, _) = call(
        &app,
        request(
            "POST",
            &format!("/v1/users/{}/unlock", user.id),
            Some(&admin_token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, request("POST", "/v1/auth/login", None, Some(good))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_deactivated_user_cannot_use_existing_token() {
    let state = test_state();
    let user = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &user);
    state.users.update(user.id.as_uuid(), |u| u.active = false);
    let app = nutri_api::app(state);

    let (status, _) = call(&app, request("GET", "/v1/auth/me", Some(&token), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// -- Permissions & Scope ------------------------------------------------------

#[tokio::test]
async fn test_missing_permission_returns_403() {
    let state = test_state();
    let viewer = add_user(&state, "viewer@example.org", RoleName::VIEWER);
    let token = token_for(&state, &viewer);
    let app = nutri_api::app(state);

    let (status, body) = call(
        &app,
        request(
            "POST",
            "/v1/patients",
            Some(&token),
            Some(json!({ "first_name": "Marta", "last_name": "Kowalska" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let (status, _) = call(&app, request("GET", "/v1/users", Some(&token), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, request("GET", "/v1/audit", Some(&token), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unlinked_dietitian_cannot_see_patient() {
    let state = test_state();
    let anna = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let bob = add_user(&state, "bob@example.org", RoleName::DIETITIAN);
    let assistant = add_user(&state, "desk@example.org", RoleName::ASSISTANT);
    let (anna_t, bob_t, desk_t) = (
        token_for(&state, &anna),
        token_for(&state, &bob),
        token_for(&state, &assistant),
    );
    let app = nutri_api::app(state);

    let patient = create_patient(&app, &anna_t, "Marta", "Kowalska").await;
    let id = patient["id"].as_str().unwrap();
    assert_eq!(patient["dietitian_ids"][0], anna.id.to_string());

    let uri = format!("/v1/patients/{id}");
    let (status, _) = call(&app, request("GET", &uri, Some(&anna_t), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, request("GET", &uri, Some(&bob_t), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    let (_, list) = call(&app, request("GET", "/v1/patients", Some(&bob_t), None)).await;
    assert_eq!(list.as_array().unwrap().len(), 0);

    // patients.read_all sees everything.
    let (status, _) = call(&app, request("GET", &uri, Some(&desk_t), None)).await;
    assert_eq!(status, StatusCode::OK);

    // Once linked, Bob sees the patient.
    let (status, _) = call(
        &app,
        request(
            "POST",
            &format!("/v1/patients/{id}/dietitians"),
            Some(&anna_t),
            Some(json!({ "user_id": bob.id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, request("GET", &uri, Some(&bob_t), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_deleted_patient_disappears() {
    let state = test_state();
    let admin = add_user(&state, "admin@example.org", RoleName::ADMIN);
    let token = token_for(&state, &admin);
    let app = nutri_api::app(state);

    let patient = create_patient(&app, &token, "Jan", "Nowak").await;
    let uri = format!("/v1/patients/{}", patient["id"].as_str().unwrap());
    let (status, _) = call(&app, request("DELETE", &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, request("GET", &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// -- Billing ------------------------------------------------------------------

#[tokio::test]
async fn test_invoice_lifecycle() {
    let state = test_state();
    let anna = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &anna);
    let app = nutri_api::app(state);
    let patient = create_patient(&app, &token, "Marta", "Kowalska").await;

    let (status, invoice) = call(
        &app,
        request(
            "POST",
            "/v1/invoices",
            Some(&token),
            Some(json!({
                "patient_id": patient["id"],
                "items": [
                    { "description": "Initial consultation", "quantity": 1, "unit_price_cents": 9000 },
                    { "description": "Meal plan", "quantity": 2, "unit_price_cents": 2500 }
                ]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{invoice}");
    assert_eq!(invoice["status"], "draft");
    assert_eq!(invoice["total_cents"], 14000);
    assert!(invoice["number"].as_str().unwrap().ends_with("-00001"));
    let id = invoice["id"].as_str().unwrap();

    // Payments are refused on drafts.
    let pay_uri = format!("/v1/invoices/{id}/payments");
    let (status, _) = call(
        &app,
        request("POST", &pay_uri, Some(&token), Some(json!({ "amount_cents": 1000 }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, sent) = call(
        &app,
        request("POST", &format!("/v1/invoices/{id}/send"), Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["status"], "sent");

    let (_, partial) = call(
        &app,
        request("POST", &pay_uri, Some(&token), Some(json!({ "amount_cents": 4000 }))),
    )
    .await;
    assert_eq!(partial["status"], "partially_paid");
    assert_eq!(partial["balance_cents"], 10000);

    let (status, _) = call(
        &app,
        request("POST", &pay_uri, Some(&token), Some(json!({ "amount_cents": 20000 }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, paid) = call(
        &app,
        request("POST", &pay_uri, Some(&token), Some(json!({ "amount_cents": 10000 }))),
    )
    .await;
    assert_eq!(paid["status"], "paid");
    assert_eq!(paid["balance_cents"], 0);

    let (status, _) = call(
        &app,
        request("POST", &format!("/v1/invoices/{id}/cancel"), Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// -- Follow-ups ---------------------------------------------------------------

#[tokio::test]
async fn test_followup_draft_without_ai_is_503_and_send_renders_placeholders() {
    let state = test_state();
    let anna = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &anna);
    let app = nutri_api::app(state);
    let patient = create_patient(&app, &token, "Marta", "Kowalska").await;

    let (status, visit) = call(
        &app,
        request(
            "POST",
            "/v1/visits",
            Some(&token),
            Some(json!({
                "patient_id": patient["id"],
                "scheduled_at": "2029-12-01T10:00:00Z",
                "next_visit_date": "2030-01-10",
                "notes": "Marta is doing well."
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{visit}");
    let visit_id = visit["id"].as_str().unwrap();

    let (status, body) = call(
        &app,
        request(
            "POST",
            &format!("/v1/visits/{visit_id}/followup"),
            Some(&token),
            Some(json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");

    let (status, email) = call(
        &app,
        request(
            "POST",
            &format!("/v1/visits/{visit_id}/followup/send"),
            Some(&token),
            Some(json!({
                "subject": "After your visit",
                "body": "Hello {{patient_first_name}}, see you on {{next_visit_date}}."
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{email}");
    assert_eq!(email["status"], "sent");
    assert_eq!(email["to"], "marta@example.org");
    assert_eq!(email["body"], "Hello Marta, see you on 2030-01-10.");

    let (status, body) = call(
        &app,
        request(
            "POST",
            &format!("/v1/visits/{visit_id}/followup/send"),
            Some(&token),
            Some(json!({ "subject": "Hi", "body": "Your {{shoe_size}}" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("shoe_size"));

    let (_, emails) = call(&app, request("GET", "/v1/emails", Some(&token), None)).await;
    assert_eq!(emails.as_array().unwrap().len(), 1);
}

// -- Scheduler & Audit --------------------------------------------------------

#[tokio::test]
async fn test_scheduler_jobs_can_be_toggled_and_triggered() {
    let state = test_state();
    let admin = add_user(&state, "admin@example.org", RoleName::ADMIN);
    let token = token_for(&state, &admin);
    let app = nutri_api::app(state);

    let (status, jobs) = call(&app, request("GET", "/v1/scheduler/jobs", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 3);

    let (_, job) = call(
        &app,
        request("POST", "/v1/scheduler/jobs/email_outbox/disable", Some(&token), None),
    )
    .await;
    assert_eq!(job["enabled"], false);

    let (status, result) = call(
        &app,
        request("POST", "/v1/scheduler/jobs/lockout_sweep/trigger", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["outcome"]["status"], "success");
    assert_eq!(result["job"]["triggered"], false);
    assert!(result["job"]["last_run"].is_string());

    let (status, _) = call(
        &app,
        request("POST", "/v1/scheduler/jobs/nope/trigger", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_audit_trail_records_mutations_and_verifies() {
    let state = test_state();
    let admin = add_user(&state, "admin@example.org", RoleName::ADMIN);
    let token = token_for(&state, &admin);
    let app = nutri_api::app(state);
    create_patient(&app, &token, "Jan", "Nowak").await;

    let (status, entries) = call(
        &app,
        request("GET", "/v1/audit?resource_type=patient", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["action"], "patient.create");
    assert_eq!(entries[0]["actor"], admin.id.to_string());

    let (_, integrity) = call(&app, request("GET", "/v1/audit/verify", Some(&token), None)).await;
    assert_eq!(integrity["chain_valid"], true);
    assert_eq!(integrity["broken_links"], 0);
}

// -- OpenAPI & Metrics --------------------------------------------------------

#[tokio::test]
async fn test_openapi_requires_authentication() {
    let state = test_state();
    let viewer = add_user(&state, "viewer@example.org", RoleName::VIEWER);
    let token = token_for(&state, &viewer);
    let app = nutri_api::app(state);

    let (status, _) = call(&app, request("GET", "/openapi.json", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, spec) = call(&app, request("GET", "/openapi.json", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(spec["paths"]["/v1/patients"].is_object());
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let state = test_state();
    let viewer = add_user(&state, "viewer@example.org", RoleName::VIEWER);
    let token = token_for(&state, &viewer);
    let app = nutri_api::app(state);

    call(&app, request("GET", "/health/liveness", None, None)).await;
    call(&app, request("GET", "/v1/patients", None, None)).await;
    let (status, body) = call(&app, request("GET", "/metrics", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("nutri_http_requests_total 2"));
    assert!(text.contains("class=\"4xx\"} 1"));
}

// -- Roles --------------------------------------------------------------------

#[tokio::test]
async fn test_role_edits_apply_and_admin_is_immutable() {
    let state = test_state();
    let admin = add_user(&state, "root@example.org", RoleName::ADMIN);
    let viewer = add_user(&state, "vera@example.org", RoleName::VIEWER);
    let dietitian = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let admin_token = token_for(&state, &admin);
    let viewer_token = token_for(&state, &viewer);
    let app = nutri_api::app(state.clone());

    let (status, body) = call(
        &app,
        request(
            "PUT",
            "/v1/roles/viewer",
            Some(&admin_token),
            Some(json!({ "permissions": ["patients.read", "recipes.read", "recipes.write"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["name"], "VIEWER");

    // The viewer's existing token picks up the new permission set.
    let (_, me) = call(&app, request("GET", "/v1/auth/me", Some(&viewer_token), None)).await;
    let permissions = me["permissions"].as_array().unwrap();
    assert!(permissions.iter().any(|p| p == "recipes.write"));
    assert!(!permissions.iter().any(|p| p == "measures.read"));

    let (status, body) = call(
        &app,
        request("PUT", "/v1/roles/ADMIN", Some(&admin_token), Some(json!({ "permissions": [] }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"].as_str().unwrap().contains("ADMIN"));
    let (_, me) = call(&app, request("GET", "/v1/auth/me", Some(&admin_token), None)).await;
    assert!(me["permissions"].as_array().unwrap().iter().any(|p| p == "roles.manage"));

    let (status, body) = call(
        &app,
        request(
            "PUT",
            "/v1/roles/INTERN",
            Some(&admin_token),
            Some(json!({ "permissions": ["patients.fly"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = call(
        &app,
        request(
            "PUT",
            "/v1/roles/INTERN",
            Some(&admin_token),
            Some(json!({ "permissions": ["recipes.read"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, roles) = call(&app, request("GET", "/v1/roles", Some(&admin_token), None)).await;
    assert!(roles.as_array().unwrap().iter().any(|r| r["name"] == "INTERN"));

    let (status, _) = call(
        &app,
        request(
            "PUT",
            "/v1/roles/VIEWER",
            Some(&token_for(&state, &dietitian)),
            Some(json!({ "permissions": [] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// -- API Keys -----------------------------------------------------------------

#[tokio::test]
async fn test_api_key_create_use_and_revoke() {
    let state = test_state();
    let admin = add_user(&state, "root@example.org", RoleName::ADMIN);
    let dietitian = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &admin);
    let app = nutri_api::app(state.clone());

    let (status, created) = call(
        &app,
        request("POST", "/v1/auth/api-keys", Some(&token), Some(json!({ "name": "lab import" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let key = created["key"].as_str().unwrap().to_string();
    let key_id = created["api_key"]["id"].as_str().unwrap().to_string();
    assert!(key.starts_with("nk_"));
    assert!(created["api_key"].get("key_hash").is_none());

    let (status, me) = call(&app, key_request("GET", "/v1/auth/me", &key)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["user"]["email"], "root@example.org");

    let (_, keys) = call(&app, request("GET", "/v1/auth/api-keys", Some(&token), None)).await;
    let keys = keys.as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["name"], "lab import");
    assert!(keys[0]["last_used_at"].is_string());

    let uri = format!("/v1/auth/api-keys/{key_id}");
    let (status, _) = call(
        &app,
        request("DELETE", &uri, Some(&token_for(&state, &dietitian)), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, request("DELETE", &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, key_request("GET", "/v1/auth/me", &key)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "invalid API key");

    let missing = format!("/v1/auth/api-keys/{}", UserId::new());
    let (status, _) = call(&app, request("DELETE", &missing, Some(&token), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// -- Custom Fields ------------------------------------------------------------

#[tokio::test]
async fn test_custom_fields_validate_patient_values() {
    let state = test_state();
    let admin = add_user(&state, "root@example.org", RoleName::ADMIN);
    let dietitian = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let admin_token = token_for(&state, &admin);
    let token = token_for(&state, &dietitian);
    let app = nutri_api::app(state);

    let (status, diet_type) = call(
        &app,
        request(
            "POST",
            "/v1/custom-fields",
            Some(&admin_token),
            Some(json!({
                "key": "diet_type",
                "label": "Diet",
                "field_type": { "type": "select", "options": ["vegan", "keto"] },
                "target": "patient",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{diet_type}");
    let (status, _) = call(
        &app,
        request(
            "POST",
            "/v1/custom-fields",
            Some(&admin_token),
            Some(json!({
                "key": "target_kcal",
                "label": "Daily kcal target",
                "field_type": { "type": "number" },
                "required": true,
                "target": "patient",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let create = |fields: Value| {
        request(
            "POST",
            "/v1/patients",
            Some(&token),
            Some(json!({ "first_name": "Ola", "last_name": "Nowak", "custom_fields": fields })),
        )
    };
    for (fields, needle) in [
        (json!({ "diet_type": "paleo", "target_kcal": 1800 }), "diet_type"),
        (json!({ "diet_type": "vegan" }), "target_kcal"),
        (json!({ "target_kcal": 1800, "shoe_size": 38 }), "unknown custom field"),
    ] {
        let (status, body) = call(&app, create(fields)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert!(body["error"]["message"].as_str().unwrap().contains(needle), "{body}");
    }
    let (status, patient) = call(&app, create(json!({ "diet_type": "vegan", "target_kcal": 1800 }))).await;
    assert_eq!(status, StatusCode::CREATED, "{patient}");

    let uri = format!("/v1/patients/{}/custom-fields", patient["id"].as_str().unwrap());
    let (status, _) = call(
        &app,
        request("PUT", &uri, Some(&token), Some(json!({ "diet_type": "keto" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(
        &app,
        request("PUT", &uri, Some(&token), Some(json!({ "target_kcal": "lots" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = call(
        &app,
        request(
            "PUT",
            &uri,
            Some(&token),
            Some(json!({ "diet_type": "keto", "target_kcal": 1600 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["custom_fields"]["diet_type"], "keto");

    // A definition that still holds values cannot be removed.
    let field_uri = format!("/v1/custom-fields/{}", diet_type["id"].as_str().unwrap());
    let (status, body) = call(&app, request("DELETE", &field_uri, Some(&admin_token), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"].as_str().unwrap().contains("1 records"));

    let (status, _) = call(
        &app,
        request("PUT", &uri, Some(&token), Some(json!({ "target_kcal": 1600 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, request("DELETE", &field_uri, Some(&admin_token), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

// -- Measures -----------------------------------------------------------------

#[tokio::test]
async fn test_recording_measures_derives_bmi() {
    let state = test_state();
    let admin = add_user(&state, "root@example.org", RoleName::ADMIN);
    let dietitian = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &dietitian);
    let app = nutri_api::app(state.clone());
    let patient = create_patient(&app, &token, "Ewa", "Lis").await;
    let uri = format!("/v1/patients/{}/measures", patient["id"].as_str().unwrap());

    let (status, body) = call(
        &app,
        request(
            "POST",
            &uri,
            Some(&token),
            Some(json!({ "values": { "weight": 80, "height": 180 } })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 3);
    let bmi = records.iter().find(|m| m["code"] == "bmi").unwrap();
    assert_eq!(bmi["derived"], true);
    assert_eq!(bmi["value"], 24.69);

    // A new weight is combined with the height already on file.
    let (status, body) = call(
        &app,
        request("POST", &uri, Some(&token), Some(json!({ "values": { "weight": 90 } }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let bmi = body.as_array().unwrap().iter().find(|m| m["code"] == "bmi").unwrap().clone();
    assert_eq!(bmi["value"], 27.78);

    let (status, body) = call(
        &app,
        request("POST", &uri, Some(&token), Some(json!({ "values": { "bmi": 22 } }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("computed"));

    let (_, history) = call(&app, request("GET", &format!("{uri}?code=bmi"), Some(&token), None)).await;
    assert_eq!(history.as_array().unwrap().len(), 2);

    // Height feeds the BMI formula, so it cannot become a text measure.
    let (status, body) = call(
        &app,
        request(
            "POST",
            "/v1/measures/definitions",
            Some(&token_for(&state, &admin)),
            Some(json!({ "code": "height", "name": "Height", "kind": "text" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("bmi"));
}

// -- Recipes ------------------------------------------------------------------

#[tokio::test]
async fn test_recipe_nutrition_totals_and_per_serving() {
    let state = test_state();
    let dietitian = add_user(&state, "anna@example.org", RoleName::DIETITIAN);
    let token = token_for(&state, &dietitian);
    let app = nutri_api::app(state);

    let mut ingredient_ids = Vec::new();
    for (name, per_100g) in [
        ("Oats", json!({ "kcal": 389.0, "protein_g": 17.0, "carbs_g": 66.0, "fat_g": 7.0 })),
        ("Milk", json!({ "kcal": 64.0, "protein_g": 3.5, "carbs_g": 5.0, "fat_g": 3.5 })),
    ] {
        let (status, body) = call(
            &app,
            request(
                "POST",
                "/v1/ingredients",
                Some(&token),
                Some(json!({ "name": name, "per_100g": per_100g })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        ingredient_ids.push(body["id"].as_str().unwrap().to_string());
    }

    let (status, recipe) = call(
        &app,
        request(
            "POST",
            "/v1/recipes",
            Some(&token),
            Some(json!({
                "title": "Porridge",
                "servings": 2,
                "items": [
                    { "ingredient_id": ingredient_ids[0], "grams": 100.0 },
                    { "ingredient_id": ingredient_ids[1], "grams": 200.0 },
                ],
                "tags": ["Breakfast"],
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{recipe}");
    assert_eq!(recipe["tags"], json!(["breakfast"]));

    let uri = format!("/v1/recipes/{}/nutrition", recipe["id"].as_str().unwrap());
    let (status, nutrition) = call(&app, request("GET", &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nutrition["servings"], 2);
    assert_eq!(
        nutrition["total"],
        json!({ "kcal": 517.0, "protein_g": 24.0, "carbs_g": 76.0, "fat_g": 14.0 })
    );
    assert_eq!(
        nutrition["per_serving"],
        json!({ "kcal": 258.5, "protein_g": 12.0, "carbs_g": 38.0, "fat_g": 7.0 })
    );

    let (status, _) = call(
        &app,
        request(
            "POST",
            "/v1/recipes",
            Some(&token),
            Some(json!({
                "title": "Mystery",
                "servings": 1,
                "items": [{ "ingredient_id": UserId::new(), "grams": 50.0 }],
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
