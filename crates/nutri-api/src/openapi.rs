//! # OpenAPI Specification Assembly
//!
//! Assembles all utoipa-documented routes into a single OpenAPI spec,
//! served at `/openapi.json` to authenticated callers.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::state::AppState;

/// Assembled OpenAPI spec for the entire API surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Nutri Practice API",
        version = "0.1.0",
        description = "Role-based REST backend for a dietitian practice: patients, visits, measures, billing, documents, recipes and AI-assisted follow-ups."
    ),
    paths(
        // Auth
        crate::routes::auth::login,
        crate::routes::auth::me,
        crate::routes::auth::change_password,
        crate::routes::auth::list_api_keys,
        crate::routes::auth::create_api_key,
        crate::routes::auth::revoke_api_key,
        // Users & roles
        crate::routes::users::list_users,
        crate::routes::users::create_user,
        crate::routes::users::get_user,
        crate::routes::users::update_user,
        crate::routes::users::deactivate_user,
        crate::routes::users::unlock_user,
        crate::routes::users::list_roles,
        crate::routes::users::list_permissions,
        crate::routes::users::update_role,
        // Patients
        crate::routes::patients::list_patients,
        crate::routes::patients::create_patient,
        crate::routes::patients::get_patient,
        crate::routes::patients::update_patient,
        crate::routes::patients::delete_patient,
        crate::routes::patients::link_dietitian,
        crate::routes::patients::unlink_dietitian,
        crate::routes::patients::replace_custom_fields,
        // Visits
        crate::routes::visits::list_visits,
        crate::routes::visits::create_visit,
        crate::routes::visits::get_visit,
        crate::routes::visits::update_visit,
        crate::routes::visits::delete_visit,
        // Measures
        crate::routes::measures::list_definitions,
        crate::routes::measures::save_definition,
        crate::routes::measures::delete_definition,
        crate::routes::measures::validate_formula,
        crate::routes::measures::list_measurements,
        crate::routes::measures::record_measurements,
        // Billing
        crate::routes::billing::list_invoices,
        crate::routes::billing::create_invoice,
        crate::routes::billing::get_invoice,
        crate::routes::billing::update_items,
        crate::routes::billing::send_invoice,
        crate::routes::billing::record_payment,
        crate::routes::billing::cancel_invoice,
        // Documents
        crate::routes::documents::list_documents,
        crate::routes::documents::register_document,
        crate::routes::documents::get_document,
        crate::routes::documents::delete_document,
        // Recipes
        crate::routes::recipes::list_ingredients,
        crate::routes::recipes::create_ingredient,
        crate::routes::recipes::list_recipes,
        crate::routes::recipes::create_recipe,
        crate::routes::recipes::get_recipe,
        crate::routes::recipes::update_recipe,
        crate::routes::recipes::delete_recipe,
        crate::routes::recipes::recipe_nutrition,
        // Custom fields
        crate::routes::custom_fields::list_fields,
        crate::routes::custom_fields::create_field,
        crate::routes::custom_fields::delete_field,
        // Follow-ups
        crate::routes::followups::generate_followup,
        crate::routes::followups::send_followup,
        crate::routes::followups::list_emails,
        // Scheduler
        crate::routes::scheduler::list_jobs,
        crate::routes::scheduler::enable_job,
        crate::routes::scheduler::disable_job,
        crate::routes::scheduler::trigger_job,
        // Audit
        crate::routes::audit::list_audit,
        crate::routes::audit::verify_chain,
    ),
    components(schemas(
        // State record types
        crate::state::UserView,
        crate::state::PatientRecord,
        crate::state::VisitRecord,
        crate::state::VisitStatus,
        crate::state::MeasurementRecord,
        crate::state::DocumentRecord,
        crate::state::ApiKeyRecord,
        crate::state::EmailLogRecord,
        crate::state::EmailStatus,
        crate::audit::AuditEntry,
        crate::audit::ChainIntegrity,
        // Error types
        crate::error::ErrorBody,
        crate::error::ErrorDetail,
        // Auth DTOs
        crate::routes::auth::LoginRequest,
        crate::routes::auth::LoginResponse,
        crate::routes::auth::MeResponse,
        crate::routes::auth::ChangePasswordRequest,
        crate::routes::auth::CreateApiKeyRequest,
        crate::routes::auth::CreatedApiKey,
        // User DTOs
        crate::routes::users::CreateUserRequest,
        crate::routes::users::UpdateUserRequest,
        crate::routes::users::RoleView,
        crate::routes::users::PermissionView,
        crate::routes::users::UpdateRoleRequest,
        // Patient & visit DTOs
        crate::routes::patients::CreatePatientRequest,
        crate::routes::patients::UpdatePatientRequest,
        crate::routes::patients::LinkDietitianRequest,
        crate::routes::visits::CreateVisitRequest,
        crate::routes::visits::UpdateVisitRequest,
        // Measure DTOs
        crate::routes::measures::MeasureDefinitionView,
        crate::routes::measures::SaveMeasureRequest,
        crate::routes::measures::ValidateFormulaRequest,
        crate::routes::measures::FormulaCheck,
        crate::routes::measures::RecordMeasuresRequest,
        // Billing DTOs
        crate::routes::billing::LineItemBody,
        crate::routes::billing::PaymentBody,
        crate::routes::billing::InvoiceView,
        crate::routes::billing::CreateInvoiceRequest,
        crate::routes::billing::UpdateItemsRequest,
        // Document DTOs
        crate::routes::documents::RegisterDocumentRequest,
        // Recipe DTOs
        crate::routes::recipes::NutritionBody,
        crate::routes::recipes::IngredientView,
        crate::routes::recipes::CreateIngredientRequest,
        crate::routes::recipes::RecipeItemBody,
        crate::routes::recipes::RecipeView,
        crate::routes::recipes::SaveRecipeRequest,
        crate::routes::recipes::RecipeNutrition,
        // Custom field DTOs
        crate::routes::custom_fields::CustomFieldView,
        crate::routes::custom_fields::CreateCustomFieldRequest,
        // Follow-up DTOs
        crate::routes::followups::FollowUpRequest,
        crate::routes::followups::FollowUpDraft,
        crate::routes::followups::SendFollowUpRequest,
        // Scheduler DTOs
        crate::routes::scheduler::JobView,
        crate::routes::scheduler::TriggerResult,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Login, current user, password and API keys"),
        (name = "users", description = "User administration"),
        (name = "roles", description = "Roles and permissions"),
        (name = "patients", description = "Patient records"),
        (name = "visits", description = "Consultations"),
        (name = "measures", description = "Measure catalog and patient measurements"),
        (name = "billing", description = "Invoices and payments"),
        (name = "documents", description = "Patient document metadata"),
        (name = "recipes", description = "Ingredients and recipes"),
        (name = "custom_fields", description = "Practice-defined fields"),
        (name = "followups", description = "AI follow-up drafts and patient emails"),
        (name = "scheduler", description = "Background jobs"),
        (name = "audit", description = "Audit trail"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
        components.add_security_scheme(
            "api_key",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
        );
    }
}

/// Build the OpenAPI router.
pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json))
}

/// GET /openapi.json — Return the generated OpenAPI specification.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
