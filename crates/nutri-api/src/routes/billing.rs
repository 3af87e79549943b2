//! # Invoices
//!
//! Lifecycle: `draft → sent → partially_paid → paid`, with `cancelled`
//! reachable from any non-terminal state that has no payments. Transition
//! rules live in [`nutri_core::billing`]; violations answer 409.
//!
//! Invoices follow the visibility of their patient.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use nutri_core::billing::invoice_number;
use nutri_core::{Invoice, InvoiceId, InvoiceStatus, LineItem, PatientId, Payment, Permission, UserId};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::patients::{load_patient, visible_patient_ids};
use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query, extract_validated_json, Validate};
use crate::state::AppState;

// ── DTOs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LineItemBody {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl From<LineItemBody> for LineItem {
    fn from(b: LineItemBody) -> Self {
        Self {
            description: b.description.trim().to_string(),
            quantity: b.quantity,
            unit_price_cents: b.unit_price_cents,
        }
    }
}

impl From<&LineItem> for LineItemBody {
    fn from(i: &LineItem) -> Self {
        Self {
            description: i.description.clone(),
            quantity: i.quantity,
            unit_price_cents: i.unit_price_cents,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentBody {
    pub amount_cents: i64,
    /// Defaults to now.
    pub received_at: Option<DateTime<Utc>>,
    pub method: Option<String>,
}

/// An invoice with computed totals.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InvoiceView {
    #[schema(value_type = String)]
    pub id: InvoiceId,
    pub number: String,
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    #[schema(value_type = String)]
    pub created_by: UserId,
    /// `draft`, `sent`, `partially_paid`, `paid` or `cancelled`.
    #[schema(value_type = String)]
    pub status: InvoiceStatus,
    pub items: Vec<LineItemBody>,
    pub payments: Vec<PaymentBody>,
    pub due_date: Option<NaiveDate>,
    pub currency: String,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub balance_cents: i64,
    pub overdue: bool,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl From<&Invoice> for InvoiceView {
    fn from(i: &Invoice) -> Self {
        Self {
            id: i.id,
            number: i.number.clone(),
            patient_id: i.patient_id,
            created_by: i.created_by,
            status: i.status,
            items: i.items.iter().map(LineItemBody::from).collect(),
            payments: i
                .payments
                .iter()
                .map(|p| PaymentBody {
                    amount_cents: p.amount_cents,
                    received_at: Some(p.received_at),
                    method: p.method.clone(),
                })
                .collect(),
            due_date: i.due_date,
            currency: i.currency.clone(),
            total_cents: i.total_cents(),
            paid_cents: i.paid_cents(),
            balance_cents: i.balance_cents(),
            overdue: i.is_overdue(Utc::now().date_naive()),
            created_at: i.created_at,
            sent_at: i.sent_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateInvoiceRequest {
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    pub items: Vec<LineItemBody>,
    pub due_date: Option<NaiveDate>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl Validate for CreateInvoiceRequest {
    fn validate(&self) -> Result<(), String> {
        if self.items.len() > 100 {
            return Err("an invoice holds at most 100 line items".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateItemsRequest {
    pub items: Vec<LineItemBody>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct InvoiceListQuery {
    pub patient_id: Option<Uuid>,
    /// Lifecycle state, e.g. `sent`.
    pub status: Option<String>,
    /// Only unpaid invoices past their due date.
    #[serde(default)]
    pub overdue: bool,
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/invoices", get(list_invoices).post(create_invoice))
        .route("/v1/invoices/:id", get(get_invoice).put(update_items))
        .route("/v1/invoices/:id/send", post(send_invoice))
        .route("/v1/invoices/:id/payments", post(record_payment))
        .route("/v1/invoices/:id/cancel", post(cancel_invoice))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn load_invoice(state: &AppState, caller: &CallerIdentity, id: Uuid) -> Result<Invoice, AppError> {
    let invoice = state
        .invoices
        .get(&id)
        .ok_or_else(|| AppError::not_found("invoice", id))?;
    load_patient(state, caller, invoice.patient_id).map_err(|_| AppError::not_found("invoice", id))?;
    Ok(invoice)
}

/// Apply a lifecycle change under the store lock, persist and audit it.
async fn transition(
    state: &AppState,
    caller: &CallerIdentity,
    id: Uuid,
    action: &str,
    f: impl FnOnce(&mut Invoice) -> Result<(), nutri_core::InvoiceError> + Send,
) -> Result<Invoice, AppError> {
    load_invoice(state, caller, id)?;
    let (updated, ()) = state
        .commit_invoice(InvoiceId::from_uuid(id), |inv| f(inv).map_err(AppError::from))
        .await?;
    state
        .record_audit(
            Some(caller.user_id()),
            action,
            "invoice",
            id,
            serde_json::json!({
                "number": updated.number,
                "status": updated.status.as_str(),
                "balance_cents": updated.balance_cents(),
            }),
        )
        .await;
    Ok(updated)
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /v1/invoices — Invoices of visible patients, newest first.
#[utoipa::path(
    get,
    path = "/v1/invoices",
    params(InvoiceListQuery),
    responses(
        (status = 200, description = "Invoices", body = Vec<InvoiceView>),
        (status = 400, description = "Unknown status", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn list_invoices(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<InvoiceListQuery>, QueryRejection>,
) -> Result<Json<Vec<InvoiceView>>, AppError> {
    require_permission(&caller, Permission::BillingRead)?;
    let q = extract_query(query)?;
    let status = q
        .status
        .as_deref()
        .map(|s| {
            InvoiceStatus::parse(s)
                .ok_or_else(|| AppError::Validation(format!("unknown invoice status '{s}'")))
        })
        .transpose()?;
    let today = Utc::now().date_naive();
    let visible = visible_patient_ids(&state, &caller);
    let mut invoices = state.invoices.filter(|i| {
        visible.contains(&i.patient_id)
            && q.patient_id.map_or(true, |p| i.patient_id.as_uuid() == &p)
            && status.map_or(true, |s| i.status == s)
            && (!q.overdue || i.is_overdue(today))
    });
    invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(invoices.iter().map(InvoiceView::from).collect()))
}

/// POST /v1/invoices — Create a draft invoice.
#[utoipa::path(
    post,
    path = "/v1/invoices",
    request_body = CreateInvoiceRequest,
    responses(
        (status = 201, description = "Draft created", body = InvoiceView),
        (status = 400, description = "Invalid items or currency", body = crate::error::ErrorBody),
        (status = 404, description = "Patient not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn create_invoice(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateInvoiceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InvoiceView>), AppError> {
    require_permission(&caller, Permission::BillingWrite)?;
    let req = extract_validated_json(body)?;
    load_patient(&state, &caller, req.patient_id)?;

    let now = Utc::now();
    let items = req.items.into_iter().map(LineItem::from).collect();
    let mut invoice = Invoice::draft(
        req.patient_id,
        caller.user_id(),
        items,
        req.due_date,
        req.currency,
        0,
        now,
    )?;
    // Numbers are only consumed by drafts that validated.
    invoice.number = invoice_number(now.year(), state.next_invoice_seq(now.year()));

    state.persist_invoice(&invoice).await?;
    state.invoices.insert(*invoice.id.as_uuid(), invoice.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "invoice.create",
            "invoice",
            invoice.id,
            serde_json::json!({ "number": invoice.number, "total_cents": invoice.total_cents() }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(InvoiceView::from(&invoice))))
}

/// GET /v1/invoices/:id — Get an invoice.
#[utoipa::path(
    get,
    path = "/v1/invoices/{id}",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Invoice", body = InvoiceView),
        (status = 404, description = "Not found or out of scope", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn get_invoice(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<InvoiceView>, AppError> {
    require_permission(&caller, Permission::BillingRead)?;
    let invoice = load_invoice(&state, &caller, id)?;
    Ok(Json(InvoiceView::from(&invoice)))
}

/// PUT /v1/invoices/:id — Replace the line items of a draft.
#[utoipa::path(
    put,
    path = "/v1/invoices/{id}",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    request_body = UpdateItemsRequest,
    responses(
        (status = 200, description = "Updated", body = InvoiceView),
        (status = 409, description = "Not a draft", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn update_items(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<UpdateItemsRequest>, JsonRejection>,
) -> Result<Json<InvoiceView>, AppError> {
    require_permission(&caller, Permission::BillingWrite)?;
    let req = extract_json(body)?;
    let items: Vec<LineItem> = req.items.into_iter().map(LineItem::from).collect();
    let updated = transition(&state, &caller, id, "invoice.update_items", |inv| {
        inv.set_items(items)
    })
    .await?;
    Ok(Json(InvoiceView::from(&updated)))
}

/// POST /v1/invoices/:id/send — Issue a draft.
#[utoipa::path(
    post,
    path = "/v1/invoices/{id}/send",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Sent", body = InvoiceView),
        (status = 409, description = "Not a draft, or no line items", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn send_invoice(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<InvoiceView>, AppError> {
    require_permission(&caller, Permission::BillingWrite)?;
    let now = Utc::now();
    let updated = transition(&state, &caller, id, "invoice.send", |inv| inv.send(now)).await?;
    Ok(Json(InvoiceView::from(&updated)))
}

/// POST /v1/invoices/:id/payments — Record a payment.
#[utoipa::path(
    post,
    path = "/v1/invoices/{id}/payments",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    request_body = PaymentBody,
    responses(
        (status = 200, description = "Payment recorded", body = InvoiceView),
        (status = 400, description = "Non-positive amount or overpayment", body = crate::error::ErrorBody),
        (status = 409, description = "Invoice not payable", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn record_payment(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<PaymentBody>, JsonRejection>,
) -> Result<Json<InvoiceView>, AppError> {
    require_permission(&caller, Permission::BillingWrite)?;
    let req = extract_json(body)?;
    let payment = Payment {
        amount_cents: req.amount_cents,
        received_at: req.received_at.unwrap_or_else(Utc::now),
        method: req.method,
    };
    let updated = transition(&state, &caller, id, "invoice.payment", |inv| {
        inv.record_payment(payment).map(|_| ())
    })
    .await?;
    Ok(Json(InvoiceView::from(&updated)))
}

/// POST /v1/invoices/:id/cancel — Void an invoice without payments.
#[utoipa::path(
    post,
    path = "/v1/invoices/{id}/cancel",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Cancelled", body = InvoiceView),
        (status = 409, description = "Terminal or has payments", body = crate::error::ErrorBody),
    ),
    tag = "billing"
)]
async fn cancel_invoice(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<InvoiceView>, AppError> {
    require_permission(&caller, Permission::BillingWrite)?;
    let updated = transition(&state, &caller, id, "invoice.cancel", Invoice::cancel).await?;
    Ok(Json(InvoiceView::from(&updated)))
}
