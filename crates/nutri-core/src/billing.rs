//! # Invoice Lifecycle
//!
//! Invoices are built from line items in integer minor units (cents) and
//! move through a small state machine:
//!
//! ```text
//! Draft ──send──▶ Sent ──pay──▶ PartiallyPaid ──pay──▶ Paid
//!   │               │                                   ▲
//!   │               └────────────pay (full)─────────────┘
//!   └──cancel──▶ Cancelled ◀──cancel── Sent (no payments)
//! ```
//!
//! `Paid` and `Cancelled` are terminal. Line items may only be edited while
//! the invoice is a draft.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{InvoiceId, PatientId, UserId};

/// Invoice lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Being prepared; line items are editable.
    Draft,
    /// Issued to the patient.
    Sent,
    /// Some, but not all, of the total has been received.
    PartiallyPaid,
    /// Fully settled.
    Paid,
    /// Voided.
    Cancelled,
}

impl InvoiceStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    /// Lower-case name used in errors and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage name.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => Self::Draft,
            "sent" => Self::Sent,
            "partially_paid" => Self::PartiallyPaid,
            "paid" => Self::Paid,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    /// The requested transition is not allowed from the current state.
    #[error("invalid invoice transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: InvoiceStatus,
        /// Requested state.
        to: InvoiceStatus,
    },

    /// Line items can only change while drafting.
    #[error("invoice is {0}; only drafts can be edited")]
    NotDraft(InvoiceStatus),

    /// An invoice must have at least one line item to be sent.
    #[error("invoice has no line items")]
    Empty,

    /// Quantities and prices must be positive, amounts non-negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A payment would exceed the outstanding balance.
    #[error("payment of {amount} exceeds outstanding balance {balance}")]
    Overpayment {
        /// Attempted payment in cents.
        amount: i64,
        /// Outstanding balance in cents.
        balance: i64,
    },

    /// Payments exist; the invoice cannot be cancelled.
    #[error("invoice has payments and cannot be cancelled")]
    HasPayments,
}

/// One billed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// What was billed.
    pub description: String,
    /// Number of units.
    pub quantity: u32,
    /// Price per unit in cents.
    pub unit_price_cents: i64,
}

impl LineItem {
    /// `quantity × unit_price_cents`, saturating.
    pub fn amount_cents(&self) -> i64 {
        self.unit_price_cents.saturating_mul(i64::from(self.quantity))
    }

    fn check(&self) -> Result<(), InvoiceError> {
        if self.description.trim().is_empty() {
            return Err(InvoiceError::InvalidAmount(
                "line item description must not be empty".into(),
            ));
        }
        if self.quantity == 0 {
            return Err(InvoiceError::InvalidAmount("quantity must be positive".into()));
        }
        if self.unit_price_cents < 0 {
            return Err(InvoiceError::InvalidAmount(
                "unit price must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// A received payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Amount in cents.
    pub amount_cents: i64,
    /// When it was received.
    pub received_at: DateTime<Utc>,
    /// Payment method (cash, card, transfer, ...).
    #[serde(default)]
    pub method: Option<String>,
}

/// Format an invoice number, e.g. `INV-2026-00042`.
pub fn invoice_number(year: i32, seq: u32) -> String {
    format!("INV-{year}-{seq:05}")
}

/// A patient invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Identifier.
    pub id: InvoiceId,
    /// Human-readable number, unique per year.
    pub number: String,
    /// Billed patient.
    pub patient_id: PatientId,
    /// User who created the invoice.
    pub created_by: UserId,
    /// Current state.
    pub status: InvoiceStatus,
    /// Billed items.
    pub items: Vec<LineItem>,
    /// Payments received, oldest first.
    pub payments: Vec<Payment>,
    /// Payment due date.
    pub due_date: Option<NaiveDate>,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the invoice was sent.
    pub sent_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Create a draft invoice numbered from `seq` in the year of `now`.
    pub fn draft(
        patient_id: PatientId,
        created_by: UserId,
        items: Vec<LineItem>,
        due_date: Option<NaiveDate>,
        currency: impl Into<String>,
        seq: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, InvoiceError> {
        for item in &items {
            item.check()?;
        }
        let currency = currency.into().trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(InvoiceError::InvalidAmount(format!(
                "currency '{currency}' is not an ISO 4217 code"
            )));
        }
        Ok(Self {
            id: InvoiceId::new(),
            number: invoice_number(now.year(), seq),
            patient_id,
            created_by,
            status: InvoiceStatus::Draft,
            items,
            payments: Vec::new(),
            due_date,
            currency,
            created_at: now,
            sent_at: None,
        })
    }

    /// Sum of line items in cents.
    pub fn total_cents(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |acc, i| acc.saturating_add(i.amount_cents()))
    }

    /// Sum of payments in cents.
    pub fn paid_cents(&self) -> i64 {
        self.payments
            .iter()
            .fold(0i64, |acc, p| acc.saturating_add(p.amount_cents))
    }

    /// Outstanding amount in cents.
    pub fn balance_cents(&self) -> i64 {
        self.total_cents() - self.paid_cents()
    }

    /// Replace the line items of a draft.
    pub fn set_items(&mut self, items: Vec<LineItem>) -> Result<(), InvoiceError> {
        if self.status != InvoiceStatus::Draft {
            return Err(InvoiceError::NotDraft(self.status));
        }
        for item in &items {
            item.check()?;
        }
        self.items = items;
        Ok(())
    }

    /// Draft → Sent.
    pub fn send(&mut self, now: DateTime<Utc>) -> Result<(), InvoiceError> {
        if self.status != InvoiceStatus::Draft {
            return Err(InvoiceError::InvalidTransition {
                from: self.status,
                to: InvoiceStatus::Sent,
            });
        }
        if self.items.is_empty() {
            return Err(InvoiceError::Empty);
        }
        self.status = InvoiceStatus::Sent;
        self.sent_at = Some(now);
        Ok(())
    }

    /// Record a payment against a sent invoice.
    ///
    /// Moves to `PartiallyPaid` or `Paid` depending on the remaining balance.
    pub fn record_payment(&mut self, payment: Payment) -> Result<InvoiceStatus, InvoiceError> {
        if !matches!(
            self.status,
            InvoiceStatus::Sent | InvoiceStatus::PartiallyPaid
        ) {
            return Err(InvoiceError::InvalidTransition {
                from: self.status,
                to: InvoiceStatus::Paid,
            });
        }
        if payment.amount_cents <= 0 {
            return Err(InvoiceError::InvalidAmount(
                "payment amount must be positive".into(),
            ));
        }
        let balance = self.balance_cents();
        if payment.amount_cents > balance {
            return Err(InvoiceError::Overpayment {
                amount: payment.amount_cents,
                balance,
            });
        }
        self.payments.push(payment);
        self.status = if self.balance_cents() == 0 {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::PartiallyPaid
        };
        Ok(self.status)
    }

    /// Void the invoice. Not allowed once any payment was recorded.
    pub fn cancel(&mut self) -> Result<(), InvoiceError> {
        if self.status.is_terminal() {
            return Err(InvoiceError::InvalidTransition {
                from: self.status,
                to: InvoiceStatus::Cancelled,
            });
        }
        if !self.payments.is_empty() {
            return Err(InvoiceError::HasPayments);
        }
        self.status = InvoiceStatus::Cancelled;
        Ok(())
    }

    /// Whether the invoice is unpaid past its due date.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        matches!(
            self.status,
            InvoiceStatus::Sent | InvoiceStatus::PartiallyPaid
        ) && self.due_date.is_some_and(|due| today > due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-04-10T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn item(desc: &str, qty: u32, price: i64) -> LineItem {
        LineItem {
            description: desc.into(),
            quantity: qty,
            unit_price_cents: price,
        }
    }

    fn pay(amount: i64) -> Payment {
        Payment {
            amount_cents: amount,
            received_at: now(),
            method: Some("card".into()),
        }
    }

    fn invoice() -> Invoice {
        Invoice::draft(
            PatientId::new(),
            UserId::new(),
            vec![item("Consultation", 1, 6000), item("Follow-up", 2, 2500)],
            NaiveDate::from_ymd_opt(2026, 5, 10),
            "eur",
            42,
            now(),
        )
        .unwrap()
    }

    #[test]
    fn numbering_and_totals() {
        let inv = invoice();
        assert_eq!(inv.number, "INV-2026-00042");
        assert_eq!(inv.currency, "EUR");
        assert_eq!(inv.total_cents(), 11_000);
        assert_eq!(inv.balance_cents(), 11_000);
    }

    #[test]
    fn full_lifecycle() {
        let mut inv = invoice();
        inv.send(now()).unwrap();
        assert_eq!(inv.record_payment(pay(5_000)).unwrap(), InvoiceStatus::PartiallyPaid);
        assert_eq!(inv.balance_cents(), 6_000);
        assert_eq!(inv.record_payment(pay(6_000)).unwrap(), InvoiceStatus::Paid);
        assert!(inv.status.is_terminal());
        assert!(inv.cancel().is_err());
    }

    #[test]
    fn payments_require_sent_invoice() {
        let mut inv = invoice();
        assert!(matches!(
            inv.record_payment(pay(100)),
            Err(InvoiceError::InvalidTransition { from: InvoiceStatus::Draft, .. })
        ));
    }

    #[test]
    fn overpayment_and_non_positive_rejected() {
        let mut inv = invoice();
        inv.send(now()).unwrap();
        assert_eq!(
            inv.record_payment(pay(20_000)),
            Err(InvoiceError::Overpayment { amount: 20_000, balance: 11_000 })
        );
        assert!(matches!(inv.record_payment(pay(0)), Err(InvoiceError::InvalidAmount(_))));
        assert!(inv.payments.is_empty());
    }

    #[test]
    fn cancel_rules() {
        let mut draft = invoice();
        draft.cancel().unwrap();
        assert_eq!(draft.status, InvoiceStatus::Cancelled);
        assert!(draft.send(now()).is_err());

        let mut paid_some = invoice();
        paid_some.send(now()).unwrap();
        paid_some.record_payment(pay(100)).unwrap();
        assert_eq!(paid_some.cancel(), Err(InvoiceError::HasPayments));
    }

    #[test]
    fn drafts_only_are_editable() {
        let mut inv = invoice();
        inv.set_items(vec![item("Plan", 1, 9000)]).unwrap();
        assert_eq!(inv.total_cents(), 9000);
        inv.send(now()).unwrap();
        assert_eq!(
            inv.set_items(vec![]),
            Err(InvoiceError::NotDraft(InvoiceStatus::Sent))
        );
    }

    #[test]
    fn empty_invoice_cannot_be_sent() {
        let mut inv = invoice();
        inv.set_items(vec![]).unwrap();
        assert_eq!(inv.send(now()), Err(InvoiceError::Empty));
    }

    #[test]
    fn invalid_items_and_currency() {
        let bad = Invoice::draft(
            PatientId::new(),
            UserId::new(),
            vec![item("x", 0, 100)],
            None,
            "EUR",
            1,
            now(),
        );
        assert!(bad.is_err());
        let bad_currency =
            Invoice::draft(PatientId::new(), UserId::new(), vec![], None, "euro", 1, now());
        assert!(bad_currency.is_err());
    }

    #[test]
    fn overdue() {
        let mut inv = invoice();
        let late = NaiveDate::from_ymd_opt(2026, 5, 11).unwrap();
        assert!(!inv.is_overdue(late), "drafts are never overdue");
        inv.send(now()).unwrap();
        assert!(!inv.is_overdue(NaiveDate::from_ymd_opt(2026, 5, 10).unwrap()));
        assert!(inv.is_overdue(late));
    }

    #[test]
    fn status_names_round_trip() {
        for s in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::PartiallyPaid,
            InvoiceStatus::Paid,
            InvoiceStatus::Cancelled,
        ] {
            assert_eq!(InvoiceStatus::parse(s.as_str()), Some(s));
        }
    }
}
