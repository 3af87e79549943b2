//! # API Route Modules
//!
//! - `auth` — Login (public), current user, password change, API keys.
//! - `users` — User administration and the role/permission table.
//! - `patients` — Patient records, dietitian links, patient custom fields.
//! - `visits` — Consultations scoped through their patient.
//! - `measures` — Measure catalog, formula checks, patient measurements.
//! - `billing` — Invoice lifecycle and payments.
//! - `documents` — Patient document metadata.
//! - `recipes` — Ingredients, recipes and nutrition totals.
//! - `custom_fields` — Practice-defined fields on patients and visits.
//! - `followups` — AI-drafted follow-up emails and the email log.
//! - `scheduler` — Background job control.
//! - `audit` — Audit trail queries and chain verification.

pub mod audit;
pub mod auth;
pub mod billing;
pub mod custom_fields;
pub mod documents;
pub mod followups;
pub mod measures;
pub mod patients;
pub mod recipes;
pub mod scheduler;
pub mod users;
pub mod visits;
