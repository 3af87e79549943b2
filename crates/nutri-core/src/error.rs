//! # Error Hierarchy
//!
//! Shared validation errors for domain primitives plus a top-level
//! [`CoreError`] that wraps every subsystem error. Subsystems (formulas,
//! invoices, schedules, role tables) define their own enums next to the
//! code that raises them.

use thiserror::Error;

use crate::billing::InvoiceError;
use crate::formula::FormulaError;
use crate::password::PasswordError;
use crate::rbac::{AccessDenied, RoleTableError};
use crate::schedule::ScheduleError;

/// Top-level error type for the domain core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Domain primitive validation failure.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The principal lacks a required permission.
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    /// Role table could not be loaded or modified.
    #[error("role table error: {0}")]
    RoleTable(#[from] RoleTableError),

    /// Measure formula could not be parsed or evaluated.
    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),

    /// Invoice lifecycle violation.
    #[error("invoice error: {0}")]
    Invoice(#[from] InvoiceError),

    /// Job schedule could not be parsed.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Password hashing or policy failure.
    #[error("password error: {0}")]
    Password(#[from] PasswordError),
}

/// Validation errors for domain primitives and request-level records.
///
/// Each variant carries the offending input so operators can diagnose bad
/// data without reproducing the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Email address does not look like `local@domain.tld`.
    #[error("invalid email address: \"{0}\"")]
    InvalidEmail(String),

    /// Role name is not upper-case `[A-Z_]{{2,32}}`.
    #[error("invalid role name: \"{0}\" (expected 2-32 characters of A-Z or _)")]
    InvalidRoleName(String),

    /// Permission code is not in the catalogue.
    #[error("unknown permission code: \"{0}\"")]
    UnknownPermission(String),

    /// A required field was empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// A field exceeded its maximum length.
    #[error("{field} must not exceed {max} characters")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Maximum permitted length.
        max: usize,
    },

    /// A custom field value did not match its declared type.
    #[error("custom field \"{key}\": {reason}")]
    CustomField {
        /// Custom field key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A measure definition or value was rejected.
    #[error("measure \"{code}\": {reason}")]
    Measure {
        /// Measure code.
        code: String,
        /// Why the definition or value was rejected.
        reason: String,
    },

    /// A recipe or ingredient was rejected.
    #[error("recipe: {0}")]
    Recipe(String),
}

/// Check a free-text field is non-empty after trimming and within `max` chars.
///
/// Returns the trimmed value.
pub fn require_text(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if trimmed.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_text_trims() {
        assert_eq!(require_text("name", "  Ada ", 10).unwrap(), "Ada");
    }

    #[test]
    fn require_text_rejects_blank() {
        assert_eq!(
            require_text("name", "   ", 10),
            Err(ValidationError::EmptyField("name"))
        );
    }

    #[test]
    fn require_text_rejects_long() {
        let err = require_text("name", "abcdef", 3).unwrap_err();
        assert_eq!(err.to_string(), "name must not exceed 3 characters");
    }

    #[test]
    fn validation_converts_to_core_error() {
        let err: CoreError = ValidationError::InvalidEmail("x".into()).into();
        assert!(err.to_string().contains("invalid email"));
    }
}
