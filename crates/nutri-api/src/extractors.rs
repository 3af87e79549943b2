//! # Request Extraction
//!
//! Handlers take `Result<Json<T>, JsonRejection>` (or `Query`) instead of the
//! bare extractor so malformed input surfaces as our JSON error envelope
//! rather than axum's plain-text rejection. Request DTOs implement
//! [`Validate`] for the checks serde cannot express.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::Query;
use axum::Json;

use crate::error::AppError;

/// Business-rule checks on a deserialized request body.
pub trait Validate {
    /// `Err` carries a message for the 400 response.
    fn validate(&self) -> Result<(), String>;
}

/// Trimmed `value` must be 1..=`max` characters.
pub fn check_len(field: &str, value: &str, max: usize) -> Result<(), String> {
    let len = value.trim().chars().count();
    if len == 0 || len > max {
        return Err(format!("{field} must be 1-{max} characters"));
    }
    Ok(())
}

/// Unwrap a JSON body; syntax and type errors become 400 `BAD_REQUEST`.
pub fn extract_json<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "rejected request body");
            Err(AppError::BadRequest(rejection.body_text()))
        }
    }
}

/// [`extract_json`], then [`Validate::validate`] (400 `VALIDATION_ERROR`).
pub fn extract_validated_json<T: Validate>(
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    let value = extract_json(body)?;
    value.validate().map_err(AppError::Validation)?;
    Ok(value)
}

/// Unwrap query parameters; unparseable filters become 400 `BAD_REQUEST`.
pub fn extract_query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Title(String);

    impl Validate for Title {
        fn validate(&self) -> Result<(), String> {
            check_len("title", &self.0, 5)
        }
    }

    #[test]
    fn length_counts_characters_after_trimming() {
        assert!(check_len("title", "  żółw ", 5).is_ok());
        assert!(check_len("title", "   ", 5).is_err());
        let err = check_len("title", "sixsix", 5).unwrap_err();
        assert_eq!(err, "title must be 1-5 characters");
    }

    #[test]
    fn validation_failure_maps_to_validation_error() {
        let ok = extract_validated_json(Ok(Json(Title("menu".into())))).unwrap();
        assert_eq!(ok.0, "menu");
        let err = extract_validated_json(Ok(Json(Title(String::new())))).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
