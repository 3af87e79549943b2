//! # Custom Fields
//!
//! Practices extend patient and visit records with their own typed fields.
//! Values travel as JSON and are validated against the definitions for the
//! record's target before they are stored.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::identity::CustomFieldId;

/// Value type of a custom field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum CustomFieldType {
    /// Free text.
    Text,
    /// Any finite number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// `YYYY-MM-DD` string.
    Date,
    /// One of a fixed list of strings.
    Select(Vec<String>),
}

/// Which record kind a field extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomFieldTarget {
    /// Patient records.
    Patient,
    /// Visit records.
    Visit,
}

/// Maximum length of a text value.
pub const MAX_TEXT_LEN: usize = 2000;

/// A custom field definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    /// Identifier.
    pub id: CustomFieldId,
    /// Storage key (`[a-z][a-z0-9_]*`), unique per target.
    pub key: String,
    /// Display label.
    pub label: String,
    /// Value type.
    pub field_type: CustomFieldType,
    /// Whether records must carry a value.
    #[serde(default)]
    pub required: bool,
    /// Extended record kind.
    pub target: CustomFieldTarget,
}

impl CustomFieldDefinition {
    fn err(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::CustomField {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }

    /// Check the definition itself.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut chars = self.key.chars();
        let key_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && self.key.len() <= 64;
        if !key_ok {
            return Err(self.err("key must match [a-z][a-z0-9_]* (max 64)"));
        }
        if self.label.trim().is_empty() {
            return Err(self.err("label must not be empty"));
        }
        if let CustomFieldType::Select(options) = &self.field_type {
            if options.is_empty() {
                return Err(self.err("select fields need at least one option"));
            }
            let mut seen = std::collections::BTreeSet::new();
            if !options.iter().all(|o| !o.trim().is_empty() && seen.insert(o)) {
                return Err(self.err("select options must be non-empty and unique"));
            }
        }
        Ok(())
    }

    /// Check a single value. `null` is accepted only for optional fields.
    pub fn validate_value(&self, value: &Value) -> Result<(), ValidationError> {
        if value.is_null() {
            return if self.required {
                Err(self.err("value is required"))
            } else {
                Ok(())
            };
        }
        match (&self.field_type, value) {
            (CustomFieldType::Text, Value::String(s)) if s.chars().count() <= MAX_TEXT_LEN => {
                Ok(())
            }
            (CustomFieldType::Text, Value::String(_)) => {
                Err(self.err(format!("text exceeds {MAX_TEXT_LEN} characters")))
            }
            (CustomFieldType::Number, Value::Number(n)) if n.as_f64().is_some_and(f64::is_finite) => {
                Ok(())
            }
            (CustomFieldType::Boolean, Value::Bool(_)) => Ok(()),
            (CustomFieldType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| self.err("expected a YYYY-MM-DD date")),
            (CustomFieldType::Select(options), Value::String(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(self.err(format!("'{s}' is not one of the allowed options")))
                }
            }
            (ty, _) => Err(self.err(format!("expected a {} value", type_name(ty)))),
        }
    }
}

fn type_name(ty: &CustomFieldType) -> &'static str {
    match ty {
        CustomFieldType::Text => "text",
        CustomFieldType::Number => "number",
        CustomFieldType::Boolean => "boolean",
        CustomFieldType::Date => "date",
        CustomFieldType::Select(_) => "select",
    }
}

/// Validate a record's full value map against `definitions` for `target`.
///
/// Unknown keys are rejected and every required field must be present.
/// Definitions for other targets are ignored.
pub fn validate_all(
    definitions: &[CustomFieldDefinition],
    target: CustomFieldTarget,
    values: &BTreeMap<String, Value>,
) -> Result<(), ValidationError> {
    let relevant: BTreeMap<&str, &CustomFieldDefinition> = definitions
        .iter()
        .filter(|d| d.target == target)
        .map(|d| (d.key.as_str(), d))
        .collect();

    for (key, value) in values {
        match relevant.get(key.as_str()) {
            Some(def) => def.validate_value(value)?,
            None => {
                return Err(ValidationError::CustomField {
                    key: key.clone(),
                    reason: "unknown custom field".into(),
                })
            }
        }
    }
    for def in relevant.values() {
        if def.required && !values.contains_key(&def.key) {
            return Err(def.err("value is required"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(key: &str, field_type: CustomFieldType, required: bool) -> CustomFieldDefinition {
        CustomFieldDefinition {
            id: CustomFieldId::new(),
            key: key.into(),
            label: key.to_uppercase(),
            field_type,
            required,
            target: CustomFieldTarget::Patient,
        }
    }

    fn defs() -> Vec<CustomFieldDefinition> {
        let mut visit_only = def("mood", CustomFieldType::Text, true);
        visit_only.target = CustomFieldTarget::Visit;
        vec![
            def("allergies", CustomFieldType::Text, false),
            def("sport_hours", CustomFieldType::Number, false),
            def("vegetarian", CustomFieldType::Boolean, true),
            def("since", CustomFieldType::Date, false),
            def(
                "goal",
                CustomFieldType::Select(vec!["lose".into(), "gain".into(), "keep".into()]),
                false,
            ),
            visit_only,
        ]
    }

    fn map(v: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn accepts_valid_values() {
        let values = map(json!({
            "allergies": "nuts",
            "sport_hours": 3.5,
            "vegetarian": true,
            "since": "2024-02-29",
            "goal": "keep"
        }));
        validate_all(&defs(), CustomFieldTarget::Patient, &values).unwrap();
    }

    #[test]
    fn type_mismatches_rejected() {
        let defs = defs();
        for (key, bad) in [
            ("sport_hours", json!("three")),
            ("vegetarian", json!("yes")),
            ("since", json!("2023-02-29")),
            ("goal", json!("bulk")),
            ("allergies", json!(12)),
        ] {
            let d = defs.iter().find(|d| d.key == key).unwrap();
            assert!(d.validate_value(&bad).is_err(), "{key}: {bad}");
        }
    }

    #[test]
    fn unknown_and_missing_required() {
        let defs = defs();
        let unknown = map(json!({ "vegetarian": false, "shoe_size": 42 }));
        let err = validate_all(&defs, CustomFieldTarget::Patient, &unknown).unwrap_err();
        assert!(err.to_string().contains("shoe_size"));

        let missing = map(json!({ "allergies": "none" }));
        let err = validate_all(&defs, CustomFieldTarget::Patient, &missing).unwrap_err();
        assert!(err.to_string().contains("vegetarian"));

        let null_required = map(json!({ "vegetarian": null }));
        assert!(validate_all(&defs, CustomFieldTarget::Patient, &null_required).is_err());
    }

    #[test]
    fn targets_are_separate() {
        let defs = defs();
        let visit = map(json!({ "mood": "good" }));
        validate_all(&defs, CustomFieldTarget::Visit, &visit).unwrap();
        let wrong_target = map(json!({ "vegetarian": true, "mood": "good" }));
        assert!(validate_all(&defs, CustomFieldTarget::Patient, &wrong_target).is_err());
    }

    #[test]
    fn definition_rules() {
        assert!(def("ok_key", CustomFieldType::Text, false).validate().is_ok());
        assert!(def("Bad", CustomFieldType::Text, false).validate().is_err());
        assert!(def("1st", CustomFieldType::Text, false).validate().is_err());
        assert!(def("s", CustomFieldType::Select(vec![]), false).validate().is_err());
        assert!(def("s", CustomFieldType::Select(vec!["a".into(), "a".into()]), false)
            .validate()
            .is_err());
    }

    #[test]
    fn field_type_serde_shape() {
        let json = serde_json::to_value(CustomFieldType::Select(vec!["a".into()])).unwrap();
        assert_eq!(json, json!({ "type": "select", "options": ["a"] }));
        let text: CustomFieldType = serde_json::from_value(json!({ "type": "text" })).unwrap();
        assert_eq!(text, CustomFieldType::Text);
    }
}
