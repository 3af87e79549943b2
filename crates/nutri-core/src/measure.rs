//! # Measures
//!
//! Measure definitions describe what a practice records about a patient
//! (weight, height, waist, blood pressure, ...). Calculated measures are
//! derived from others through a [`Formula`]; the catalog validates that
//! formulas only reference known numeric measures and that no dependency
//! cycle is introduced, then evaluates them in dependency order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::formula::Formula;
use crate::identity::MeasureId;

/// How a measure's value is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureKind {
    /// A number entered by the practitioner.
    Numeric,
    /// Free text.
    Text,
    /// Yes / no.
    Boolean,
    /// A number derived from other measures by formula.
    Calculated,
}

impl MeasureKind {
    /// Whether values of this kind are numbers usable in formulas.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Numeric | Self::Calculated)
    }
}

/// A measure definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureDefinition {
    /// Identifier.
    pub id: MeasureId,
    /// Stable code used in formulas (`[a-z_][a-z0-9_]*`).
    pub code: String,
    /// Display name.
    pub name: String,
    /// Display unit (e.g. `kg`).
    #[serde(default)]
    pub unit: Option<String>,
    /// Capture kind.
    pub kind: MeasureKind,
    /// Formula for calculated measures.
    #[serde(default)]
    pub formula: Option<Formula>,
    /// Inclusive lower bound for numeric values.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric values.
    #[serde(default)]
    pub max: Option<f64>,
}

impl MeasureDefinition {
    fn err(&self, reason: impl Into<String>) -> ValidationError {
        ValidationError::Measure {
            code: self.code.clone(),
            reason: reason.into(),
        }
    }

    /// Check a numeric value against the definition's bounds.
    pub fn check_value(&self, value: f64) -> Result<(), ValidationError> {
        if !value.is_finite() {
            return Err(self.err("value must be a finite number"));
        }
        if let Some(min) = self.min {
            if value < min {
                return Err(self.err(format!("value {value} is below minimum {min}")));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(self.err(format!("value {value} is above maximum {max}")));
            }
        }
        Ok(())
    }
}

fn valid_code(code: &str) -> bool {
    let mut chars = code.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && code.len() <= 64
}

/// A set of measure definitions keyed by code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasureCatalog {
    by_code: BTreeMap<String, MeasureDefinition>,
}

impl MeasureCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog every practice starts with: weight, height and BMI.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        let defs = [
            MeasureDefinition {
                id: MeasureId::new(),
                code: "weight".into(),
                name: "Weight".into(),
                unit: Some("kg".into()),
                kind: MeasureKind::Numeric,
                formula: None,
                min: Some(0.5),
                max: Some(700.0),
            },
            MeasureDefinition {
                id: MeasureId::new(),
                code: "height".into(),
                name: "Height".into(),
                unit: Some("cm".into()),
                kind: MeasureKind::Numeric,
                formula: None,
                min: Some(20.0),
                max: Some(280.0),
            },
            MeasureDefinition {
                id: MeasureId::new(),
                code: "bmi".into(),
                name: "Body mass index".into(),
                unit: Some("kg/m²".into()),
                kind: MeasureKind::Calculated,
                formula: Formula::parse(BMI_FORMULA).ok(),
                min: None,
                max: None,
            },
        ];
        for def in defs {
            catalog.by_code.insert(def.code.clone(), def);
        }
        catalog
    }

    /// Look up a definition by code.
    pub fn get(&self, code: &str) -> Option<&MeasureDefinition> {
        self.by_code.get(code)
    }

    /// Look up a definition by id.
    pub fn get_by_id(&self, id: &MeasureId) -> Option<&MeasureDefinition> {
        self.by_code.values().find(|d| d.id == *id)
    }

    /// All definitions ordered by code.
    pub fn definitions(&self) -> impl Iterator<Item = &MeasureDefinition> {
        self.by_code.values()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Validate `def` as if it were added to (or replaced in) this catalog.
    pub fn validate_definition(&self, def: &MeasureDefinition) -> Result<(), ValidationError> {
        if !valid_code(&def.code) {
            return Err(def.err("code must match [a-z_][a-z0-9_]* (max 64)"));
        }
        if def.name.trim().is_empty() {
            return Err(def.err("name must not be empty"));
        }
        if let (Some(min), Some(max)) = (def.min, def.max) {
            if min > max {
                return Err(def.err("min must not exceed max"));
            }
        }
        if let Some(existing) = self.get(&def.code) {
            if existing.id != def.id {
                return Err(def.err("code already in use"));
            }
        }
        if !def.kind.is_numeric() {
            if let Some(dependent) = self.dependent_of(&def.code) {
                return Err(def.err(format!(
                    "used by calculated measure '{}' and must stay numeric",
                    dependent.code
                )));
            }
        }

        match (def.kind, &def.formula) {
            (MeasureKind::Calculated, None) => {
                return Err(def.err("calculated measures need a formula"))
            }
            (MeasureKind::Calculated, Some(formula)) => {
                for var in formula.variables() {
                    if var == def.code {
                        return Err(def.err("formula references itself"));
                    }
                    match self.get(&var) {
                        Some(dep) if dep.kind.is_numeric() => {}
                        Some(_) => {
                            return Err(def.err(format!("'{var}' is not a numeric measure")))
                        }
                        None => return Err(def.err(format!("unknown measure '{var}'"))),
                    }
                }
                let mut candidate = self.clone();
                candidate.by_code.insert(def.code.clone(), def.clone());
                if candidate.evaluation_order().is_none() {
                    return Err(def.err("formula introduces a dependency cycle"));
                }
            }
            (_, Some(_)) => return Err(def.err("only calculated measures take a formula")),
            (_, None) => {}
        }
        Ok(())
    }

    /// Validate and insert `def`, replacing a definition with the same code.
    pub fn upsert(&mut self, def: MeasureDefinition) -> Result<(), ValidationError> {
        self.validate_definition(&def)?;
        self.by_code.insert(def.code.clone(), def);
        Ok(())
    }

    /// A calculated measure whose formula reads `code`, if any.
    fn dependent_of(&self, code: &str) -> Option<&MeasureDefinition> {
        self.by_code.values().find(|d| {
            d.code != code
                && d.formula
                    .as_ref()
                    .is_some_and(|f| f.variables().contains(code))
        })
    }

    /// Remove a definition. Fails if a calculated measure depends on it.
    pub fn remove(&mut self, code: &str) -> Result<Option<MeasureDefinition>, ValidationError> {
        if let Some(dep) = self.dependent_of(code) {
            return Err(ValidationError::Measure {
                code: code.to_string(),
                reason: format!("used by calculated measure '{}'", dep.code),
            });
        }
        Ok(self.by_code.remove(code))
    }

    /// Calculated measure codes in dependency order, or `None` on a cycle.
    fn evaluation_order(&self) -> Option<Vec<String>> {
        let calculated: BTreeMap<&str, BTreeSet<String>> = self
            .by_code
            .values()
            .filter_map(|d| d.formula.as_ref().map(|f| (d.code.as_str(), f.variables())))
            .collect();

        let mut order = Vec::with_capacity(calculated.len());
        let mut done: BTreeSet<&str> = BTreeSet::new();
        while done.len() < calculated.len() {
            let ready: Vec<&str> = calculated
                .iter()
                .filter(|(code, _)| !done.contains(*code))
                .filter(|(_, deps)| {
                    deps.iter()
                        .all(|d| !calculated.contains_key(d.as_str()) || done.contains(d.as_str()))
                })
                .map(|(code, _)| *code)
                .collect();
            if ready.is_empty() {
                return None;
            }
            for code in ready {
                done.insert(code);
                order.push(code.to_string());
            }
        }
        Some(order)
    }

    /// Compute every calculated measure whose inputs are available.
    ///
    /// `values` holds the latest numeric value per code. Derived values feed
    /// later formulas. Measures whose inputs are missing or whose evaluation
    /// fails (e.g. division by zero) are skipped.
    pub fn compute_derived(&self, values: &HashMap<String, f64>) -> BTreeMap<String, f64> {
        let mut scope = values.clone();
        let mut derived = BTreeMap::new();
        let Some(order) = self.evaluation_order() else {
            return derived;
        };
        for code in order {
            let Some(formula) = self.by_code.get(&code).and_then(|d| d.formula.as_ref()) else {
                continue;
            };
            if let Ok(v) = formula.evaluate(&scope) {
                scope.insert(code.clone(), v);
                derived.insert(code, v);
            }
        }
        derived
    }
}

/// Formula of the built-in BMI measure (weight in kg, height in cm).
pub const BMI_FORMULA: &str = "weight / (height / 100) ^ 2";

/// Compute BMI from weight (kg) and height (cm).
pub fn bmi(weight_kg: f64, height_cm: f64) -> Option<f64> {
    if weight_kg <= 0.0 || height_cm <= 0.0 {
        return None;
    }
    let m = height_cm / 100.0;
    Some(weight_kg / (m * m))
}

/// WHO adult BMI category.
pub fn bmi_category(bmi: f64) -> &'static str {
    match bmi {
        b if b < 18.5 => "underweight",
        b if b < 25.0 => "normal",
        b if b < 30.0 => "overweight",
        _ => "obese",
    }
}
