//! # Placeholder Templates
//!
//! Follow-up drafts are produced by an external language model that must
//! never see patient data. Prompts and model output use `{{name}}`
//! placeholders instead; real values are substituted server-side by literal
//! string replacement just before a draft is shown or sent.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

/// Placeholder name → real value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderValues {
    values: BTreeMap<String, String>,
}

impl PlaceholderValues {
    /// An empty set of values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value. Names outside `[a-z_]+` are ignored.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if valid_name(name) {
            self.values.insert(name.to_string(), value.into());
        }
        self
    }

    /// The value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Names that have a value.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Replace every known `{{name}}` in `text` with its value.
    ///
    /// Unknown placeholders are left untouched.
    pub fn render(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in &self.values {
            out = out.replace(&format!("{OPEN}{name}{CLOSE}"), value);
        }
        out
    }

    /// Placeholders in `text` that have no value.
    pub fn unresolved(&self, text: &str) -> BTreeSet<String> {
        placeholders(text)
            .into_iter()
            .filter(|name| !self.values.contains_key(name))
            .collect()
    }

    /// Replace real values in `text` with their placeholders.
    ///
    /// Matching ignores case, so "MARIE" and "marie" both hide "Marie".
    /// Longer values are replaced first so a value containing another
    /// (e.g. a full name containing the first name) is matched whole.
    /// Empty values are skipped.
    pub fn pseudonymize(&self, text: &str) -> String {
        let mut pairs: Vec<(&String, &str)> = self
            .values
            .iter()
            .map(|(name, value)| (name, value.trim()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        pairs.sort_by(|a, b| {
            b.1.chars()
                .count()
                .cmp(&a.1.chars().count())
                .then_with(|| a.0.cmp(b.0))
        });
        let mut out = text.to_string();
        for (name, value) in pairs {
            out = replace_caseless(&out, value, &format!("{OPEN}{name}{CLOSE}"));
        }
        out
    }
}

fn same_letter(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Length in bytes of a well-formed placeholder at the start of `text`.
fn placeholder_prefix(text: &str) -> Option<usize> {
    let after = text.strip_prefix(OPEN)?;
    let end = after.find(CLOSE)?;
    valid_name(&after[..end]).then_some(OPEN.len() + end + CLOSE.len())
}

/// Length in bytes of the prefix of `haystack` matching `needle` caselessly.
fn caseless_prefix(haystack: &str, needle: &str) -> Option<usize> {
    let mut hay = haystack.char_indices();
    for n in needle.chars() {
        match hay.next() {
            Some((_, h)) if same_letter(h, n) => {}
            _ => return None,
        }
    }
    Some(hay.next().map_or(haystack.len(), |(i, _)| i))
}

/// `str::replace` with case-insensitive matching of `needle`.
///
/// Placeholders already present in `haystack` are copied through untouched.
fn replace_caseless(haystack: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let mut out = String::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        let rest = &haystack[i..];
        if let Some(len) = placeholder_prefix(rest) {
            out.push_str(&rest[..len]);
            i += len;
        } else if let Some(len) = caseless_prefix(rest, needle) {
            out.push_str(replacement);
            i += len;
        } else if let Some(c) = rest.chars().next() {
            out.push(c);
            i += c.len_utf8();
        } else {
            break;
        }
    }
    out
}

/// Every well-formed placeholder name appearing in `text`.
pub fn placeholders(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        match after.find(CLOSE) {
            Some(end) => {
                let name = &after[..end];
                if valid_name(name) {
                    found.insert(name.to_string());
                    rest = &after[end + CLOSE.len()..];
                } else {
                    rest = after;
                }
            }
            None => break,
        }
    }
    found
}

/// Data available when drafting a visit follow-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpContext {
    /// Patient first name.
    pub patient_first_name: String,
    /// Patient last name.
    pub patient_last_name: String,
    /// Practitioner display name.
    pub dietitian_name: String,
    /// Date of the visit.
    pub visit_date: Option<NaiveDate>,
    /// Date of the next planned visit.
    pub next_visit_date: Option<NaiveDate>,
    /// Latest weight in kg.
    pub weight_kg: Option<f64>,
    /// Latest BMI.
    pub bmi: Option<f64>,
    /// Practice name used in signatures.
    pub practice_name: Option<String>,
    /// Patient email address.
    pub patient_email: Option<String>,
    /// Patient phone number.
    pub patient_phone: Option<String>,
}

impl FollowUpContext {
    /// Placeholder values for this context. Missing data is omitted.
    pub fn values(&self) -> PlaceholderValues {
        let mut v = PlaceholderValues::new();
        v.set("patient_first_name", self.patient_first_name.trim());
        v.set("patient_last_name", self.patient_last_name.trim());
        v.set(
            "patient_name",
            format!(
                "{} {}",
                self.patient_first_name.trim(),
                self.patient_last_name.trim()
            )
            .trim()
            .to_string(),
        );
        v.set("dietitian_name", self.dietitian_name.trim());
        if let Some(d) = self.visit_date {
            v.set("visit_date", d.format("%Y-%m-%d").to_string());
        }
        if let Some(d) = self.next_visit_date {
            v.set("next_visit_date", d.format("%Y-%m-%d").to_string());
        }
        if let Some(w) = self.weight_kg {
            v.set("weight", format!("{w:.1} kg"));
        }
        if let Some(b) = self.bmi {
            v.set("bmi", format!("{b:.1}"));
        }
        if let Some(p) = &self.practice_name {
            v.set("practice_name", p.trim());
        }
        if let Some(e) = &self.patient_email {
            v.set("patient_email", e.trim());
        }
        if let Some(p) = &self.patient_phone {
            v.set("patient_phone", p.trim());
        }
        v
    }

    /// Placeholder names the model may use in a draft.
    pub fn available_placeholders(&self) -> Vec<String> {
        self.values().names().map(str::to_string).collect()
    }
}
