//! # Identity Newtypes
//!
//! Domain-primitive newtypes for identifiers. Each identifier is a distinct
//! type; you cannot pass a [`VisitId`] where a [`PatientId`] is expected.
//!
//! UUID-based identifiers are always valid by construction. [`Email`]
//! validates and normalizes at construction time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// A practice user (admin, dietitian, assistant, ...).
    UserId
);
uuid_id!(
    /// A patient record.
    PatientId
);
uuid_id!(
    /// A consultation or appointment.
    VisitId
);
uuid_id!(
    /// An invoice.
    InvoiceId
);
uuid_id!(
    /// Metadata for a stored patient document.
    DocumentId
);
uuid_id!(
    /// A recipe.
    RecipeId
);
uuid_id!(
    /// An ingredient with nutrition values.
    IngredientId
);
uuid_id!(
    /// A measure definition or a recorded measure value.
    MeasureId
);
uuid_id!(
    /// A custom field definition.
    CustomFieldId
);
uuid_id!(
    /// An API key issued to a user.
    ApiKeyId
);
uuid_id!(
    /// An entry in the outgoing email log.
    EmailLogId
);

/// Maximum length of an email address (RFC 5321 path limit).
const MAX_EMAIL_LEN: usize = 254;

/// A normalized email address.
///
/// Stored trimmed and lower-cased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    /// Validate and normalize an email address.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = raw.as_ref().trim().to_lowercase();
        if value.is_empty() || value.len() > MAX_EMAIL_LEN {
            return Err(ValidationError::InvalidEmail(value));
        }
        let mut parts = value.split('@');
        let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
            (Some(l), Some(d), None) => (l, d),
            _ => return Err(ValidationError::InvalidEmail(value)),
        };
        let domain_ok = domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !domain.contains("..");
        if local.is_empty() || !domain_ok || value.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidEmail(value));
        }
        Ok(Self(value))
    }

    /// The normalized address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Email {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Email {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Email> for String {
    fn from(email: Email) -> Self {
        email.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_stable_display() {
        let raw = Uuid::new_v4();
        let patient = PatientId::from_uuid(raw);
        assert_eq!(patient.to_string(), raw.to_string());
        assert_eq!(*patient.as_uuid(), raw);
    }

    #[test]
    fn id_serializes_as_plain_uuid() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn email_is_normalized() {
        let email = Email::new("  Jane.Doe@Example.COM ").unwrap();
        assert_eq!(email.as_str(), "jane.doe@example.com");
    }

    #[test]
    fn email_rejects_malformed() {
        for bad in ["", "plain", "a@b", "@example.com", "a@@example.com", "a@.com", "a b@x.io", "a@x..io"] {
            assert!(Email::new(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn email_deserialization_validates() {
        let ok: Result<Email, _> = serde_json::from_str("\"Bob@Clinic.org\"");
        assert_eq!(ok.unwrap().as_str(), "bob@clinic.org");
        let bad: Result<Email, _> = serde_json::from_str("\"not-an-email\"");
        assert!(bad.is_err());
    }
}
