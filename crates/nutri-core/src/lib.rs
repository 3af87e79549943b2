#![deny(missing_docs)]

//! # nutri-core — Domain Core for the Nutri Practice Backend
//!
//! Pure domain logic shared by the API service and the operator CLI. The
//! crate performs no I/O: every function takes its inputs (including the
//! current time) explicitly so that behavior is deterministic under test.
//!
//! ## Design Principles
//!
//! 1. **Newtype identifiers.** A [`PatientId`] cannot be passed where a
//!    [`UserId`] is expected.
//!
//! 2. **Permissions are data.** Roles map to sets of [`Permission`] codes via
//!    a [`RoleTable`]; the only hard-coded rule is that `ADMIN` bypasses
//!    every check.
//!
//! 3. **Money is integral.** Invoice amounts are minor units (`i64` cents).
//!
//! 4. **Structured errors.** Each subsystem owns a `thiserror` enum; no
//!    `Box<dyn Error>`, no `.unwrap()` outside tests.

pub mod billing;
pub mod custom_field;
pub mod error;
pub mod formula;
pub mod identity;
pub mod lockout;
pub mod measure;
pub mod password;
pub mod rbac;
pub mod recipe;
pub mod schedule;
pub mod template;

pub use billing::{Invoice, InvoiceError, InvoiceStatus, LineItem, Payment};
pub use custom_field::{CustomFieldDefinition, CustomFieldTarget, CustomFieldType};
pub use error::{CoreError, ValidationError};
pub use formula::{Formula, FormulaError};
pub use identity::{
    ApiKeyId, CustomFieldId, DocumentId, Email, EmailLogId, IngredientId, InvoiceId, MeasureId,
    PatientId, RecipeId, UserId, VisitId,
};
pub use lockout::{LockoutPolicy, LoginAttempts, LoginLocked};
pub use measure::{MeasureCatalog, MeasureDefinition, MeasureKind};
pub use password::{hash_password, verify_password, PasswordError, PasswordPolicy};
pub use rbac::{AccessDenied, Permission, PermissionSet, Principal, RoleName, RoleTable};
pub use recipe::{Ingredient, Nutrition, Recipe, RecipeItem};
pub use schedule::{JobTable, Schedule, ScheduleError};
pub use template::{FollowUpContext, PlaceholderValues};
