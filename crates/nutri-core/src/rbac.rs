//! # Role-Based Access Control
//!
//! Roles map to sets of permission codes. A [`Principal`] is the resolved
//! view of an authenticated user: who they are, which role they hold and
//! the permissions that role grants at request time.
//!
//! ## Rules
//!
//! - `ADMIN` bypasses every permission and every resource scope.
//! - Everybody else needs the permission code named by the operation.
//! - Patient-scoped reads need either `patients.read_all` or a link between
//!   the principal and the patient (the patient's care team).
//!
//! ## Configuration
//!
//! The default table can be replaced by YAML:
//!
//! ```yaml
//! roles:
//!   DIETITIAN: [patients.read, patients.write, visits.read]
//!   RECEPTION: [patients.read_all, visits.read]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::identity::UserId;

// ── Permission ──────────────────────────────────────────────────────────────

/// A permission code from the fixed catalogue.
///
/// Serialized as the dotted `resource.action` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    /// List and view users.
    UsersRead,
    /// Create, update, deactivate and unlock users.
    UsersManage,
    /// List roles and the permission catalogue.
    RolesRead,
    /// Change role permission sets.
    RolesManage,
    /// Read patients the caller is linked to.
    PatientsRead,
    /// Read every patient regardless of care-team links.
    PatientsReadAll,
    /// Create and update patients, manage care-team links.
    PatientsWrite,
    /// Soft-delete patients.
    PatientsDelete,
    /// Read visits.
    VisitsRead,
    /// Create and update visits.
    VisitsWrite,
    /// Delete visits.
    VisitsDelete,
    /// Read recorded measures and definitions.
    MeasuresRead,
    /// Record measure values.
    MeasuresWrite,
    /// Manage measure definitions.
    MeasuresManage,
    /// Read invoices.
    BillingRead,
    /// Create, send, pay and cancel invoices.
    BillingWrite,
    /// Read document metadata.
    DocumentsRead,
    /// Register and delete documents.
    DocumentsWrite,
    /// Read recipes and ingredients.
    RecipesRead,
    /// Create and update recipes and ingredients.
    RecipesWrite,
    /// Read custom field definitions.
    CustomFieldsRead,
    /// Manage custom field definitions.
    CustomFieldsManage,
    /// Generate AI follow-up drafts.
    FollowupsGenerate,
    /// Send emails to patients.
    EmailsSend,
    /// Read the email log.
    EmailsRead,
    /// Enable, disable and trigger scheduled jobs.
    SchedulerManage,
    /// Issue and revoke API keys.
    ApiKeysManage,
    /// Read the audit log.
    AuditRead,
}

impl Permission {
    /// Every permission in the catalogue, in declaration order.
    pub const ALL: [Permission; 28] = [
        Self::UsersRead,
        Self::UsersManage,
        Self::RolesRead,
        Self::RolesManage,
        Self::PatientsRead,
        Self::PatientsReadAll,
        Self::PatientsWrite,
        Self::PatientsDelete,
        Self::VisitsRead,
        Self::VisitsWrite,
        Self::VisitsDelete,
        Self::MeasuresRead,
        Self::MeasuresWrite,
        Self::MeasuresManage,
        Self::BillingRead,
        Self::BillingWrite,
        Self::DocumentsRead,
        Self::DocumentsWrite,
        Self::RecipesRead,
        Self::RecipesWrite,
        Self::CustomFieldsRead,
        Self::CustomFieldsManage,
        Self::FollowupsGenerate,
        Self::EmailsSend,
        Self::EmailsRead,
        Self::SchedulerManage,
        Self::ApiKeysManage,
        Self::AuditRead,
    ];

    /// The dotted permission code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UsersRead => "users.read",
            Self::UsersManage => "users.manage",
            Self::RolesRead => "roles.read",
            Self::RolesManage => "roles.manage",
            Self::PatientsRead => "patients.read",
            Self::PatientsReadAll => "patients.read_all",
            Self::PatientsWrite => "patients.write",
            Self::PatientsDelete => "patients.delete",
            Self::VisitsRead => "visits.read",
            Self::VisitsWrite => "visits.write",
            Self::VisitsDelete => "visits.delete",
            Self::MeasuresRead => "measures.read",
            Self::MeasuresWrite => "measures.write",
            Self::MeasuresManage => "measures.manage",
            Self::BillingRead => "billing.read",
            Self::BillingWrite => "billing.write",
            Self::DocumentsRead => "documents.read",
            Self::DocumentsWrite => "documents.write",
            Self::RecipesRead => "recipes.read",
            Self::RecipesWrite => "recipes.write",
            Self::CustomFieldsRead => "custom_fields.read",
            Self::CustomFieldsManage => "custom_fields.manage",
            Self::FollowupsGenerate => "followups.generate",
            Self::EmailsSend => "emails.send",
            Self::EmailsRead => "emails.read",
            Self::SchedulerManage => "scheduler.manage",
            Self::ApiKeysManage => "api_keys.manage",
            Self::AuditRead => "audit.read",
        }
    }

    /// Look up a permission by its dotted code.
    pub fn from_code(code: &str) -> Result<Self, ValidationError> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.code() == code.trim())
            .ok_or_else(|| ValidationError::UnknownPermission(code.to_string()))
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl TryFrom<String> for Permission {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_code(&value)
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.code().to_string()
    }
}

/// An ordered set of permissions.
pub type PermissionSet = BTreeSet<Permission>;

// ── Role names ──────────────────────────────────────────────────────────────

/// A validated role name (`[A-Z_]{2,32}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    /// Name of the built-in administrator role.
    pub const ADMIN: &'static str = "ADMIN";
    /// Name of the built-in dietitian role.
    pub const DIETITIAN: &'static str = "DIETITIAN";
    /// Name of the built-in assistant role.
    pub const ASSISTANT: &'static str = "ASSISTANT";
    /// Name of the built-in read-only role.
    pub const VIEWER: &'static str = "VIEWER";

    /// Validate a role name. Input is upper-cased first.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = raw.as_ref().trim().to_uppercase();
        let len_ok = (2..=32).contains(&value.len());
        if !len_ok || !value.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            return Err(ValidationError::InvalidRoleName(raw.as_ref().to_string()));
        }
        Ok(Self(value))
    }

    /// The administrator role.
    pub fn admin() -> Self {
        Self(Self::ADMIN.to_string())
    }

    /// Whether this is the administrator role.
    pub fn is_admin(&self) -> bool {
        self.0 == Self::ADMIN
    }

    /// The role name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoleName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoleName> for String {
    fn from(r: RoleName) -> Self {
        r.0
    }
}

// ── Role table ──────────────────────────────────────────────────────────────

/// Errors loading or editing a [`RoleTable`].
#[derive(Error, Debug)]
pub enum RoleTableError {
    /// YAML could not be parsed.
    #[error("invalid role table YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A role name or permission code was invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The administrator role is implicit and cannot be edited.
    #[error("the ADMIN role is built in and cannot be redefined")]
    AdminImmutable,

    /// The role does not exist.
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

#[derive(Deserialize)]
struct RoleTableFile {
    roles: BTreeMap<String, Vec<String>>,
}

/// Mapping from role name to granted permissions.
///
/// `ADMIN` is always present and always resolves to the full catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    roles: BTreeMap<RoleName, PermissionSet>,
}

impl RoleTable {
    /// The default table shipped with the application.
    pub fn builtin() -> Self {
        use Permission::*;

        let dietitian: PermissionSet = [
            PatientsRead,
            PatientsWrite,
            VisitsRead,
            VisitsWrite,
            VisitsDelete,
            MeasuresRead,
            MeasuresWrite,
            BillingRead,
            BillingWrite,
            DocumentsRead,
            DocumentsWrite,
            RecipesRead,
            RecipesWrite,
            CustomFieldsRead,
            FollowupsGenerate,
            EmailsSend,
            EmailsRead,
        ]
        .into_iter()
        .collect();

        let assistant: PermissionSet = [
            PatientsRead,
            PatientsReadAll,
            PatientsWrite,
            VisitsRead,
            VisitsWrite,
            BillingRead,
            BillingWrite,
            DocumentsRead,
            RecipesRead,
            CustomFieldsRead,
            EmailsRead,
        ]
        .into_iter()
        .collect();

        let viewer: PermissionSet = [PatientsRead, VisitsRead, MeasuresRead, RecipesRead]
            .into_iter()
            .collect();

        let mut roles = BTreeMap::new();
        roles.insert(RoleName::admin(), Permission::ALL.into_iter().collect());
        roles.insert(RoleName(RoleName::DIETITIAN.into()), dietitian);
        roles.insert(RoleName(RoleName::ASSISTANT.into()), assistant);
        roles.insert(RoleName(RoleName::VIEWER.into()), viewer);
        Self { roles }
    }

    /// Parse a table from YAML. `ADMIN` must not appear; it is added implicitly.
    pub fn from_yaml(yaml: &str) -> Result<Self, RoleTableError> {
        let file: RoleTableFile = serde_yaml::from_str(yaml)?;
        let mut roles = BTreeMap::new();
        roles.insert(RoleName::admin(), Permission::ALL.into_iter().collect());
        for (name, codes) in file.roles {
            let name = RoleName::new(&name)?;
            if name.is_admin() {
                return Err(RoleTableError::AdminImmutable);
            }
            let perms = codes
                .iter()
                .map(|c| Permission::from_code(c))
                .collect::<Result<PermissionSet, _>>()?;
            roles.insert(name, perms);
        }
        Ok(Self { roles })
    }

    /// Permissions granted to `role`, or `None` if the role is unknown.
    pub fn permissions(&self, role: &RoleName) -> Option<&PermissionSet> {
        self.roles.get(role)
    }

    /// Whether `role` exists in the table.
    pub fn contains(&self, role: &RoleName) -> bool {
        self.roles.contains_key(role)
    }

    /// Iterate roles in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&RoleName, &PermissionSet)> {
        self.roles.iter()
    }

    /// Create or replace a role's permission set.
    pub fn set_role(
        &mut self,
        role: RoleName,
        permissions: PermissionSet,
    ) -> Result<(), RoleTableError> {
        if role.is_admin() {
            return Err(RoleTableError::AdminImmutable);
        }
        self.roles.insert(role, permissions);
        Ok(())
    }

    /// Resolve a principal for `user_id` holding `role`.
    pub fn principal(&self, user_id: UserId, role: &RoleName) -> Result<Principal, RoleTableError> {
        let permissions = self
            .permissions(role)
            .cloned()
            .ok_or_else(|| RoleTableError::UnknownRole(role.to_string()))?;
        Ok(Principal {
            user_id,
            role: role.clone(),
            permissions,
        })
    }
}

impl Default for RoleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ── Principal ───────────────────────────────────────────────────────────────

/// A permission check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("permission '{permission}' required, role '{role}' does not grant it")]
pub struct AccessDenied {
    /// The permission that was missing.
    pub permission: Permission,
    /// The caller's role.
    pub role: RoleName,
}

/// The resolved identity of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// The caller's user id.
    pub user_id: UserId,
    /// The caller's role.
    pub role: RoleName,
    /// Permissions granted by the role when the request was authenticated.
    pub permissions: PermissionSet,
}

impl Principal {
    /// Whether the caller holds the administrator role.
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    /// Whether the caller holds `permission`. Administrators hold everything.
    pub fn has(&self, permission: Permission) -> bool {
        self.is_admin() || self.permissions.contains(&permission)
    }

    /// Require `permission`.
    pub fn authorize(&self, permission: Permission) -> Result<(), AccessDenied> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(AccessDenied {
                permission,
                role: self.role.clone(),
            })
        }
    }

    /// Whether the caller may see a patient whose care team is `care_team`.
    ///
    /// Administrators and holders of `patients.read_all` see every patient;
    /// everybody else only sees patients they are linked to.
    pub fn can_access_patient(&self, care_team: &[UserId]) -> bool {
        self.has(Permission::PatientsReadAll) || care_team.contains(&self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: &str) -> Principal {
        RoleTable::builtin()
            .principal(UserId::new(), &RoleName::new(role).unwrap())
            .unwrap()
    }

    #[test]
    fn every_code_round_trips() {
        for p in Permission::ALL {
            assert_eq!(Permission::from_code(p.code()).unwrap(), p);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(matches!(
            Permission::from_code("patients.explode"),
            Err(ValidationError::UnknownPermission(_))
        ));
    }

    #[test]
    fn role_name_normalizes_and_validates() {
        assert_eq!(RoleName::new("dietitian").unwrap().as_str(), "DIETITIAN");
        assert!(RoleName::new("A").is_err());
        assert!(RoleName::new("ROLE-1").is_err());
        assert!(RoleName::new("X".repeat(33)).is_err());
    }

    #[test]
    fn admin_bypasses_everything() {
        let admin = principal("ADMIN");
        for p in Permission::ALL {
            assert!(admin.authorize(p).is_ok());
        }
        assert!(admin.can_access_patient(&[]));
    }

    #[test]
    fn viewer_cannot_write() {
        let viewer = principal("VIEWER");
        let err = viewer.authorize(Permission::PatientsWrite).unwrap_err();
        assert_eq!(err.permission, Permission::PatientsWrite);
        assert!(err.to_string().contains("patients.write"));
    }

    #[test]
    fn dietitian_sees_only_linked_patients() {
        let d = principal("DIETITIAN");
        assert!(!d.can_access_patient(&[UserId::new()]));
        assert!(d.can_access_patient(&[UserId::new(), d.user_id]));
    }

    #[test]
    fn assistant_reads_all_patients() {
        let a = principal("ASSISTANT");
        assert!(a.can_access_patient(&[]));
    }

    #[test]
    fn yaml_table_adds_admin_implicitly() {
        let table = RoleTable::from_yaml(
            "roles:\n  reception: [patients.read_all, visits.read]\n",
        )
        .unwrap();
        let reception = RoleName::new("RECEPTION").unwrap();
        let perms = table.permissions(&reception).unwrap();
        assert!(perms.contains(&Permission::VisitsRead));
        assert_eq!(
            table.permissions(&RoleName::admin()).unwrap().len(),
            Permission::ALL.len()
        );
        assert!(!table.contains(&RoleName::new("DIETITIAN").unwrap()));
    }

    #[test]
    fn yaml_rejects_admin_and_unknown_codes() {
        assert!(matches!(
            RoleTable::from_yaml("roles:\n  ADMIN: [users.read]\n"),
            Err(RoleTableError::AdminImmutable)
        ));
        assert!(matches!(
            RoleTable::from_yaml("roles:\n  CLERK: [nope.nope]\n"),
            Err(RoleTableError::Validation(_))
        ));
    }

    #[test]
    fn set_role_refuses_admin() {
        let mut table = RoleTable::builtin();
        assert!(table
            .set_role(RoleName::admin(), PermissionSet::new())
            .is_err());
    }

    #[test]
    fn unknown_role_has_no_principal() {
        let table = RoleTable::builtin();
        let ghost = RoleName::new("GHOST").unwrap();
        assert!(matches!(
            table.principal(UserId::new(), &ghost),
            Err(RoleTableError::UnknownRole(_))
        ));
    }

    #[test]
    fn permission_serializes_as_code() {
        let json = serde_json::to_string(&Permission::ApiKeysManage).unwrap();
        assert_eq!(json, "\"api_keys.manage\"");
    }
}
