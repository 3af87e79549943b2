//! # Application State
//!
//! Shared state for the Axum application, passed to all route handlers
//! via the `State` extractor.
//!
//! ## Architecture
//!
//! Records live in in-memory [`Store`]s. When a database pool is connected,
//! users, patients, visits, invoices and audit entries are written through
//! to Postgres and reloaded by [`AppState::hydrate_from_db`] on start-up.
//! The remaining stores (measures, documents, recipes, custom fields, API
//! keys, email log) are process-local.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use nutri_core::{
    ApiKeyId, CustomFieldDefinition, DocumentId, Email, EmailLogId, Ingredient,
    Invoice, InvoiceId, JobTable, LoginAttempts, MeasureCatalog, PatientId, Principal, Recipe,
    RoleName, RoleTable, Schedule, UserId, VisitId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::ai::AiClient;
use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::mail::Mailer;

// -- Generic In-Memory Store --------------------------------------------------

/// Thread-safe, cloneable in-memory key-value store.
///
/// The lock is `parking_lot` and is never held across `.await` points.
#[derive(Debug)]
pub struct Store<T: Clone + Send + Sync> {
    data: Arc<RwLock<HashMap<Uuid, T>>>,
}

impl<T: Clone + Send + Sync> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Clone + Send + Sync> Store<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a record, returning the previous value if the key existed.
    pub fn insert(&self, id: Uuid, value: T) -> Option<T> {
        self.data.write().insert(id, value)
    }

    /// Retrieve a record by ID.
    pub fn get(&self, id: &Uuid) -> Option<T> {
        self.data.read().get(id).cloned()
    }

    /// List all records.
    pub fn list(&self) -> Vec<T> {
        self.data.read().values().cloned().collect()
    }

    /// Records matching a predicate.
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.data.read().values().filter(|v| pred(v)).cloned().collect()
    }

    /// First record matching a predicate.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.data.read().values().find(|v| pred(v)).cloned()
    }

    /// Update a record in place. Returns the updated record, or `None` if not found.
    pub fn update(&self, id: &Uuid, f: impl FnOnce(&mut T)) -> Option<T> {
        let mut guard = self.data.write();
        if let Some(entry) = guard.get_mut(id) {
            f(entry);
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Atomically read-validate-update a record.
    ///
    /// The closure runs under a single write lock, so checks and mutation
    /// cannot interleave with another writer. Returns `None` if the record
    /// doesn't exist.
    pub fn try_update<R, E>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Option<Result<R, E>> {
        self.data.write().get_mut(id).map(f)
    }

    /// Like [`Store::try_update`], but also returns the record as it was
    /// before `f` ran. A failing `f` leaves the record unchanged.
    pub fn modify<R, E>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Option<Result<(T, T, R), E>> {
        let mut guard = self.data.write();
        let entry = guard.get_mut(id)?;
        let before = entry.clone();
        Some(match f(entry) {
            Ok(out) => Ok((before, entry.clone(), out)),
            Err(e) => {
                *entry = before;
                Err(e)
            }
        })
    }

    /// Put `previous` back, unless the record changed since `written` was
    /// stored. Returns whether the record was restored.
    pub fn revert(&self, id: &Uuid, written: &T, previous: T) -> bool
    where
        T: PartialEq,
    {
        let mut guard = self.data.write();
        match guard.get_mut(id) {
            Some(entry) if *entry == *written => {
                *entry = previous;
                true
            }
            _ => false,
        }
    }

    /// Remove a record by ID.
    pub fn remove(&self, id: &Uuid) -> Option<T> {
        self.data.write().remove(id)
    }

    /// Check if a record exists.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.data.read().contains_key(id)
    }

    /// Return the number of records.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

// -- Records ------------------------------------------------------------------

/// A staff account.
///
/// `Debug` omits the password hash.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: Email,
    pub display_name: String,
    pub role: RoleName,
    pub password_hash: String,
    pub active: bool,
    pub attempts: LoginAttempts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("role", &self.role)
            .field("active", &self.active)
            .field("password_hash", &"[REDACTED]")
            .finish()
    }
}

/// Public view of a user.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserView {
    #[schema(value_type = String)]
    pub id: UserId,
    #[schema(value_type = String)]
    pub email: Email,
    pub display_name: String,
    #[schema(value_type = String)]
    pub role: RoleName,
    pub active: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UserRecord> for UserView {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            display_name: u.display_name.clone(),
            role: u.role.clone(),
            active: u.active,
            failed_attempts: u.attempts.failed_attempts,
            locked_until: u.attempts.locked_until,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// A patient file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PatientRecord {
    #[schema(value_type = String)]
    pub id: PatientId,
    pub first_name: String,
    pub last_name: String,
    #[schema(value_type = Option<String>)]
    pub email: Option<Email>,
    pub phone: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub notes: Option<String>,
    /// Users linked to this patient; non-privileged callers only see patients
    /// they are linked to.
    #[schema(value_type = Vec<String>)]
    pub dietitian_ids: Vec<UserId>,
    #[schema(value_type = Object)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub active: bool,
    #[schema(value_type = String)]
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PatientRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Visit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

/// A consultation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VisitRecord {
    #[schema(value_type = String)]
    pub id: VisitId,
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    #[schema(value_type = String)]
    pub dietitian_id: UserId,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: VisitStatus,
    pub notes: Option<String>,
    pub next_visit_date: Option<NaiveDate>,
    #[schema(value_type = Object)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded measure value for a patient.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MeasurementRecord {
    pub id: Uuid,
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    #[schema(value_type = Option<String>)]
    pub visit_id: Option<VisitId>,
    pub code: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
    /// True for values computed from calculated measures.
    pub derived: bool,
    pub measured_at: DateTime<Utc>,
    #[schema(value_type = String)]
    pub recorded_by: UserId,
}

/// Document metadata. File bytes are held by external storage.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentRecord {
    #[schema(value_type = String)]
    pub id: DocumentId,
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    pub title: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file content, if supplied by the uploader.
    pub sha256: Option<String>,
    #[schema(value_type = String)]
    pub uploaded_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// An API key. Only the SHA-256 of the key is stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiKeyRecord {
    #[schema(value_type = String)]
    pub id: ApiKeyId,
    #[schema(value_type = String)]
    pub user_id: UserId,
    pub name: String,
    /// First characters of the key, for display.
    pub prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Outbox status of an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Queued,
    /// Claimed by a sender; the relay call is in flight.
    Sending,
    Sent,
    Failed,
}

/// Attempts after which a failed email is no longer retried.
pub const MAX_EMAIL_ATTEMPTS: u32 = 5;

/// An email log entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmailLogRecord {
    #[schema(value_type = String)]
    pub id: EmailLogId,
    #[schema(value_type = String)]
    pub patient_id: PatientId,
    #[schema(value_type = Option<String>)]
    pub visit_id: Option<VisitId>,
    #[schema(value_type = String)]
    pub to: Email,
    pub subject: String,
    pub body: String,
    pub status: EmailStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[schema(value_type = String)]
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl EmailLogRecord {
    /// Queued, or failed with attempts left.
    pub fn is_pending(&self) -> bool {
        match self.status {
            EmailStatus::Queued => true,
            EmailStatus::Failed => self.attempts < MAX_EMAIL_ATTEMPTS,
            EmailStatus::Sending | EmailStatus::Sent => false,
        }
    }
}

// -- Application State ---------------------------------------------------------

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub users: Store<UserRecord>,
    pub patients: Store<PatientRecord>,
    pub visits: Store<VisitRecord>,
    pub measurements: Store<MeasurementRecord>,
    pub documents: Store<DocumentRecord>,
    pub invoices: Store<Invoice>,
    pub ingredients: Store<Ingredient>,
    pub recipes: Store<Recipe>,
    pub custom_fields: Store<CustomFieldDefinition>,
    pub api_keys: Store<ApiKeyRecord>,
    pub emails: Store<EmailLogRecord>,

    /// Role → permission table. Replaced wholesale on role edits.
    pub roles: Arc<RwLock<RoleTable>>,
    /// Measure definitions, including calculated ones.
    pub measures: Arc<RwLock<MeasureCatalog>>,
    /// Background job table.
    pub jobs: Arc<Mutex<JobTable>>,
    /// Last invoice sequence number per year.
    pub invoice_seq: Arc<Mutex<BTreeMap<i32, u32>>>,

    pub audit: AuditLog,

    /// PostgreSQL pool. `None` means in-memory only.
    pub db_pool: Option<PgPool>,
    /// AI provider client. `None` makes follow-up drafting return 503.
    pub ai: Option<AiClient>,
    pub mailer: Mailer,

    pub config: AppConfig,
}

impl AppState {
    /// State with default configuration, built-in roles and no external services.
    pub fn new() -> Self {
        Self::with_config(AppConfig::default(), RoleTable::builtin(), None)
    }

    /// State with the given configuration, role table and optional database pool.
    pub fn with_config(config: AppConfig, roles: RoleTable, db_pool: Option<PgPool>) -> Self {
        let state = Self {
            users: Store::new(),
            patients: Store::new(),
            visits: Store::new(),
            measurements: Store::new(),
            documents: Store::new(),
            invoices: Store::new(),
            ingredients: Store::new(),
            recipes: Store::new(),
            custom_fields: Store::new(),
            api_keys: Store::new(),
            emails: Store::new(),
            roles: Arc::new(RwLock::new(roles)),
            measures: Arc::new(RwLock::new(MeasureCatalog::builtin())),
            jobs: Arc::new(Mutex::new(JobTable::default())),
            invoice_seq: Arc::new(Mutex::new(BTreeMap::new())),
            audit: AuditLog::new(),
            db_pool,
            ai: None,
            mailer: Mailer::log_only(),
            config,
        };
        state.register_default_jobs();
        state
    }

    /// Attach an AI provider client.
    pub fn with_ai(mut self, client: Option<AiClient>) -> Self {
        self.ai = client;
        self
    }

    /// Replace the mailer.
    pub fn with_mailer(mut self, mailer: Mailer) -> Self {
        self.mailer = mailer;
        self
    }

    fn register_default_jobs(&self) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        for (name, schedule) in crate::scheduler::DEFAULT_JOBS {
            match Schedule::parse(schedule) {
                Ok(schedule) => {
                    if let Err(e) = jobs.register(name, schedule, now) {
                        tracing::warn!(job = name, error = %e, "job registration skipped");
                    }
                }
                Err(e) => tracing::error!(job = name, error = %e, "invalid built-in schedule"),
            }
        }
    }

    // -- Lookups ------------------------------------------------------------

    /// Find a user by (normalized) email.
    pub fn find_user_by_email(&self, email: &Email) -> Option<UserRecord> {
        self.users.find(|u| &u.email == email)
    }

    /// Resolve a user's current principal from the role table.
    pub fn principal_for(&self, user: &UserRecord) -> Result<Principal, AppError> {
        self.roles
            .read()
            .principal(user.id, &user.role)
            .map_err(|e| AppError::Forbidden(e.to_string()))
    }

    /// Next invoice sequence number for `year`, starting at 1.
    pub fn next_invoice_seq(&self, year: i32) -> u32 {
        let mut seqs = self.invoice_seq.lock();
        let seq = seqs.entry(year).or_insert(0);
        *seq += 1;
        *seq
    }

    // -- Audit ----------------------------------------------------------------

    /// Append an audit entry and write it through when a database is connected.
    ///
    /// A failed database write is logged, not returned: the mutation it
    /// describes has already been applied.
    pub async fn record_audit(
        &self,
        actor: Option<UserId>,
        action: &str,
        resource_type: &str,
        resource_id: impl ToString,
        metadata: serde_json::Value,
    ) {
        let entry = self
            .audit
            .append(actor, action, resource_type, resource_id, metadata);
        tracing::info!(
            action = %entry.action,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            actor = ?entry.actor,
            "audit"
        );
        if let Some(pool) = &self.db_pool {
            if let Err(e) = crate::db::audit::insert(pool, &entry).await {
                tracing::error!(error = %e, entry_id = %entry.id, "failed to persist audit entry");
            }
        }
    }

    // -- Write-through persistence ----------------------------------------------

    /// Apply `f` to a user and write the result through.
    pub async fn commit_user<R>(
        &self,
        id: UserId,
        f: impl FnOnce(&mut UserRecord) -> Result<R, AppError> + Send,
    ) -> Result<(UserRecord, R), AppError> {
        commit(&self.users, id.as_uuid(), "user", f, |u| async move {
            self.persist_user(&u).await
        })
        .await
    }

    /// Apply `f` to a patient and write the result through.
    pub async fn commit_patient<R>(
        &self,
        id: PatientId,
        f: impl FnOnce(&mut PatientRecord) -> Result<R, AppError> + Send,
    ) -> Result<(PatientRecord, R), AppError> {
        commit(&self.patients, id.as_uuid(), "patient", f, |p| async move {
            self.persist_patient(&p).await
        })
        .await
    }

    /// Apply `f` to a visit and write the result through.
    pub async fn commit_visit<R>(
        &self,
        id: VisitId,
        f: impl FnOnce(&mut VisitRecord) -> Result<R, AppError> + Send,
    ) -> Result<(VisitRecord, R), AppError> {
        commit(&self.visits, id.as_uuid(), "visit", f, |v| async move {
            self.persist_visit(&v).await
        })
        .await
    }

    /// Apply `f` to an invoice and write the result through.
    pub async fn commit_invoice<R>(
        &self,
        id: InvoiceId,
        f: impl FnOnce(&mut Invoice) -> Result<R, AppError> + Send,
    ) -> Result<(Invoice, R), AppError> {
        commit(&self.invoices, id.as_uuid(), "invoice", f, |i| async move {
            self.persist_invoice(&i).await
        })
        .await
    }

    pub async fn persist_user(&self, user: &UserRecord) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            crate::db::users::upsert(pool, user).await?;
        }
        Ok(())
    }

    pub async fn persist_patient(&self, patient: &PatientRecord) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            crate::db::patients::upsert(pool, patient).await?;
        }
        Ok(())
    }

    pub async fn persist_visit(&self, visit: &VisitRecord) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            crate::db::visits::upsert(pool, visit).await?;
        }
        Ok(())
    }

    pub async fn delete_visit(&self, id: VisitId) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            crate::db::visits::delete(pool, id).await?;
        }
        Ok(())
    }

    pub async fn persist_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        if let Some(pool) = &self.db_pool {
            crate::db::invoices::upsert(pool, invoice).await?;
        }
        Ok(())
    }

    // -- Start-up -----------------------------------------------------------------

    /// Create the configured administrator when no users exist yet.
    pub async fn bootstrap_admin(&self) -> Result<Option<UserId>, AppError> {
        let Some(admin) = self.config.bootstrap_admin.clone() else {
            return Ok(None);
        };
        if !self.users.is_empty() {
            return Ok(None);
        }
        let email = Email::new(&admin.email)?;
        let now = Utc::now();
        let user = UserRecord {
            id: UserId::new(),
            email,
            display_name: "Administrator".to_string(),
            role: RoleName::admin(),
            password_hash: crate::auth::hash_password_blocking(
                admin.password.expose(),
                self.config.password_iterations,
            )
            .await?,
            active: true,
            attempts: LoginAttempts::default(),
            created_at: now,
            updated_at: now,
        };
        self.persist_user(&user).await?;
        self.users.insert(*user.id.as_uuid(), user.clone());
        self.record_audit(None, "user.bootstrap", "user", user.id, serde_json::json!({}))
            .await;
        tracing::info!(user_id = %user.id, email = %user.email, "bootstrap administrator created");
        Ok(Some(user.id))
    }

    /// Hydrate in-memory stores from the database.
    ///
    /// Called once on startup when a database pool is available.
    pub async fn hydrate_from_db(&self) -> Result<(), String> {
        let pool = match &self.db_pool {
            Some(pool) => pool,
            None => return Ok(()),
        };

        let users = crate::db::users::load_all(pool)
            .await
            .map_err(|e| format!("failed to load users: {e}"))?;
        let user_count = users.len();
        for record in users {
            self.users.insert(*record.id.as_uuid(), record);
        }

        let patients = crate::db::patients::load_all(pool)
            .await
            .map_err(|e| format!("failed to load patients: {e}"))?;
        let patient_count = patients.len();
        for record in patients {
            self.patients.insert(*record.id.as_uuid(), record);
        }

        let visits = crate::db::visits::load_all(pool)
            .await
            .map_err(|e| format!("failed to load visits: {e}"))?;
        let visit_count = visits.len();
        for record in visits {
            self.visits.insert(*record.id.as_uuid(), record);
        }

        let invoices = crate::db::invoices::load_all(pool)
            .await
            .map_err(|e| format!("failed to load invoices: {e}"))?;
        let invoice_count = invoices.len();
        {
            let mut seqs = self.invoice_seq.lock();
            for invoice in &invoices {
                if let Some((year, seq)) = parse_invoice_number(&invoice.number) {
                    let entry = seqs.entry(year).or_insert(0);
                    *entry = (*entry).max(seq);
                }
            }
        }
        for record in invoices {
            self.invoices.insert(*record.id.as_uuid(), record);
        }

        let entries = crate::db::audit::load_all(pool)
            .await
            .map_err(|e| format!("failed to load audit log: {e}"))?;
        let audit_count = entries.len();
        self.audit.restore(entries);

        tracing::info!(
            users = user_count,
            patients = patient_count,
            visits = visit_count,
            invoices = invoice_count,
            audit_entries = audit_count,
            "Hydrated in-memory stores from database"
        );

        Ok(())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `f` to the record `id` under the store lock, then `persist` the
/// result. If persisting fails the in-memory change is reverted, so memory
/// never holds a change the database refused.
pub(crate) async fn commit<T, R, Fut>(
    store: &Store<T>,
    id: &Uuid,
    kind: &str,
    f: impl FnOnce(&mut T) -> Result<R, AppError> + Send,
    persist: impl FnOnce(T) -> Fut + Send,
) -> Result<(T, R), AppError>
where
    T: Clone + Send + Sync + PartialEq,
    Fut: std::future::Future<Output = Result<(), AppError>>,
{
    let (before, after, out) = store
        .modify(id, f)
        .ok_or_else(|| AppError::not_found(kind, id))??;
    if let Err(e) = persist(after.clone()).await {
        if !store.revert(id, &after, before) {
            tracing::warn!(%id, kind, "record changed during a failed write; not reverted");
        }
        return Err(e);
    }
    Ok((after, out))
}

/// Parse `INV-YYYY-NNNNN` back into `(year, seq)`.
fn parse_invoice_number(number: &str) -> Option<(i32, u32)> {
    let mut parts = number.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("INV"), Some(year), Some(seq), None) => Some((year.parse().ok()?, seq.parse().ok()?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapAdmin, Secret};

    #[test]
    fn store_insert_get_update_remove() {
        let store: Store<String> = Store::new();
        let id = Uuid::new_v4();
        assert!(store.insert(id, "a".into()).is_none());
        assert_eq!(store.get(&id).as_deref(), Some("a"));
        assert_eq!(store.update(&id, |v| v.push('b')).as_deref(), Some("ab"));
        assert!(store.update(&Uuid::new_v4(), |_| {}).is_none());
        assert!(store.contains(&id));
        assert_eq!(store.remove(&id).as_deref(), Some("ab"));
        assert!(store.is_empty());
    }

    #[test]
    fn store_try_update_propagates_closure_result() {
        let store: Store<u32> = Store::new();
        let id = Uuid::new_v4();
        store.insert(id, 1);
        let r: Option<Result<u32, &str>> = store.try_update(&id, |v| {
            *v += 1;
            Ok(*v)
        });
        assert_eq!(r, Some(Ok(2)));
        let r: Option<Result<(), &str>> = store.try_update(&id, |_| Err("nope"));
        assert_eq!(r, Some(Err("nope")));
        assert_eq!(store.get(&id), Some(2));
    }

    #[test]
    fn store_modify_returns_before_and_after() {
        let store: Store<u32> = Store::new();
        let id = Uuid::new_v4();
        store.insert(id, 1);
        let r: Option<Result<(u32, u32, ()), &str>> = store.modify(&id, |v| {
            *v = 5;
            Ok(())
        });
        assert_eq!(r, Some(Ok((1, 5, ()))));

        // A failing closure leaves no partial change behind.
        let r: Option<Result<(u32, u32, ()), &str>> = store.modify(&id, |v| {
            *v = 9;
            Err("rejected")
        });
        assert_eq!(r, Some(Err("rejected")));
        assert_eq!(store.get(&id), Some(5));
    }

    #[test]
    fn store_revert_only_undoes_its_own_write() {
        let store: Store<u32> = Store::new();
        let id = Uuid::new_v4();
        store.insert(id, 2);
        assert!(store.revert(&id, &2, 1));
        assert_eq!(store.get(&id), Some(1));
        // Someone else wrote 3 after our 2: keep theirs.
        store.insert(id, 3);
        assert!(!store.revert(&id, &2, 1));
        assert_eq!(store.get(&id), Some(3));
    }

    #[tokio::test]
    async fn commit_rolls_back_when_persisting_fails() {
        let store: Store<u32> = Store::new();
        let id = Uuid::new_v4();
        store.insert(id, 10);

        let err = commit(
            &store,
            &id,
            "counter",
            |v| {
                *v += 1;
                Ok(())
            },
            |_| async { Err(AppError::Internal("database unavailable".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(store.get(&id), Some(10));

        let (after, ()) = commit(
            &store,
            &id,
            "counter",
            |v| {
                *v += 1;
                Ok(())
            },
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(after, 11);
        assert_eq!(store.get(&id), Some(11));

        let missing = commit(&store, &Uuid::new_v4(), "counter", |_| Ok(()), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[test]
    fn store_clone_shares_underlying_data() {
        let a: Store<u8> = Store::new();
        let b = a.clone();
        a.insert(Uuid::new_v4(), 7);
        assert_eq!(b.len(), 1);
        assert_eq!(b.filter(|v| *v == 7).len(), 1);
        assert!(b.find(|v| *v == 8).is_none());
    }

    #[test]
    fn new_state_registers_default_jobs() {
        let state = AppState::new();
        let jobs = state.jobs.lock();
        for (name, _) in crate::scheduler::DEFAULT_JOBS {
            assert!(jobs.get(name).is_some(), "{name}");
        }
    }

    #[test]
    fn invoice_sequence_is_per_year() {
        let state = AppState::new();
        assert_eq!(state.next_invoice_seq(2025), 1);
        assert_eq!(state.next_invoice_seq(2025), 2);
        assert_eq!(state.next_invoice_seq(2026), 1);
    }

    #[test]
    fn invoice_numbers_parse() {
        assert_eq!(parse_invoice_number("INV-2025-00042"), Some((2025, 42)));
        assert_eq!(parse_invoice_number("INV-2025"), None);
        assert_eq!(parse_invoice_number("X-2025-1"), None);
    }

    #[test]
    fn user_debug_redacts_hash() {
        let now = Utc::now();
        let user = UserRecord {
            id: UserId::new(),
            email: Email::new("a@example.org").unwrap(),
            display_name: "A".into(),
            role: RoleName::admin(),
            password_hash: "pbkdf2-sha256$1$c2FsdA$aGFzaA".into(),
            active: true,
            attempts: LoginAttempts::default(),
            created_at: now,
            updated_at: now,
        };
        let debug = format!("{user:?}");
        assert!(!debug.contains("pbkdf2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn bootstrap_admin_only_when_empty() {
        let config = AppConfig {
            password_iterations: 1_000,
            bootstrap_admin: Some(BootstrapAdmin {
                email: "Admin@Example.org".into(),
                password: Secret::new("Adm1nPassw0rd"),
            }),
            ..AppConfig::default()
        };
        let state = AppState::with_config(config, RoleTable::builtin(), None);
        let id = state.bootstrap_admin().await.unwrap();
        assert!(id.is_some());
        assert_eq!(state.users.len(), 1);
        let admin = state
            .find_user_by_email(&Email::new("admin@example.org").unwrap())
            .unwrap();
        assert!(admin.role.is_admin());
        assert!(state.principal_for(&admin).unwrap().is_admin());
        assert_eq!(state.bootstrap_admin().await.unwrap(), None);
        assert_eq!(state.audit.len(), 1);
    }
}
