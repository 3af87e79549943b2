//! # Background Jobs
//!
//! A single tokio task polls the [`JobTable`](nutri_core::JobTable) every
//! `SCHEDULER_TICK_SECS` and runs the jobs that are due. Jobs can be
//! enabled, disabled and triggered through `/v1/scheduler/jobs`.
//!
//! The job table lock is never held while a job runs.

use chrono::{DateTime, Utc};
use nutri_core::billing::InvoiceStatus;
use nutri_core::schedule::JobOutcome;
use nutri_core::UserId;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::state::{AppState, EmailStatus};

/// Built-in jobs and their schedules.
pub const DEFAULT_JOBS: [(&str, &str); 3] = [
    ("invoice_overdue_scan", "daily 06:00"),
    ("email_outbox", "every 5m"),
    ("lockout_sweep", "every 15m"),
];

/// Spawn the polling loop. Returns `None` when the tick is `0` (disabled).
pub fn spawn(state: AppState) -> Option<JoinHandle<()>> {
    let tick = state.config.scheduler_tick_secs;
    if tick == 0 {
        tracing::info!("scheduler disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            run_due(&state, Utc::now()).await;
        }
    }))
}

/// Run every job due at `now`, recording outcomes.
pub async fn run_due(state: &AppState, now: DateTime<Utc>) -> Vec<(String, JobOutcome)> {
    let due = state.jobs.lock().due(now);
    let mut results = Vec::with_capacity(due.len());
    for name in due {
        let outcome = execute(state, &name, None).await;
        results.push((name, outcome));
    }
    results
}

/// Trigger a job and run it right away on behalf of `actor`.
pub async fn run_now(state: &AppState, name: &str, actor: UserId) -> Result<JobOutcome, AppError> {
    state.jobs.lock().trigger(name)?;
    Ok(execute(state, name, Some(actor)).await)
}

async fn execute(state: &AppState, name: &str, actor: Option<UserId>) -> JobOutcome {
    let started = Utc::now();
    let outcome = match run_job(state, name, started).await {
        Ok(summary) => JobOutcome::Success(summary),
        Err(e) => JobOutcome::Failed(e.to_string()),
    };
    if let Err(e) = state.jobs.lock().mark_ran(name, started, outcome.clone()) {
        tracing::error!(job = name, error = %e, "failed to record job run");
    }
    match &outcome {
        JobOutcome::Success(summary) => tracing::info!(job = name, %summary, "job finished"),
        JobOutcome::Failed(error) => tracing::warn!(job = name, %error, "job failed"),
    }
    state
        .record_audit(
            actor,
            "job.run",
            "job",
            name,
            serde_json::to_value(&outcome).unwrap_or_default(),
        )
        .await;
    outcome
}

async fn run_job(state: &AppState, name: &str, now: DateTime<Utc>) -> Result<String, AppError> {
    match name {
        "invoice_overdue_scan" => Ok(invoice_overdue_scan(state, now)),
        "email_outbox" => email_outbox(state).await,
        "lockout_sweep" => lockout_sweep(state, now).await,
        other => Err(AppError::not_found("job handler", other)),
    }
}

fn invoice_overdue_scan(state: &AppState, now: DateTime<Utc>) -> String {
    let today = now.date_naive();
    let overdue = state.invoices.filter(|i| i.is_overdue(today));
    let balance: i64 = overdue.iter().map(|i| i.balance_cents()).sum();
    for invoice in &overdue {
        tracing::info!(
            invoice = %invoice.number,
            due_date = ?invoice.due_date,
            balance_cents = invoice.balance_cents(),
            status = invoice.status.as_str(),
            "invoice overdue"
        );
    }
    let sent = overdue
        .iter()
        .filter(|i| i.status == InvoiceStatus::Sent)
        .count();
    format!(
        "{} overdue invoices ({} unpaid, {} cents outstanding)",
        overdue.len(),
        sent,
        balance
    )
}

async fn email_outbox(state: &AppState) -> Result<String, AppError> {
    let pending = state.emails.filter(|e| e.is_pending());
    let mut sent = 0;
    let mut failed = 0;
    for email in pending {
        let record = crate::mail::deliver_logged(state, email.id).await?;
        match record.status {
            EmailStatus::Sent => sent += 1,
            EmailStatus::Failed => failed += 1,
            // Claimed by a concurrent sender.
            EmailStatus::Queued | EmailStatus::Sending => {}
        }
    }
    Ok(format!("{sent} sent, {failed} failed"))
}

async fn lockout_sweep(state: &AppState, now: DateTime<Utc>) -> Result<String, AppError> {
    let expired = state.users.filter(|u| {
        u.attempts
            .locked_until
            .is_some_and(|until| until <= now)
    });
    let mut cleared = 0;
    for user in &expired {
        if clear_expired_lock(state, user.id, now).await? {
            cleared += 1;
        }
    }
    Ok(format!("{cleared} expired locks cleared"))
}

/// Clear `user`'s lock if it is still expired at `now`. A login failure may
/// have renewed the lock since the sweep listed it; that lock is left alone.
async fn clear_expired_lock(
    state: &AppState,
    user: UserId,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = state
        .commit_user(user, |u| match u.attempts.locked_until {
            Some(until) if until <= now => {
                u.attempts.unlock();
                u.updated_at = now;
                Ok(())
            }
            _ => Err(AppError::Conflict("lock renewed".into())),
        })
        .await;
    match result {
        Ok(_) => Ok(true),
        Err(AppError::Conflict(_) | AppError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use nutri_core::billing::LineItem;
    use nutri_core::{Email, Invoice, LoginAttempts, PatientId, RoleName};

    use crate::state::UserRecord;

    #[tokio::test]
    async fn nothing_is_due_right_after_start() {
        let state = AppState::new();
        assert!(run_due(&state, Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn run_now_executes_and_clears_trigger() {
        let state = AppState::new();
        let actor = UserId::new();
        let outcome = run_now(&state, "email_outbox", actor).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success("0 sent, 0 failed".into()));
        let jobs = state.jobs.lock();
        let job = jobs.get("email_outbox").unwrap();
        assert!(!job.triggered);
        assert!(job.last_run.is_some());
        drop(jobs);
        let entries = state.audit.query(Some("job"), Some("email_outbox"), Some(actor), 10);
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let state = AppState::new();
        let err = run_now(&state, "nope", UserId::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabled_jobs_are_skipped_when_due() {
        let state = AppState::new();
        state.jobs.lock().disable("lockout_sweep").unwrap();
        let later = Utc::now() + Duration::hours(1);
        let ran: Vec<String> = run_due(&state, later).await.into_iter().map(|(n, _)| n).collect();
        assert!(ran.contains(&"email_outbox".to_string()));
        assert!(!ran.contains(&"lockout_sweep".to_string()));
    }

    #[tokio::test]
    async fn lockout_sweep_clears_expired_locks() {
        let state = AppState::new();
        let now = Utc::now();
        let attempts = LoginAttempts {
            failed_attempts: 5,
            locked_until: Some(now - Duration::minutes(1)),
        };
        let user = UserRecord {
            id: UserId::new(),
            email: Email::new("x@example.org").unwrap(),
            display_name: "X".into(),
            role: RoleName::new("VIEWER").unwrap(),
            password_hash: String::new(),
            active: true,
            attempts,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(*user.id.as_uuid(), user.clone());
        let summary = lockout_sweep(&state, now).await.unwrap();
        assert_eq!(summary, "1 expired locks cleared");
        let swept = state.users.get(user.id.as_uuid()).unwrap();
        assert_eq!(swept.attempts, LoginAttempts::default());
    }

    #[tokio::test]
    async fn renewed_lock_survives_the_sweep() {
        let state = AppState::new();
        let now = Utc::now();
        let renewed = LoginAttempts {
            failed_attempts: 5,
            locked_until: Some(now + Duration::minutes(15)),
        };
        let user = UserRecord {
            id: UserId::new(),
            email: Email::new("y@example.org").unwrap(),
            display_name: "Y".into(),
            role: RoleName::new("VIEWER").unwrap(),
            password_hash: String::new(),
            active: true,
            attempts: renewed,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(*user.id.as_uuid(), user.clone());

        // Listed as expired earlier, re-locked before the unlock landed.
        assert!(!clear_expired_lock(&state, user.id, now).await.unwrap());
        assert_eq!(state.users.get(user.id.as_uuid()).unwrap().attempts, renewed);
        assert!(!clear_expired_lock(&state, UserId::new(), now).await.unwrap());

        let summary = lockout_sweep(&state, now).await.unwrap();
        assert_eq!(summary, "0 expired locks cleared");
        assert!(state.users.get(user.id.as_uuid()).unwrap().attempts.is_locked(now));
    }

    #[test]
    fn overdue_scan_counts_sent_invoices_past_due() {
        let state = AppState::new();
        let now = Utc::now();
        let mut invoice = Invoice::draft(
            PatientId::new(),
            UserId::new(),
            vec![LineItem {
                description: "Consultation".into(),
                quantity: 1,
                unit_price_cents: 6_000,
            }],
            NaiveDate::from_ymd_opt(2020, 1, 1),
            "EUR",
            1,
            now,
        )
        .unwrap();
        invoice.send(now).unwrap();
        state.invoices.insert(*invoice.id.as_uuid(), invoice);
        let summary = invoice_overdue_scan(&state, now);
        assert_eq!(summary, "1 overdue invoices (1 unpaid, 6000 cents outstanding)");
    }
}
