//! # Mail Delivery
//!
//! Emails are written to the email log as `queued` and delivered by the
//! `email_outbox` job (or immediately on send). Delivery posts JSON to an
//! HTTP mail relay. Without `MAIL_API_URL` the mailer runs in log-only
//! mode: messages are marked sent after being logged (no body is logged).
//!
//! Variables:
//! - `MAIL_API_URL` (optional relay endpoint)
//! - `MAIL_API_KEY` (optional bearer token)
//! - `MAIL_FROM` (default: `no-reply@localhost`)

use std::time::Duration;

use chrono::Utc;
use nutri_core::EmailLogId;
use serde::Serialize;
use url::Url;

use crate::config::Secret;
use crate::error::AppError;
use crate::state::{AppState, EmailLogRecord, EmailStatus};
use crate::upstream::{ensure_success, env_url, retry_send, ConfigError, ProviderError};

const ENDPOINT: &str = "POST mail relay";

/// Mail relay configuration.
#[derive(Clone, Debug)]
pub struct MailConfig {
    pub api_url: Url,
    pub api_key: Option<Secret>,
    pub from: String,
}

fn mail_from() -> String {
    std::env::var("MAIL_FROM")
        .ok()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| "no-reply@localhost".to_string())
}

impl MailConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: env_url("MAIL_API_URL")?,
            api_key: std::env::var("MAIL_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(Secret::new),
            from: mail_from(),
        })
    }
}

/// An outgoing message.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMail<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone)]
enum Transport {
    Relay { http: reqwest::Client, config: MailConfig },
    Log { from: String },
}

/// Delivers emails through the relay, or logs them.
#[derive(Debug, Clone)]
pub struct Mailer {
    transport: Transport,
}

impl Mailer {
    /// Mailer posting to an HTTP relay.
    pub fn relay(config: MailConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ProviderError::Http {
                endpoint: "client_init".into(),
                source: e,
            })?;
        Ok(Self {
            transport: Transport::Relay { http, config },
        })
    }

    /// Mailer that only logs deliveries.
    pub fn log_only() -> Self {
        Self {
            transport: Transport::Log { from: mail_from() },
        }
    }

    pub fn is_log_only(&self) -> bool {
        matches!(self.transport, Transport::Log { .. })
    }

    /// Deliver one message. Only `id` is logged; recipient and subject are
    /// patient data.
    pub async fn send(
        &self,
        id: EmailLogId,
        to: &str,
        subject: &str,
        text: &str,
    ) -> Result<(), ProviderError> {
        match &self.transport {
            Transport::Log { from } => {
                tracing::info!(email_id = %id, %from, "mail (log-only mode)");
                Ok(())
            }
            Transport::Relay { http, config } => {
                let mail = OutgoingMail {
                    from: &config.from,
                    to,
                    subject,
                    text,
                };
                let resp = retry_send(|| {
                    let mut req = http.post(config.api_url.clone()).json(&mail);
                    if let Some(key) = &config.api_key {
                        req = req.bearer_auth(key.expose());
                    }
                    req.send()
                })
                .await
                .map_err(|e| ProviderError::Http {
                    endpoint: ENDPOINT.into(),
                    source: e,
                })?;
                ensure_success(ENDPOINT, resp).await?;
                tracing::info!(email_id = %id, "mail delivered to relay");
                Ok(())
            }
        }
    }
}

/// Attempt delivery of a logged email and record the result.
///
/// The email is first claimed by moving it to `sending` under the store
/// lock, so concurrent callers cannot both hand it to the relay. Emails that
/// are sent, already claimed or out of attempts are returned unchanged. A
/// delivery failure is stored on the record (status `failed`, error text)
/// rather than returned.
pub async fn deliver_logged(state: &AppState, id: EmailLogId) -> Result<EmailLogRecord, AppError> {
    let mut claimed = false;
    let email = state
        .emails
        .update(id.as_uuid(), |e| {
            if e.is_pending() {
                e.status = EmailStatus::Sending;
                claimed = true;
            }
        })
        .ok_or_else(|| AppError::not_found("email", id))?;
    if !claimed {
        tracing::debug!(email_id = %id, status = ?email.status, "email not claimable, skipped");
        return Ok(email);
    }

    let result = state
        .mailer
        .send(id, email.to.as_str(), &email.subject, &email.body)
        .await;
    let now = Utc::now();
    let updated = state
        .emails
        .update(id.as_uuid(), |e| {
            e.attempts += 1;
            match &result {
                Ok(()) => {
                    e.status = EmailStatus::Sent;
                    e.sent_at = Some(now);
                    e.last_error = None;
                }
                Err(err) => {
                    e.status = EmailStatus::Failed;
                    e.last_error = Some(err.to_string());
                }
            }
        })
        .ok_or_else(|| AppError::not_found("email", id))?;

    match &result {
        Ok(()) => {
            state
                .record_audit(
                    Some(updated.created_by),
                    "email.sent",
                    "email",
                    id,
                    serde_json::json!({ "patient_id": updated.patient_id }),
                )
                .await
        }
        Err(err) => tracing::warn!(email_id = %id, attempts = updated.attempts, error = %err, "email delivery failed"),
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MAX_EMAIL_ATTEMPTS;
    use nutri_core::{Email, PatientId, UserId};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn log_only_mailer_always_succeeds() {
        let mailer = Mailer::log_only();
        assert!(mailer.is_log_only());
        mailer
            .send(EmailLogId::new(), "patient@example.org", "Follow-up", "Hello")
            .await
            .unwrap();
    }

    fn queued(to: &str) -> EmailLogRecord {
        EmailLogRecord {
            id: EmailLogId::new(),
            patient_id: PatientId::new(),
            visit_id: None,
            to: Email::new(to).unwrap(),
            subject: "Your diet plan".into(),
            body: "Hello".into(),
            status: EmailStatus::Queued,
            attempts: 0,
            last_error: None,
            created_by: UserId::new(),
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_logs_the_email_id_only() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = AppState::new();
        let record = queued("jan.kowalski@example.org");
        let id = record.id;
        state.emails.insert(*id.as_uuid(), record);
        deliver_logged(&state, id).await.unwrap();

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains(&id.to_string()));
        assert!(!logs.contains("jan.kowalski"));
        assert!(!logs.contains("Your diet plan"));
    }

    #[tokio::test]
    async fn claimed_email_is_not_sent_twice() {
        let state = AppState::new();
        let mut record = queued("p@example.org");
        record.status = EmailStatus::Sending;
        let id = record.id;
        state.emails.insert(*id.as_uuid(), record);

        let skipped = deliver_logged(&state, id).await.unwrap();
        assert_eq!(skipped.status, EmailStatus::Sending);
        assert_eq!(skipped.attempts, 0);
        assert!(state.audit.is_empty());

        state.emails.update(id.as_uuid(), |e| {
            e.status = EmailStatus::Failed;
            e.attempts = MAX_EMAIL_ATTEMPTS;
        });
        let exhausted = deliver_logged(&state, id).await.unwrap();
        assert_eq!(exhausted.status, EmailStatus::Failed);
        assert_eq!(exhausted.attempts, MAX_EMAIL_ATTEMPTS);
    }

    #[tokio::test]
    async fn concurrent_deliveries_send_once() {
        let state = AppState::new();
        let record = queued("p@example.org");
        let id = record.id;
        state.emails.insert(*id.as_uuid(), record);

        let (a, b) = tokio::join!(deliver_logged(&state, id), deliver_logged(&state, id));
        a.unwrap();
        b.unwrap();
        let stored = state.emails.get(id.as_uuid()).unwrap();
        assert_eq!(stored.status, EmailStatus::Sent);
        assert_eq!(stored.attempts, 1);
        assert_eq!(state.audit.len(), 1);
    }

    #[tokio::test]
    async fn deliver_logged_marks_sent() {
        let state = AppState::new();
        let record = queued("p@example.org");
        let id = record.id;
        state.emails.insert(*id.as_uuid(), record);
        let sent = deliver_logged(&state, id).await.unwrap();
        assert_eq!(sent.status, EmailStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert!(sent.sent_at.is_some());
        // Sending again is a no-op.
        let again = deliver_logged(&state, id).await.unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(state.audit.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_relay_fails() {
        let mailer = Mailer::relay(MailConfig {
            api_url: Url::parse("http://127.0.0.1:1/send").unwrap(),
            api_key: None,
            from: "clinic@example.org".into(),
        })
        .unwrap();
        assert!(!mailer.is_log_only());
        let err = mailer
            .send(EmailLogId::new(), "p@example.org", "s", "t")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { .. }));
    }
}
