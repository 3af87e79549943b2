//! # Configuration
//!
//! Environment-driven settings read once at start-up. Secrets are held in
//! [`Secret`], which zeroizes on drop and never prints its contents.
//!
//! | Variable | Default |
//! |---|---|
//! | `PORT` | `8080` |
//! | `JWT_SECRET` | random per process (tokens do not survive restart) |
//! | `JWT_TTL_SECS` | `3600` |
//! | `RBAC_CONFIG` | built-in role table |
//! | `LOCKOUT_MAX_ATTEMPTS` / `LOCKOUT_MINUTES` | `5` / `30` |
//! | `PASSWORD_ITERATIONS` | `210000` |
//! | `SCHEDULER_TICK_SECS` | `30` (`0` disables the runner) |
//! | `BOOTSTRAP_ADMIN_EMAIL` / `BOOTSTRAP_ADMIN_PASSWORD` | unset |
//! | `PRACTICE_NAME` | unset |
//!
//! AI and mail settings live in [`crate::ai::AiConfig`] and
//! [`crate::mail::MailConfig`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use nutri_core::lockout::{DEFAULT_LOCK_MINUTES, DEFAULT_MAX_ATTEMPTS};
use nutri_core::password::DEFAULT_ITERATIONS;
use nutri_core::LockoutPolicy;
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 32 random bytes, base64url-encoded.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = Self(URL_SAFE_NO_PAD.encode(bytes));
        bytes.zeroize();
        secret
    }

    /// Expose the secret for use. Never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Initial administrator created on first start when no users exist.
#[derive(Clone, Debug)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: Secret,
}

/// Application configuration.
///
/// Custom `Debug` (via [`Secret`]) redacts every credential.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// HMAC key for access tokens.
    pub jwt_secret: Secret,
    /// Access token lifetime in seconds.
    pub jwt_ttl_secs: i64,
    /// Path to a YAML role table overriding the built-in one.
    pub rbac_config: Option<String>,
    /// Failed-login lockout thresholds.
    pub lockout: LockoutPolicy,
    /// PBKDF2 iterations for new password hashes.
    pub password_iterations: u32,
    /// Scheduler poll interval; `0` disables the background runner.
    pub scheduler_tick_secs: u64,
    /// Initial administrator account.
    pub bootstrap_admin: Option<BootstrapAdmin>,
    /// Practice name offered to follow-up drafts.
    pub practice_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            jwt_secret: Secret::random(),
            jwt_ttl_secs: 3600,
            rbac_config: None,
            lockout: LockoutPolicy::default(),
            password_iterations: DEFAULT_ITERATIONS,
            scheduler_tick_secs: 30,
            bootstrap_admin: None,
            practice_name: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var, value = %raw, "ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}

fn env_nonempty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let jwt_secret = match env_nonempty("JWT_SECRET") {
            Some(s) => Secret::new(s),
            None => {
                tracing::warn!(
                    "JWT_SECRET not set; generating an ephemeral key. \
                     Issued tokens will not survive a restart."
                );
                Secret::random()
            }
        };

        let bootstrap_admin = match (
            env_nonempty("BOOTSTRAP_ADMIN_EMAIL"),
            env_nonempty("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Some(email), Some(password)) => Some(BootstrapAdmin {
                email,
                password: Secret::new(password),
            }),
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together; ignoring"
                );
                None
            }
        };

        Self {
            port: env_parse("PORT", 8080),
            jwt_secret,
            jwt_ttl_secs: env_parse("JWT_TTL_SECS", 3600i64).max(60),
            rbac_config: env_nonempty("RBAC_CONFIG"),
            lockout: LockoutPolicy::new(
                env_parse("LOCKOUT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                env_parse("LOCKOUT_MINUTES", DEFAULT_LOCK_MINUTES),
            ),
            password_iterations: env_parse("PASSWORD_ITERATIONS", DEFAULT_ITERATIONS).max(1),
            scheduler_tick_secs: env_parse("SCHEDULER_TICK_SECS", 30u64),
            bootstrap_admin,
            practice_name: env_nonempty("PRACTICE_NAME"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let config = AppConfig {
            jwt_secret: Secret::new("super-secret-key"),
            bootstrap_admin: Some(BootstrapAdmin {
                email: "admin@example.org".into(),
                password: Secret::new("Adm1nPassw0rd"),
            }),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-key"));
        assert!(!debug.contains("Adm1nPassw0rd"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("admin@example.org"));
    }

    #[test]
    fn random_secrets_differ() {
        let a = Secret::random();
        let b = Secret::random();
        assert_ne!(a.expose(), b.expose());
        assert_eq!(a.expose().len(), 43);
    }

    #[test]
    fn env_parse_falls_back() {
        assert_eq!(env_parse("NUTRI_TEST_UNSET_VAR_1234", 7u32), 7);
    }
}
