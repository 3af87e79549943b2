//! # Login Lockout
//!
//! Counts consecutive failed logins per account. Reaching the policy's
//! attempt limit locks the account until a fixed instant; the lock expires
//! on its own or is cleared by an administrator. A successful login resets
//! the counter.
//!
//! All methods take `now` explicitly so callers control the clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of consecutive failures before the account locks.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default lock duration in minutes.
pub const DEFAULT_LOCK_MINUTES: i64 = 30;

/// Lockout thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Consecutive failures that trigger a lock.
    pub max_attempts: u32,
    /// How long a lock lasts.
    pub lock_duration: Duration,
}

impl LockoutPolicy {
    /// Build a policy, clamping `max_attempts` to at least 1 and the
    /// duration to at least one minute.
    pub fn new(max_attempts: u32, lock_minutes: i64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lock_duration: Duration::minutes(lock_minutes.max(1)),
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_LOCK_MINUTES)
    }
}

/// The account is locked until `until`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("account locked until {until}")]
pub struct LoginLocked {
    /// When the lock expires.
    pub until: DateTime<Utc>,
}

/// Result of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The account is still usable; `remaining` attempts are left.
    Counted {
        /// Attempts left before the account locks.
        remaining: u32,
    },
    /// This failure locked the account.
    Locked(LoginLocked),
}

/// Per-account login attempt state, persisted on the user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempts {
    /// Consecutive failures since the last success or lock expiry.
    pub failed_attempts: u32,
    /// Instant the current lock expires, if any.
    pub locked_until: Option<DateTime<Utc>>,
}

impl LoginAttempts {
    /// Fail if the account is locked at `now`.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), LoginLocked> {
        match self.locked_until {
            Some(until) if until > now => Err(LoginLocked { until }),
            _ => Ok(()),
        }
    }

    /// Whether the account is locked at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_err()
    }

    /// Record a failed login at `now`.
    ///
    /// A failure after an expired lock starts a fresh count.
    pub fn record_failure(&mut self, now: DateTime<Utc>, policy: &LockoutPolicy) -> FailureOutcome {
        if let Err(locked) = self.check(now) {
            return FailureOutcome::Locked(locked);
        }
        if self.locked_until.take().is_some() {
            self.failed_attempts = 0;
        }

        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= policy.max_attempts {
            let until = now + policy.lock_duration;
            self.locked_until = Some(until);
            FailureOutcome::Locked(LoginLocked { until })
        } else {
            FailureOutcome::Counted {
                remaining: policy.max_attempts - self.failed_attempts,
            }
        }
    }

    /// Record a successful login.
    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    /// Clear any lock and the failure counter.
    pub fn unlock(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fifth_failure_locks_for_thirty_minutes() {
        let policy = LockoutPolicy::default();
        let mut attempts = LoginAttempts::default();
        for i in 1..5 {
            assert_eq!(
                attempts.record_failure(t0(), &policy),
                FailureOutcome::Counted { remaining: 5 - i }
            );
        }
        let outcome = attempts.record_failure(t0(), &policy);
        let until = t0() + Duration::minutes(30);
        assert_eq!(outcome, FailureOutcome::Locked(LoginLocked { until }));
        assert_eq!(attempts.check(t0()), Err(LoginLocked { until }));
    }

    #[test]
    fn lock_expires() {
        let policy = LockoutPolicy::new(2, 10);
        let mut attempts = LoginAttempts::default();
        attempts.record_failure(t0(), &policy);
        attempts.record_failure(t0(), &policy);
        assert!(attempts.is_locked(t0() + Duration::minutes(9)));
        assert!(!attempts.is_locked(t0() + Duration::minutes(10)));
    }

    #[test]
    fn failure_while_locked_does_not_extend_lock() {
        let policy = LockoutPolicy::new(1, 10);
        let mut attempts = LoginAttempts::default();
        attempts.record_failure(t0(), &policy);
        let later = t0() + Duration::minutes(5);
        let outcome = attempts.record_failure(later, &policy);
        assert_eq!(
            outcome,
            FailureOutcome::Locked(LoginLocked {
                until: t0() + Duration::minutes(10)
            })
        );
    }

    #[test]
    fn failure_after_expiry_restarts_count() {
        let policy = LockoutPolicy::new(3, 10);
        let mut attempts = LoginAttempts::default();
        for _ in 0..3 {
            attempts.record_failure(t0(), &policy);
        }
        let later = t0() + Duration::minutes(11);
        assert_eq!(
            attempts.record_failure(later, &policy),
            FailureOutcome::Counted { remaining: 2 }
        );
        assert_eq!(attempts.failed_attempts, 1);
        assert!(attempts.locked_until.is_none());
    }

    #[test]
    fn success_resets() {
        let policy = LockoutPolicy::default();
        let mut attempts = LoginAttempts::default();
        attempts.record_failure(t0(), &policy);
        attempts.record_success();
        assert_eq!(attempts, LoginAttempts::default());
    }

    #[test]
    fn unlock_clears_active_lock() {
        let policy = LockoutPolicy::new(1, 60);
        let mut attempts = LoginAttempts::default();
        attempts.record_failure(t0(), &policy);
        attempts.unlock();
        assert!(attempts.check(t0()).is_ok());
    }

    #[test]
    fn policy_clamps_degenerate_values() {
        let policy = LockoutPolicy::new(0, 0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.lock_duration, Duration::minutes(1));
    }

    proptest! {
        #[test]
        fn never_locked_below_threshold(max in 2u32..10, fails in 0u32..10) {
            let policy = LockoutPolicy::new(max, 30);
            let mut attempts = LoginAttempts::default();
            for _ in 0..fails.min(max - 1) {
                attempts.record_failure(t0(), &policy);
            }
            prop_assert!(!attempts.is_locked(t0()));
        }
    }
}
