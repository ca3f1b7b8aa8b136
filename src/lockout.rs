//! Per-username login lockout.
//!
//! After `max_failures` consecutive password mismatches a username is locked
//! for `lockout_secs`, even for correct passwords. The counter resets on a
//! successful login or once the lock expires. State is process-local and
//! forgotten on restart; it deters guessing, it is not a durable control.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::AuthFailure;

/// Default number of failures that triggers a lock.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

/// Default lock duration in seconds.
pub const DEFAULT_LOCKOUT_SECS: i64 = 60;

#[derive(Debug, Default, Clone)]
struct AttemptState {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct LoginGuard {
    attempts: Arc<DashMap<String, AttemptState>>,
    max_failures: u32,
    lockout: Duration,
}

impl Default for LoginGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILED_ATTEMPTS, DEFAULT_LOCKOUT_SECS)
    }
}

impl LoginGuard {
    pub fn new(max_failures: u32, lockout_secs: i64) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            max_failures: max_failures.max(1),
            // Out-of-range durations fall back to one day.
            lockout: Duration::try_seconds(lockout_secs).unwrap_or_else(|| Duration::days(1)),
        }
    }

    /// Refuse the attempt if `username` is currently locked.
    pub fn check(&self, username: &str) -> Result<(), AuthFailure> {
        self.check_at(username, Utc::now())
    }

    pub fn check_at(&self, username: &str, now: DateTime<Utc>) -> Result<(), AuthFailure> {
        let expired = match self.attempts.get(username) {
            Some(state) => match state.locked_until {
                Some(until) if now < until => {
                    let remaining_ms = (until - now).num_milliseconds();
                    return Err(AuthFailure::Locked {
                        retry_after_secs: ((remaining_ms + 999) / 1000).max(1),
                    });
                }
                Some(_) => true,
                None => false,
            },
            None => false,
        };

        if expired {
            // Lock has run out: start counting from zero again.
            self.attempts
                .remove_if(username, |_, state| matches!(state.locked_until, Some(until) if now >= until));
            tracing::debug!(username = username, "Login lock expired");
        }

        Ok(())
    }

    /// Count a password mismatch. Returns true if this failure locked the username.
    pub fn record_failure(&self, username: &str) -> bool {
        self.record_failure_at(username, Utc::now())
    }

    pub fn record_failure_at(&self, username: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.attempts.entry(username.to_string()).or_default();

        if matches!(state.locked_until, Some(until) if now >= until) {
            *state = AttemptState::default();
        }

        state.failures += 1;
        if state.failures >= self.max_failures && state.locked_until.is_none() {
            let until = now
                .checked_add_signed(self.lockout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.locked_until = Some(until);
            tracing::warn!(
                username = username,
                failures = state.failures,
                lockout_secs = self.lockout.num_seconds(),
                "Too many failed logins, username locked"
            );
            return true;
        }
        false
    }

    /// Clear the counter after a successful login.
    pub fn record_success(&self, username: &str) {
        self.attempts.remove(username);
    }

    /// Drop entries whose lock has expired. Called by the periodic cleanup task.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.attempts.len();
        self.attempts
            .retain(|_, state| !matches!(state.locked_until, Some(until) if now >= until));
        before - self.attempts.len()
    }

    pub fn failures(&self, username: &str) -> u32 {
        self.attempts
            .get(username)
            .map(|state| state.failures)
            .unwrap_or(0)
    }
}
