//! TOTP second factor.
//!
//! [`TotpState`] is the per-session state machine (retry counter and lock
//! window). [`TotpEngine`] talks to the identity backend for secrets and owns
//! enrollment and recovery.

mod engine;

pub use engine::{TotpEngine, TotpError};

use serde::{Deserialize, Serialize};

/// Consecutive bad codes tolerated before the session is locked.
pub const MAX_OTP_RETRY: u8 = 5;
/// Length of the lock window, in seconds.
pub const LOCK_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpState {
    /// The user has a TOTP secret registered.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub verify_required: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub retry_count: u8,
    /// Unix seconds, zero when unlocked.
    #[serde(default)]
    pub lock_expire: u32,
}

impl TotpState {
    #[must_use]
    pub fn new(enabled: bool, verify_required: bool) -> Self {
        Self {
            enabled,
            verify_required,
            ..Self::default()
        }
    }

    /// Whether requests on this session may pass the TOTP gate.
    #[must_use]
    pub fn gate_cleared(&self) -> bool {
        !self.verify_required || self.verified
    }

    /// Seconds left in the lock window, if locked at `now`.
    #[must_use]
    pub fn locked_for(&self, now: u32) -> Option<u32> {
        (now < self.lock_expire).then(|| self.lock_expire - now)
    }

    pub fn record_success(&mut self) {
        self.retry_count = 0;
        self.lock_expire = 0;
        self.verified = true;
    }

    pub fn record_failure(&mut self, now: u32) {
        // an expired lock is only cleared by the next failure
        if self.lock_expire != 0 && now >= self.lock_expire {
            self.retry_count = 0;
            self.lock_expire = 0;
        }
        self.retry_count = self.retry_count.saturating_add(1).min(MAX_OTP_RETRY);
        if self.retry_count >= MAX_OTP_RETRY {
            self.lock_expire = now.saturating_add(LOCK_SECONDS);
        }
    }
}

/// Current time as 32-bit unix seconds.
#[must_use]
pub fn unix_now() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifth_failure_locks_for_thirty_seconds() {
        let mut state = TotpState::new(true, true);
        let now = 1_000;
        for attempt in 1..MAX_OTP_RETRY {
            state.record_failure(now);
            assert_eq!(state.retry_count, attempt);
            assert_eq!(state.locked_for(now), None);
        }
        state.record_failure(now);
        assert_eq!(state.retry_count, MAX_OTP_RETRY);
        assert_eq!(state.lock_expire, now + LOCK_SECONDS);
        assert_eq!(state.locked_for(now + 1), Some(LOCK_SECONDS - 1));
        assert_eq!(state.locked_for(now + LOCK_SECONDS), None);
    }

    #[test]
    fn failure_after_lock_expiry_starts_over() {
        let mut state = TotpState::new(true, true);
        for _ in 0..MAX_OTP_RETRY {
            state.record_failure(100);
        }
        // expiry alone leaves the counters untouched
        assert_eq!(state.retry_count, MAX_OTP_RETRY);
        state.record_failure(100 + LOCK_SECONDS);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.lock_expire, 0);
    }

    #[test]
    fn success_clears_counters() {
        let mut state = TotpState::new(true, true);
        state.record_failure(5);
        state.record_failure(5);
        assert!(!state.gate_cleared());
        state.record_success();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.lock_expire, 0);
        assert!(state.gate_cleared());
    }

    #[test]
    fn gate_open_when_not_required() {
        assert!(TotpState::new(false, false).gate_cleared());
        assert!(!TotpState::new(false, true).gate_cleared());
    }
}
