//! Failed-attempt lockout per authentication context.
//!
//! After `max_failed_attempts` consecutive no-match results a context is
//! locked for `lockout_duration`. Expiry is evaluated lazily whenever the
//! state is queried, so no timer or scheduler is needed. Every method takes
//! the current instant explicitly, which lets tests drive virtual time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lockout policy shared by every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub lockout_duration: Duration,
}

/// Observable lockout phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutStatus {
    Normal { failed_attempts: u32 },
    LockedOut { remaining: Duration },
}

/// Lockout state of one authentication context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockoutState {
    failed_attempts: u32,
    locked_since: Option<Instant>,
}

impl LockoutState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Current phase, resetting to `Normal(0)` first if the lockout has
    /// expired.
    pub fn status(&mut self, now: Instant, policy: &LockoutPolicy) -> LockoutStatus {
        if let Some(since) = self.locked_since {
            let elapsed = now.saturating_duration_since(since);
            if elapsed < policy.lockout_duration {
                return LockoutStatus::LockedOut {
                    remaining: policy.lockout_duration - elapsed,
                };
            }
            tracing::info!(
                locked_secs = elapsed.as_secs(),
                "lockout expired, resetting failure counter"
            );
            *self = Self::new();
        }
        LockoutStatus::Normal {
            failed_attempts: self.failed_attempts,
        }
    }

    /// Record a failed attempt. Returns the resulting status.
    pub fn record_failure(&mut self, now: Instant, policy: &LockoutPolicy) -> LockoutStatus {
        if let LockoutStatus::LockedOut { remaining } = self.status(now, policy) {
            return LockoutStatus::LockedOut { remaining };
        }

        self.failed_attempts += 1;
        if self.failed_attempts >= policy.max_failed_attempts {
            self.locked_since = Some(now);
            tracing::warn!(
                failures = self.failed_attempts,
                lockout_secs = policy.lockout_duration.as_secs(),
                "failure limit reached, locking context"
            );
            LockoutStatus::LockedOut {
                remaining: policy.lockout_duration,
            }
        } else {
            tracing::debug!(
                failures = self.failed_attempts,
                max = policy.max_failed_attempts,
                "authentication failed, incrementing failure counter"
            );
            LockoutStatus::Normal {
                failed_attempts: self.failed_attempts,
            }
        }
    }

    /// Any successful authentication unconditionally resets to `Normal(0)`.
    pub fn clear_on_success(&mut self) {
        *self = Self::new();
    }
}

/// Lockout states keyed by authentication context (for example a device id).
///
/// Each context's state sits behind its own async mutex. An attempt holds
/// that lock from the lockout check until the outcome is recorded, so two
/// concurrent attempts in one context cannot both slip under the limit.
#[derive(Debug, Default)]
pub struct LockoutRegistry {
    contexts: Mutex<HashMap<String, Arc<tokio::sync::Mutex<LockoutState>>>>,
}

impl LockoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// State handle for `context`, created in `Normal(0)` on first use.
    pub fn context(&self, context: &str) -> Arc<tokio::sync::Mutex<LockoutState>> {
        let mut contexts = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        contexts
            .entry(context.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(LockoutState::new())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
