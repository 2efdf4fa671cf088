//! Centralized reconnect policy.
//!
//! Both the relay client reconnect loop and the mesh signaling re-listen
//! loop ask the same [`RetryPolicy`] what to do after a failure, so the
//! backoff curve and the give-up rule live in one place.

use std::time::Duration;

use crate::error::{ErrorClass, SyncError};

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = unlimited).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Decide what to do after `attempt` consecutive failures (1-based).
    pub fn decide(&self, error: &SyncError, attempt: u32) -> RetryDecision {
        if error.class() == ErrorClass::Permanent {
            return RetryDecision::GiveUp;
        }
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }

    /// Backoff delay for the given attempt, doubling from `base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}
