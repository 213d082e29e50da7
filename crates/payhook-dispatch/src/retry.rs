//! Retry policy with exponential backoff and jitter.
//!
//! Delay grows as `base_delay * 2^(attempt - 1)`, capped at `max_delay`,
//! then randomized by `±jitter_factor` so a burst of failures from one
//! outage does not come back as a synchronized thundering herd.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use payhook_core::HandlerError;

/// Backoff configuration for failed webhook attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the event is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Jitter applied to each delay, as a fraction in `[0, 1)`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
        }
    }
}

/// What to do with an event after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given time.
    Retry {
        /// When the retry becomes due.
        at: DateTime<Utc>,
    },
    /// Stop retrying and park the event for manual review.
    DeadLetter {
        /// Why retries stopped.
        reason: String,
    },
}

impl RetryPolicy {
    /// Policy that never jitters, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before the next attempt, where `attempt` is the 1-based count
    /// of attempts that have already failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(32);
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_factor > 0.0 {
            let factor =
                rand::rng().random_range(1.0 - self.jitter_factor..=1.0 + self.jitter_factor);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Grades a failed attempt into a retry or a dead-letter.
    ///
    /// `attempt_count` includes the attempt that just failed. Permanent
    /// handler failures dead-letter immediately regardless of the count.
    pub fn decide(
        &self,
        attempt_count: u32,
        error: &HandlerError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match error {
            HandlerError::Permanent(reason) => {
                RetryDecision::DeadLetter { reason: format!("permanent failure: {reason}") }
            },
            HandlerError::Transient(reason) => {
                if attempt_count >= self.max_attempts {
                    RetryDecision::DeadLetter {
                        reason: format!("retries exhausted after {attempt_count} attempts: {reason}"),
                    }
                } else {
                    let delay = self.backoff_delay(attempt_count);
                    let delay = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    RetryDecision::Retry { at: now + delay }
                }
            },
        }
    }
}
