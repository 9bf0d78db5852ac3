//! Exponential backoff with jitter for transient delivery failures.
//!
//! The nominal interval after the n-th counted failure is
//! `base_delay * 2^n`, capped at `max_delay`. The scheduled attempt time adds
//! a symmetric random jitter to that interval, and a destination-provided
//! `Retry-After` can only push it further out, up to [`MAX_RETRY_AFTER`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use leadrelay_core::{ErrorClass, FailureClass};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Longest wait honoured from a destination's `Retry-After`.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry policy shared by every destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Counted failures after which an event goes to the dead-letter queue.
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    pub base_delay: Duration,

    /// Upper bound on the nominal backoff interval.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Nominal, un-jittered backoff after `attempt_count` counted failures.
    pub fn backoff_interval(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(30);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
    }
}

/// Everything needed to decide what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Counted failures including this one.
    pub attempt_count: u32,
    /// Error of the failed attempt.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: RetryPolicy,
}

/// What to do with a failed event.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
        /// Nominal interval that produced it
        backoff_interval: Duration,
    },
    /// Move the event to the dead-letter queue.
    GiveUp {
        /// Dead-letter category
        error_class: ErrorClass,
        /// Human-readable reason
        reason: String,
    },
}

impl RetryContext {
    /// Creates a context for a failed attempt.
    pub fn new(
        attempt_count: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_count, error, failed_at, policy }
    }

    /// Decides between another attempt and the dead-letter queue.
    ///
    /// Permanent failures are never retried. Transient failures are retried
    /// until `attempt_count` reaches `max_attempts`.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.error.failure_class() == FailureClass::Permanent {
            return RetryDecision::GiveUp {
                error_class: ErrorClass::Permanent,
                reason: format!("permanent failure: {}", self.error),
            };
        }

        if self.attempt_count >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                error_class: ErrorClass::RetriesExhausted,
                reason: "retries exhausted".to_string(),
            };
        }

        let backoff_interval = self.policy.backoff_interval(self.attempt_count);
        let delay = self.calculate_delay(backoff_interval);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| self.failed_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry { next_attempt_at, backoff_interval }
    }

    fn calculate_delay(&self, backoff_interval: Duration) -> Duration {
        let jittered = apply_jitter(backoff_interval, self.policy.jitter_factor);
        match self.error.retry_after_seconds() {
            Some(seconds) => jittered.max(Duration::from_secs(seconds).min(MAX_RETRY_AFTER)),
            None => jittered,
        }
    }
}

/// Randomizes `duration` by up to `±jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    #[test]
    fn backoff_doubles_per_counted_failure() {
        let policy = no_jitter();
        let delays: Vec<_> = (1..=4).map(|n| policy.backoff_interval(n)).collect();

        assert_eq!(delays, vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
        ]);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(60), ..no_jitter() };
        assert_eq!(policy.backoff_interval(12), Duration::from_secs(60));
        assert_eq!(policy.backoff_interval(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn transient_failure_schedules_retry() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            DeliveryError::server_error(500, ""),
            failed_at,
            no_jitter(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at, backoff_interval } => {
                assert_eq!(backoff_interval, Duration::from_secs(2));
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(2));
            },
            RetryDecision::GiveUp { reason, .. } => panic!("unexpected give up: {reason}"),
        }
    }

    #[test]
    fn exhausted_attempts_give_up() {
        let policy = RetryPolicy { max_attempts: 3, ..no_jitter() };
        let context =
            RetryContext::new(3, DeliveryError::server_error(500, ""), Utc::now(), policy);

        assert_eq!(context.decide_retry(), RetryDecision::GiveUp {
            error_class: ErrorClass::RetriesExhausted,
            reason: "retries exhausted".to_string(),
        });
    }

    #[test]
    fn permanent_failures_never_retry() {
        let context = RetryContext::new(
            1,
            DeliveryError::client_error(400, "invalid parameter"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { error_class, reason } => {
                assert_eq!(error_class, ErrorClass::Permanent);
                assert!(reason.contains("HTTP 400"));
            },
            RetryDecision::Retry { .. } => panic!("client errors must not be retried"),
        }
    }

    #[test]
    fn retry_after_extends_next_attempt() {
        let failed_at = Utc::now();
        let context =
            RetryContext::new(1, DeliveryError::rate_limited(120), failed_at, no_jitter());

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at, backoff_interval } => {
                assert_eq!(backoff_interval, Duration::from_secs(2));
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(120));
            },
            RetryDecision::GiveUp { reason, .. } => panic!("unexpected give up: {reason}"),
        }
    }

    #[test]
    fn huge_retry_after_is_capped_not_dropped() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            DeliveryError::rate_limited(u64::MAX / 2),
            failed_at,
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at, .. } => {
                let wait = next_attempt_at - failed_at;
                assert_eq!(wait, chrono::Duration::from_std(MAX_RETRY_AFTER).unwrap());
            },
            RetryDecision::GiveUp { reason, .. } => panic!("unexpected give up: {reason}"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..50 {
            let jittered = apply_jitter(base_delay, 0.2);
            assert!(jittered >= Duration::from_secs(8), "delay too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(12), "delay too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }
}
