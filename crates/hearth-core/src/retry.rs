//! Retry policy: exponential backoff and the retry-or-discard decision.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::defaults;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Park in `retryable` until `scheduled_at`.
    Retry { scheduled_at: DateTime<Utc> },
    /// Move to the terminal `discarded` state.
    Discard,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap applied to every computed delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(defaults::JOB_BACKOFF_BASE_SECS),
            max: Duration::from_secs(defaults::JOB_BACKOFF_MAX_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_BACKOFF_BASE_SECS` | `2` | Delay before the first retry |
    /// | `JOB_BACKOFF_MAX_SECS` | `3600` | Upper bound on any delay |
    pub fn from_env() -> Self {
        let base = std::env::var("JOB_BACKOFF_BASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_BASE_SECS);
        let max = std::env::var("JOB_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_MAX_SECS)
            .max(base);

        Self {
            base: Duration::from_secs(base),
            max: Duration::from_secs(max),
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Delay after the given (1-based) failed attempt: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Decide the next state after attempt number `attempt` failed.
    ///
    /// A job runs at most `max_attempts` times: the failure of attempt
    /// `max_attempts` discards it.
    pub fn on_failure(
        &self,
        attempt: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        if attempt >= max_attempts {
            return FailureDisposition::Discard;
        }
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(defaults::JOB_BACKOFF_MAX_SECS as i64));
        FailureDisposition::Retry {
            scheduled_at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default()
            .with_base(Duration::from_secs(2))
            .with_max(Duration::from_secs(1000));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::default()
            .with_base(Duration::from_secs(10))
            .with_max(Duration::from_secs(60));
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_zero_attempt_is_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), policy.base);
    }

    #[test]
    fn test_retry_before_max_attempts() {
        let policy = RetryPolicy::default().with_base(Duration::from_secs(3));
        let now = Utc::now();
        match policy.on_failure(1, 3, now) {
            FailureDisposition::Retry { scheduled_at } => {
                assert_eq!(scheduled_at, now + chrono::Duration::seconds(3));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert!(matches!(
            policy.on_failure(2, 3, now),
            FailureDisposition::Retry { .. }
        ));
    }

    #[test]
    fn test_discard_at_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.on_failure(3, 3, now), FailureDisposition::Discard);
        assert_eq!(policy.on_failure(4, 3, now), FailureDisposition::Discard);
        assert_eq!(policy.on_failure(1, 1, now), FailureDisposition::Discard);
    }
}
