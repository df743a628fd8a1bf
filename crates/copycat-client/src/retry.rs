//! Retry Policy with Exponential Backoff
//!
//! Transient failures (no leader during an election, a commit round lost to
//! a leadership change, an unreachable server) are retried with exponential
//! backoff:
//!
//! ```text
//! backoff(n) = min(initial_backoff * multiplier^n, max_backoff)
//! ```
//!
//! Non-retryable failures (application errors, unknown sessions) are
//! decided by the caller from the [`RaftError`] kind; this module only
//! supplies the schedule.
//!
//! [`RaftError`]: copycat_core::RaftError

use std::time::Duration;

/// Retry schedule configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial try.
    pub max_retries: usize,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound on any single backoff.
    pub max_backoff: Duration,

    /// Exponential growth factor.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let backoff = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(backoff.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether another retry is allowed after `attempt` attempts.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 20,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
    }

    #[test]
    fn test_allows_counts_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}
