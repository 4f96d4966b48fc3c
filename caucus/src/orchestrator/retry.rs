//! Bounded retry with exponential backoff for external calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CaucusConfig;

/// Retry policy: bounded attempts, exponential backoff with a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Delay ceiling, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Backoff before retry number `attempt` (0-based): base doubled per
    /// attempt, capped at the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500, 30_000)
    }
}

impl From<&CaucusConfig> for RetryPolicy {
    fn from(config: &CaucusConfig) -> Self {
        Self::new(
            config.cycle_attempts,
            config.backoff_base_ms,
            config.backoff_max_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 450);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(450));
        assert_eq!(policy.delay(30), Duration::from_millis(450));
    }

    #[test]
    fn test_allows_retry_bound() {
        let policy = RetryPolicy::new(3, 1, 10);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::new(0, 1, 10);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_from_config() {
        let config = CaucusConfig {
            cycle_attempts: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 1000,
            ..Default::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
    }
}
