use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * (attempt + 1)`.
    Linear,
    /// `base * 2^attempt`.
    #[default]
    Exponential,
}

/// Retry budget and backoff for one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first cycle.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any delay.
    pub max_delay_ms: u64,
    /// Growth between retries.
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Whether another cycle may run after `retries` retries were consumed.
    #[must_use]
    pub const fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2_u64.saturating_pow(attempt)),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 350,
            strategy,
        }
    }

    #[test]
    fn strategies_grow_as_named() {
        let fixed = policy(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay(3), Duration::from_millis(100));
        let linear = policy(BackoffStrategy::Linear);
        assert_eq!(linear.delay(1), Duration::from_millis(200));
        let exponential = policy(BackoffStrategy::Exponential);
        assert_eq!(exponential.delay(0), Duration::from_millis(100));
        assert_eq!(exponential.delay(1), Duration::from_millis(200));
    }

    #[test]
    fn delays_are_capped() {
        let exponential = policy(BackoffStrategy::Exponential);
        assert_eq!(exponential.delay(2), Duration::from_millis(350));
        assert_eq!(exponential.delay(80), Duration::from_millis(350));
    }

    #[test]
    fn budget_counts_retries_not_cycles() {
        let policy = policy(BackoffStrategy::Fixed);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }
}
