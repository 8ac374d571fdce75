//! # Retry Logic and Backoff Strategies
//!
//! Backoff delays for failed sync deliveries and the attempt cutoff after
//! which an operation is dead-lettered instead of retried.
//!
//! ## Features
//!
//! - **Exponential Backoff**: `base * factor^(attempt-1)`, capped
//! - **Fixed Interval**: constant delay between attempts
//! - **Max Attempts**: no infinite retry; exhausted operations are surfaced
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use xfsync::offline::retry::{BackoffStrategy, RetryPolicy};
//!
//! let policy = RetryPolicy::new(BackoffStrategy::exponential_default(), 6);
//! assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
//! assert_eq!(policy.next_delay(3), Some(Duration::from_secs(4)));
//! assert_eq!(policy.next_delay(6), None);
//! ```

use crate::shared::config::SyncConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed interval between retries
    Fixed {
        /// Delay between attempts
        interval: Duration,
    },
    /// Exponential backoff
    Exponential {
        /// Delay after the first failure
        base: Duration,
        /// Growth per further failure
        factor: f64,
        /// Upper bound on a single delay
        max: Duration,
    },
}

impl BackoffStrategy {
    /// 1s base, factor 2, capped at 30s
    pub fn exponential_default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }

    /// Delay to wait after `failures` consecutive failed attempts (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential { base, factor, max } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let millis = base.as_millis() as f64 * factor.powi(exponent);
                let capped = max.as_millis() as f64;
                if !millis.is_finite() || millis >= capped {
                    *max
                } else {
                    Duration::from_millis(millis.max(0.0) as u64)
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential_default()
    }
}

/// Backoff plus attempt cutoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` deliveries in total
    pub fn new(strategy: BackoffStrategy, max_attempts: u32) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build from the `[sync]` config section
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            BackoffStrategy::Exponential {
                base: Duration::from_millis(config.base_delay_ms),
                factor: config.factor,
                max: Duration::from_millis(config.max_delay_ms),
            },
            config.max_attempts,
        )
    }

    /// Delay before the next attempt, or `None` when `attempts` used them all up
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            None
        } else {
            Some(self.strategy.delay_for(attempts))
        }
    }

    /// Total deliveries allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Set backoff strategy
    pub fn set_backoff_strategy(&mut self, strategy: BackoffStrategy) {
        self.strategy = strategy;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let strategy = BackoffStrategy::exponential_default();
        let delays: Vec<u64> = (1..=7).map(|n| strategy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_count_is_capped() {
        let strategy = BackoffStrategy::exponential_default();
        assert_eq!(strategy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_interval() {
        let strategy = BackoffStrategy::Fixed {
            interval: Duration::from_millis(250),
        };
        assert_eq!(strategy.delay_for(1), strategy.delay_for(9));
    }

    #[test]
    fn test_policy_cutoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 6);
        assert!(policy.next_delay(5).is_some());
        assert!(policy.next_delay(6).is_none());
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RetryPolicy::new(BackoffStrategy::default(), 0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.next_delay(1).is_none());
    }
}
