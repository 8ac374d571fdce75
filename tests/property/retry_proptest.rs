//! Property-based tests for backoff

use proptest::prelude::*;
use std::time::Duration;
use xfsync::offline::{BackoffStrategy, RetryPolicy};

proptest! {
    #[test]
    fn test_exponential_delay_grows_and_stays_capped(
        base_ms in 1u64..5_000,
        factor in 1.0f64..4.0,
        max_ms in 1u64..120_000,
    ) {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_millis(base_ms),
            factor,
            max: Duration::from_millis(max_ms),
        };
        let delays: Vec<_> = (1..=40).map(|n| strategy.delay_for(n)).collect();
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        prop_assert!(delays.iter().all(|d| *d <= Duration::from_millis(max_ms)));
    }

    #[test]
    fn test_policy_stops_at_max_attempts(max_attempts in 1u32..20) {
        let policy = RetryPolicy::new(BackoffStrategy::exponential_default(), max_attempts);
        for attempts in 1..max_attempts {
            prop_assert!(policy.next_delay(attempts).is_some());
        }
        prop_assert!(policy.next_delay(max_attempts).is_none());
    }
}
