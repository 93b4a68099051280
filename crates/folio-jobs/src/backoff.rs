//! Retry delay policy for failed attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay after every attempt
    Fixed,
    /// `attempts * base`
    Linear,
    /// `2^(attempts - 1) * base`
    #[default]
    Exponential,
}

/// How long a failed job waits before it becomes reservable again.
///
/// `delay_for` never shrinks as `attempts` grows and never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
        }
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base,
            max,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max,
        }
    }

    /// No delay at all; mostly useful in tests.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay after the `attempts`-th failed attempt (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let calculated = match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Linear => self.base.saturating_mul(attempts),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempts - 1);
                self.base.saturating_mul(factor)
            }
        };
        calculated.min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(86_400))
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn any_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Exponential),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Later attempts never wait less than earlier ones
        #[test]
        fn prop_backoff_is_monotonic(
            strategy in any_strategy(),
            base_ms in 0u64..10_000,
            max_ms in 0u64..100_000_000,
            attempts in 1u32..64,
        ) {
            let policy = BackoffPolicy {
                strategy,
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            };
            prop_assert!(policy.delay_for(attempts + 1) >= policy.delay_for(attempts));
        }

        /// Delays are capped at the configured maximum
        #[test]
        fn prop_backoff_capped(strategy in any_strategy(), attempts in 0u32..200) {
            let policy = BackoffPolicy {
                strategy,
                base: Duration::from_secs(5),
                max: Duration::from_secs(3600),
            };
            prop_assert!(policy.delay_for(attempts) <= Duration::from_secs(3600));
        }
    }

    #[test]
    fn exponential_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(86_400));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(40), Duration::from_secs(86_400));
    }

    #[test]
    fn linear_grows_by_base() {
        let policy = BackoffPolicy::linear(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for(9), Duration::from_secs(60));
    }
}
