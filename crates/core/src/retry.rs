//! Retry and backoff policy.
//!
//! Delays grow as `base ^ attempts` seconds with no jitter and no cap other
//! than `u64` saturation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Backoff base used when the queue settings don't override it.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Exponential backoff delay in seconds: `base ^ attempts`.
///
/// `backoff_seconds(2, 3) == 8`.
pub fn backoff_seconds(base: u32, attempts: u32) -> u64 {
    u64::from(base).saturating_pow(attempts)
}

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// Retry budget exhausted; move to the dead-letter state.
    DeadLetter,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given backoff base (must be at least 2).
    pub fn new(base: u32) -> DomainResult<Self> {
        if base < 2 {
            return Err(DomainError::validation(format!(
                "backoff base must be >= 2, got {base}"
            )));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Delay before the next attempt after `attempts` attempts have been made.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        Duration::from_secs(backoff_seconds(self.base, attempts))
    }

    /// Decide the fate of a failed job.
    ///
    /// `attempts` is the count *after* incrementing for the attempt that just
    /// failed. The job is dead-lettered once `attempts > max_retries`.
    pub fn decide(&self, attempts: u32, max_retries: u32) -> RetryDecision {
        if attempts > max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_integer_power() {
        assert_eq!(backoff_seconds(2, 0), 1);
        assert_eq!(backoff_seconds(2, 1), 2);
        assert_eq!(backoff_seconds(2, 2), 4);
        assert_eq!(backoff_seconds(2, 3), 8);
        assert_eq!(backoff_seconds(3, 4), 81);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(backoff_seconds(2, 200), u64::MAX);
    }

    #[test]
    fn base_below_two_is_rejected() {
        assert!(RetryPolicy::new(0).is_err());
        assert!(RetryPolicy::new(1).is_err());
        assert_eq!(RetryPolicy::new(5).unwrap().base(), 5);
    }

    #[test]
    fn dead_letters_on_the_attempt_after_max_retries() {
        let policy = RetryPolicy::default();

        // max_retries = 2: failures 1 and 2 are retried, failure 3 is dead.
        assert_eq!(
            policy.decide(1, 2),
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(2, 2),
            RetryDecision::Retry {
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(policy.decide(3, 2), RetryDecision::DeadLetter);
    }

    #[test]
    fn zero_retries_dead_letters_immediately() {
        assert_eq!(
            RetryPolicy::default().decide(1, 0),
            RetryDecision::DeadLetter
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: delays strictly increase with attempts until saturation.
            #[test]
            fn backoff_is_strictly_monotonic(base in 2u32..16, attempts in 0u32..12) {
                prop_assert!(backoff_seconds(base, attempts + 1) > backoff_seconds(base, attempts));
            }

            /// Property: a job is dead-lettered on exactly the (k+1)-th failure.
            #[test]
            fn dead_letter_threshold_is_exact(max_retries in 0u32..50) {
                let policy = RetryPolicy::default();
                for attempts in 1..=max_retries {
                    let retried = matches!(policy.decide(attempts, max_retries), RetryDecision::Retry { .. });
                    prop_assert!(retried);
                }
                prop_assert_eq!(policy.decide(max_retries + 1, max_retries), RetryDecision::DeadLetter);
            }
        }
    }
}
