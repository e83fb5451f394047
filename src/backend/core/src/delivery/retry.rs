//! Bounded retry with backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::consumers::ConsumeError;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating redelivery delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
    /// Exponential with random jitter
    ExponentialWithJitter {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { initial, increment } => {
                initial.saturating_add(increment.saturating_mul(attempt))
            }
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => exponential(*initial, *max, *multiplier, attempt),
            Self::ExponentialWithJitter {
                initial,
                max,
                multiplier,
                jitter_factor,
            } => {
                let capped = exponential(*initial, *max, *multiplier, attempt).as_secs_f64();
                // delay * (1 +/- jitter_factor * random)
                let jitter = (rand_simple() * 2.0 - 1.0) * capped * jitter_factor;
                Duration::from_secs_f64((capped + jitter).max(0.001))
            }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential() -> Self {
        Self::default()
    }

    pub fn exponential_with_jitter() -> Self {
        Self::ExponentialWithJitter {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

fn exponential(initial: Duration, max: Duration, multiplier: f64, attempt: u32) -> Duration {
    let secs = initial.as_secs_f64() * multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Simple pseudo-random number generator for jitter (0.0 to 1.0).
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How many times a failed delivery is attempted, and how far apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first (0 behaves like 1)
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that dead-letters on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a delivery that failed on attempt `attempt` (1-based) with
    /// `error` should be redelivered.
    pub fn should_retry(&self, attempt: u32, error: &ConsumeError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before redelivering after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_default_is_exponential_from_half_a_second() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        // Should cap at max
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial: Duration::from_secs(5),
            increment: Duration::from_secs(3),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(11));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let backoff = BackoffStrategy::exponential_with_jitter();
        for _ in 0..50 {
            let delay = backoff.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(1599), "{delay:?}");
            assert!(delay <= Duration::from_millis(2401), "{delay:?}");
        }
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::with_attempts(3);
        let premature = ConsumeError::premature("issue i1", "v1");
        let business = ConsumeError::membership("already a member");

        assert!(policy.should_retry(1, &premature));
        assert!(policy.should_retry(2, &premature));
        assert!(!policy.should_retry(3, &premature)); // budget spent
        assert!(!policy.should_retry(1, &business));
        assert!(!RetryPolicy::no_retry().should_retry(1, &premature));
    }

    #[test]
    fn test_policy_from_config_text() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "backoff": {"strategy": "fixed", "delay": "250ms"}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
    }
}
