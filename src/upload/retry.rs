/*!
 * Retry policy for transfer units
 *
 * Delays are computed per attempt; attempt 1 is the first retry. With
 * `ExponentialWithJitter` a random fraction of up to `jitter_factor` of the
 * capped delay is added so concurrent sessions do not retry in lockstep.
 */

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter
    #[default]
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts per transfer unit, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,

    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Policy without delays, for tests and local mirrors
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Calculate delay for a given retry number (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(attempt - 1);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Fixed => self.initial_delay,
        };

        let capped_delay = base_delay.min(self.max_delay);

        let jitter_factor = self.jitter_factor;
        if self.backoff == BackoffStrategy::ExponentialWithJitter && jitter_factor > 0.0 && jitter_factor <= 1.0 {
            let jitter = rand::rng().random_range(0.0..jitter_factor);
            let extra = Duration::try_from_secs_f64(capped_delay.as_secs_f64() * jitter).unwrap_or_default();
            capped_delay.saturating_add(extra)
        } else {
            capped_delay
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential,
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff: BackoffStrategy::Exponential,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.calculate_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_out_of_range_jitter_is_ignored() {
        for jitter_factor in [0.0, f64::INFINITY, f64::NAN, 1e300] {
            let policy = RetryPolicy {
                initial_delay: Duration::from_millis(100),
                jitter_factor,
                ..Default::default()
            };
            assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_toml_fields() {
        let policy: RetryPolicy =
            toml::from_str("max_attempts = 5\ninitial_delay_ms = 250\nbackoff = \"linear\"").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.backoff, BackoffStrategy::Linear);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }
}
