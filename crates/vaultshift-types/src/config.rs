//! Configuration types for vaultshift
//!
//! Validated value types shared by the configuration layer and the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of concurrent copy workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Minimum worker count
    pub const MIN: usize = 1;
    /// Maximum worker count
    pub const MAX: usize = 50;
    /// Default worker count
    pub const DEFAULT: usize = 10;

    /// Create a new worker count with validation
    pub fn new(count: usize) -> Result<Self, String> {
        if count < Self::MIN {
            Err(format!("Worker count {} is below minimum {}", count, Self::MIN))
        } else if count > Self::MAX {
            Err(format!("Worker count {} exceeds maximum {}", count, Self::MAX))
        } else {
            Ok(Self(count))
        }
    }

    /// Get the worker count value
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for WorkerCount {
    type Error = String;

    fn try_from(count: usize) -> Result<Self, Self::Error> {
        Self::new(count)
    }
}

impl From<WorkerCount> for usize {
    fn from(count: WorkerCount) -> Self {
        count.0
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, String> {
        if max_attempts == 0 {
            return Err("At least one attempt is required".to_string());
        }
        if backoff_multiplier < 1.0 {
            return Err("Backoff multiplier must be at least 1.0".to_string());
        }
        if initial_delay > max_delay {
            return Err("Initial delay cannot be greater than max delay".to_string());
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
        })
    }

    /// Delay to wait after the given number of failed attempts (1-based)
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(30) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(10, true)]
    #[case(50, true)]
    #[case(51, false)]
    fn test_worker_count_bounds(#[case] count: usize, #[case] valid: bool) {
        assert_eq!(WorkerCount::new(count).is_ok(), valid);
    }

    #[test]
    fn test_worker_count_deserialize_validates() {
        assert!(serde_json::from_str::<WorkerCount>("12").is_ok());
        assert!(serde_json::from_str::<WorkerCount>("0").is_err());
        assert!(serde_json::from_str::<WorkerCount>("51").is_err());
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_after(1), Duration::from_secs(1));
        assert_eq!(retry.delay_after(2), Duration::from_secs(2));
        assert_eq!(retry.delay_after(3), Duration::from_secs(4));
        assert_eq!(retry.delay_after(10), Duration::from_secs(60));
        assert_eq!(retry.delay_after(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_config_validation() {
        let second = Duration::from_secs(1);
        assert!(RetryConfig::new(0, second, second, 2.0).is_err());
        assert!(RetryConfig::new(3, second, second, 0.5).is_err());
        assert!(RetryConfig::new(3, second * 2, second, 2.0).is_err());
        assert!(RetryConfig::new(3, second, second * 60, 2.0).is_ok());
    }

    #[test]
    fn test_allows_another() {
        let retry = RetryConfig::default();
        assert!(retry.allows_another(2));
        assert!(!retry.allows_another(3));
    }
}
