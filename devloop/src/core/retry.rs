//! Exponential backoff and retryability decisions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry settings around each phase's agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfiguration {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Errors that know whether another attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// What to do after attempt `attempt` (1-based) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Pure backoff calculator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfiguration,
}

impl RetryPolicy {
    pub fn new(config: RetryConfiguration) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-based): initial × multiplier^retry, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let scaled = initial * self.config.backoff_multiplier.powi(retry as i32);
        let capped = scaled.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn decide<E: Retryable + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfiguration {
            max_attempts: 4,
            initial_delay_ms: 100,
            backoff_multiplier: 3.0,
            max_delay_ms: 1_000,
        })
    }

    #[test]
    fn delay_grows_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(300));
        assert_eq!(p.delay_for(2), Duration::from_millis(900));
        assert_eq!(p.delay_for(3), Duration::from_millis(1_000));
    }

    #[test]
    fn retryable_errors_retry_until_max_attempts() {
        let p = policy();
        assert_eq!(
            p.decide(1, &Flaky(true)),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(3, &Flaky(true)),
            RetryDecision::RetryAfter(Duration::from_millis(900))
        );
        assert_eq!(p.decide(4, &Flaky(true)), RetryDecision::GiveUp);
    }

    #[test]
    fn fatal_errors_never_retry() {
        assert_eq!(policy().decide(1, &Flaky(false)), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_max_attempts_still_allows_one_attempt() {
        let p = RetryPolicy::new(RetryConfiguration {
            max_attempts: 0,
            ..RetryConfiguration::default()
        });
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(p.decide(1, &Flaky(true)), RetryDecision::GiveUp);
    }
}
