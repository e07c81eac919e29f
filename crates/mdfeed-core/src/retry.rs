//! The retry policy: pure decisions over (error, attempt) pairs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay shape selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// An immutable retry policy value. Three presets ship
/// ([`RetryPolicy::default_policy`], [`RetryPolicy::network`],
/// [`RetryPolicy::api_limit`]); callers may also supply their own.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay: f64,
    pub max_delay: f64,
    pub backoff_factor: f64,
    retryable_patterns: Vec<String>,
    non_retryable_patterns: Vec<String>,
}

fn default_retryable_patterns() -> Vec<String> {
    [
        "connection",
        "timeout",
        "proxyerror",
        "remotedisconnected",
        "connectionerror",
        "httpconnectionpool",
        "readtimeout",
        "connecttimeout",
        "sslerror",
        "chunkedencodingerror",
        "rate limit",
        "quota exceeded",
        "too many requests",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_non_retryable_patterns() -> Vec<String> {
    [
        "invalid parameter",
        "参数无效",
        "参数错误",
        "无法识别",
        "authentication failed",
        "permission denied",
        "unauthorized",
        "400",
        "401",
        "403",
        "404",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff: BackoffStrategy,
        base_delay: f64,
        max_delay: f64,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            backoff,
            base_delay,
            max_delay,
            backoff_factor,
            retryable_patterns: default_retryable_patterns(),
            non_retryable_patterns: default_non_retryable_patterns(),
        }
    }

    pub fn with_patterns(
        mut self,
        retryable: Vec<String>,
        non_retryable: Vec<String>,
    ) -> Self {
        self.retryable_patterns = retryable;
        self.non_retryable_patterns = non_retryable;
        self
    }

    pub fn default_policy() -> Self {
        Self::new(3, BackoffStrategy::Exponential, 1.0, 60.0, 2.0)
    }

    pub fn network() -> Self {
        Self::new(5, BackoffStrategy::Exponential, 0.5, 30.0, 2.0)
    }

    pub fn api_limit() -> Self {
        Self::new(3, BackoffStrategy::Linear, 2.0, 60.0, 1.0)
    }

    /// `attempt` is 1-based, the index of the attempt that just failed.
    pub fn should_retry(&self, error_message: &str, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        let lower = error_message.to_lowercase();

        if self.non_retryable_patterns.iter().any(|p| lower.contains(&p.to_lowercase())) {
            return false;
        }

        self.retryable_patterns.iter().any(|p| lower.contains(&p.to_lowercase()))
    }

    /// `attempt` is 1-based.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let n = attempt as f64;
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * n * self.backoff_factor,
            BackoffStrategy::Exponential => self.base_delay * self.backoff_factor.powf(n - 1.0),
        };
        Duration::from_secs_f64(delay.min(self.max_delay).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_wins_over_retryable_substring() {
        let policy = RetryPolicy::default_policy();
        // Contrived message containing both an (irrelevant) retryable-looking
        // word and a non-retryable pattern; non-retryable must win.
        assert!(!policy.should_retry("Unauthorized: connection refused", 1));
    }

    #[test]
    fn unknown_errors_do_not_retry_by_default() {
        let policy = RetryPolicy::default_policy();
        assert!(!policy.should_retry("something bizarre happened", 1));
    }

    #[test]
    fn retryable_pattern_retries_until_max_attempts() {
        let policy = RetryPolicy::default_policy();
        assert!(policy.should_retry("ConnectionError: reset", 1));
        assert!(policy.should_retry("ConnectionError: reset", 2));
        assert!(!policy.should_retry("ConnectionError: reset", 3));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::new(5, BackoffStrategy::Fixed, 2.0, 60.0, 2.0);
        assert_eq!(policy.get_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(policy.get_delay(4), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn linear_delay_grows_and_clamps() {
        let policy = RetryPolicy::new(10, BackoffStrategy::Linear, 1.0, 5.0, 2.0);
        assert_eq!(policy.get_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(policy.get_delay(2), Duration::from_secs_f64(4.0));
        assert_eq!(policy.get_delay(5), Duration::from_secs_f64(5.0)); // clamped
    }

    #[test]
    fn exponential_delay_doubles_and_clamps() {
        let policy = RetryPolicy::new(10, BackoffStrategy::Exponential, 1.0, 10.0, 2.0);
        assert_eq!(policy.get_delay(1), Duration::from_secs_f64(1.0));
        assert_eq!(policy.get_delay(2), Duration::from_secs_f64(2.0));
        assert_eq!(policy.get_delay(3), Duration::from_secs_f64(4.0));
        assert_eq!(policy.get_delay(5), Duration::from_secs_f64(10.0)); // clamped
    }

    #[test]
    fn delay_is_monotonically_nondecreasing_for_linear_and_exponential() {
        for policy in [
            RetryPolicy::new(20, BackoffStrategy::Linear, 1.0, 1000.0, 1.5),
            RetryPolicy::new(20, BackoffStrategy::Exponential, 1.0, 1000.0, 1.5),
        ] {
            let mut prev = Duration::ZERO;
            for attempt in 1..15 {
                let d = policy.get_delay(attempt);
                assert!(d >= prev);
                prev = d;
            }
        }
    }
}
