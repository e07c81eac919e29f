//! The rate limiter: per-endpoint token buckets with blocking,
//! non-spinning acquisition.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::RateLimitError;

/// A call-rate ceiling: `capacity` tokens refilling continuously over
/// `period`.
#[derive(Debug, Clone, Copy)]
pub struct RateRule {
    pub capacity: f64,
    pub period: Duration,
}

impl RateRule {
    pub fn new(capacity: f64, period: Duration) -> Self {
        Self { capacity, period }
    }

    /// The default ceiling: 190 calls per 60 seconds.
    pub fn default_rule() -> Self {
        Self::new(190.0, Duration::from_secs(60))
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.capacity / self.period.as_secs_f64()
    }
}

struct Bucket {
    rule: RateRule,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rule: RateRule) -> Self {
        Self {
            tokens: rule.capacity,
            rule,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let added = elapsed * self.rule.refill_rate_per_sec();
            self.tokens = (self.tokens + added).min(self.rule.capacity);
            self.last_refill = now;
        }
    }
}

/// Keyed token buckets, one per endpoint name, each guarded independently.
/// Two endpoints with identical quotas still consume independent budgets.
pub struct RateLimiter {
    default_rule: RateRule,
    overrides: HashMap<String, RateRule>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(default_rule: RateRule) -> Self {
        Self {
            default_rule,
            overrides: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_override(mut self, endpoint: impl Into<String>, rule: RateRule) -> Self {
        self.overrides.insert(endpoint.into(), rule);
        self
    }

    fn rule_for(&self, endpoint: &str) -> RateRule {
        self.overrides.get(endpoint).copied().unwrap_or(self.default_rule)
    }

    /// Debit `weight` tokens from `endpoint`'s bucket, blocking cooperatively
    /// until enough tokens are available. `max_delay`, if given, bounds how
    /// long the caller is willing to wait before receiving
    /// [`RateLimitError::WaitTooLong`] instead.
    pub async fn acquire(
        &self,
        endpoint: &str,
        weight: f64,
        max_delay: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets
                    .entry(endpoint.to_string())
                    .or_insert_with(|| Bucket::new(self.rule_for(endpoint)));

                let now = Instant::now();
                bucket.refill(now);

                if bucket.tokens >= weight {
                    bucket.tokens -= weight;
                    return Ok(());
                }

                let deficit = weight - bucket.tokens;
                let wait_secs = deficit / bucket.rule.refill_rate_per_sec();
                Duration::from_secs_f64(wait_secs.max(0.0))
            };

            if let Some(max) = max_delay {
                if wait > max {
                    return Err(RateLimitError::WaitTooLong {
                        endpoint: endpoint.to_string(),
                        max_delay_secs: max.as_secs_f64(),
                    });
                }
            }

            tokio::time::sleep(wait).await;
        }
    }
}
