//! The fetcher: a thin, typed facade over the remote API, with explicit
//! middleware layering: `retry(policy, () => limiter.acquire then
//! transport.call)`.

pub mod normalize;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use mdfeed_db::models::RowSet;
use thiserror::Error;
use tracing::warn;

use crate::error::FetchError;
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::task::Task;
use transport::{RemoteRequest, Transport};

/// Failures a [`Transport`] can report, before retry/rate-limit
/// classification is applied.
#[derive(Debug, Error, Clone)]
pub enum RemoteCallError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("api business error: {0}")]
    Business(String),

    #[error("rate limit exceeded, retry after {period_remaining_secs}s")]
    RateLimitExceeded { period_remaining_secs: f64 },
}

impl RemoteCallError {
    fn period_remaining_secs(&self) -> Option<f64> {
        match self {
            Self::RateLimitExceeded { period_remaining_secs } => Some(*period_remaining_secs),
            _ => None,
        }
    }
}

impl From<RemoteCallError> for FetchError {
    fn from(e: RemoteCallError) -> Self {
        match e {
            RemoteCallError::Network(m) => FetchError::Network(m),
            RemoteCallError::Server { status, message } => FetchError::Server { status, message },
            RemoteCallError::Business(m) => FetchError::Other(m),
            RemoteCallError::RateLimitExceeded { period_remaining_secs } => {
                FetchError::RateLimitExceeded {
                    endpoint: String::new(),
                    period_remaining_secs,
                }
            }
        }
    }
}

/// A thin wrapper over a date-range adjustment mode (`qfq`/`hfq`/`none`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjust {
    None,
    Forward,
    Backward,
}

impl Adjust {
    fn as_param(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Forward => "qfq",
            Self::Backward => "hfq",
        }
    }
}

/// One method per logical endpoint, each guarded by the rate limiter and
/// retry policy, with exactly one instance shared by every producer worker —
/// callers hold an `Arc<Fetcher>`.
pub struct Fetcher {
    transport: Box<dyn Transport>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    max_wait: Option<Duration>,
}

impl Fetcher {
    pub fn new(transport: Box<dyn Transport>, limiter: RateLimiter, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub async fn fetch_stock_list(&self) -> Result<RowSet, FetchError> {
        self.invoke("stock_basic", RemoteRequest { endpoint: "stock_basic", params: vec![] })
            .await
    }

    pub async fn fetch_daily_history(
        &self,
        symbol: &str,
        start: &str,
        end: &str,
        adjust: Adjust,
    ) -> Result<RowSet, FetchError> {
        let symbol = normalize::normalize(symbol).map_err(|e| FetchError::InvalidParameter(e.to_string()))?;
        let rows = self
            .invoke(
                "daily",
                RemoteRequest {
                    endpoint: "daily",
                    params: vec![
                        ("ts_code", symbol),
                        ("start_date", start.to_string()),
                        ("end_date", end.to_string()),
                        ("adjust", adjust.as_param().to_string()),
                    ],
                },
            )
            .await?;

        // Known upstream quirk: a null response for a long range is not a
        // failure, just an empty result.
        if rows.is_empty() && range_days(start, end) > 7 {
            warn!(start, end, "long-range daily fetch returned no rows");
        }
        Ok(rows)
    }

    pub async fn fetch_daily_basic(&self, symbol: &str, start: &str, end: &str) -> Result<RowSet, FetchError> {
        let symbol = normalize::normalize(symbol).map_err(|e| FetchError::InvalidParameter(e.to_string()))?;
        self.invoke(
            "daily_basic",
            RemoteRequest {
                endpoint: "daily_basic",
                params: vec![
                    ("ts_code", symbol),
                    ("start_date", start.to_string()),
                    ("end_date", end.to_string()),
                ],
            },
        )
        .await
    }

    pub async fn fetch_income(&self, symbol: &str, start: &str, end: &str) -> Result<RowSet, FetchError> {
        self.fetch_statement("income", symbol, start, end).await
    }

    pub async fn fetch_balancesheet(&self, symbol: &str, start: &str, end: &str) -> Result<RowSet, FetchError> {
        self.fetch_statement("balancesheet", symbol, start, end).await
    }

    pub async fn fetch_cashflow(&self, symbol: &str, start: &str, end: &str) -> Result<RowSet, FetchError> {
        self.fetch_statement("cashflow", symbol, start, end).await
    }

    async fn fetch_statement(
        &self,
        endpoint: &'static str,
        symbol: &str,
        start: &str,
        end: &str,
    ) -> Result<RowSet, FetchError> {
        let symbol = normalize::normalize(symbol).map_err(|e| FetchError::InvalidParameter(e.to_string()))?;
        self.invoke(
            endpoint,
            RemoteRequest {
                endpoint,
                params: vec![
                    ("ts_code", symbol),
                    ("start_date", start.to_string()),
                    ("end_date", end.to_string()),
                ],
            },
        )
        .await
    }

    /// Route a [`Task`] to its matching endpoint method.
    pub async fn dispatch(&self, task: &Task) -> Result<RowSet, FetchError> {
        use mdfeed_db::models::{StatementType, TaskType};

        match task.task_type {
            TaskType::StockList => self.fetch_stock_list().await,
            TaskType::Daily => {
                let adjust = match task.adjust() {
                    Some("qfq") => Adjust::Forward,
                    Some("hfq") => Adjust::Backward,
                    _ => Adjust::None,
                };
                self.fetch_daily_history(
                    &task.symbol,
                    task.start_date().unwrap_or_default(),
                    task.end_date().unwrap_or_default(),
                    adjust,
                )
                .await
            }
            TaskType::DailyBasic => {
                self.fetch_daily_basic(
                    &task.symbol,
                    task.start_date().unwrap_or_default(),
                    task.end_date().unwrap_or_default(),
                )
                .await
            }
            TaskType::Financials => {
                let statement = task.statement_type().unwrap_or(StatementType::Income);
                let (start, end) = (task.start_date().unwrap_or_default(), task.end_date().unwrap_or_default());
                match statement {
                    StatementType::Income => self.fetch_income(&task.symbol, start, end).await,
                    StatementType::Balancesheet => self.fetch_balancesheet(&task.symbol, start, end).await,
                    StatementType::Cashflow => self.fetch_cashflow(&task.symbol, start, end).await,
                }
            }
        }
    }

    /// The explicit middleware composition:
    /// `retry(policy, () => limiter.acquire(endpoint) then transport.call(endpoint, args))`.
    async fn invoke(&self, bucket: &str, request: RemoteRequest) -> Result<RowSet, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            self.limiter
                .acquire(bucket, 1.0, self.max_wait)
                .await
                .map_err(FetchError::from)?;

            match self.transport.call(request.clone()).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(FetchError::from(err));
                    }

                    if let Some(period) = err.period_remaining_secs() {
                        tokio::time::sleep(Duration::from_secs_f64(period)).await;
                        continue;
                    }

                    let message = err.to_string();
                    if self.policy.should_retry(&message, attempt) {
                        tokio::time::sleep(self.policy.get_delay(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::from(err));
                }
            }
        }
    }
}

fn range_days(start: &str, end: &str) -> i64 {
    use chrono::NaiveDate;
    let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    match (parse(start), parse(end)) {
        (Some(a), Some(b)) => (b - a).num_days(),
        _ => 0,
    }
}

/// A process-wide handle to the single [`Fetcher`] instance. Multiple
/// `Fetcher` instances would fragment the rate-limit budget held inside
/// [`RateLimiter`]; the engine constructs exactly one and shares it.
pub type SharedFetcher = Arc<Fetcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateRule;
    use async_trait::async_trait;
    use mdfeed_db::models::ScalarValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        attempts: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, _request: RemoteRequest) -> Result<RowSet, RemoteCallError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(RemoteCallError::Network("ConnectionError: reset".to_string()));
            }
            Ok(RowSet::new(vec!["symbol".into()], vec![vec![ScalarValue::Text("600519.SH".into())]]))
        }
    }

    fn fetcher(fail_times: usize) -> Fetcher {
        let transport = Box::new(ScriptedTransport {
            attempts: AtomicUsize::new(0),
            fail_times,
        });
        Fetcher::new(
            transport,
            RateLimiter::new(RateRule::new(1000.0, Duration::from_secs(1))),
            RetryPolicy::new(3, crate::retry::BackoffStrategy::Fixed, 0.001, 1.0, 1.0),
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let f = fetcher(2);
        let rows = f.fetch_stock_list().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_fetch_error() {
        let f = fetcher(10);
        let result = f.fetch_stock_list().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_symbol_fails_normalization_before_any_call() {
        let f = fetcher(0);
        let result = f.fetch_daily_history("NOTASYMBOL", "20240101", "20240102", Adjust::None).await;
        assert!(matches!(result, Err(FetchError::InvalidParameter(_))));
    }
}
