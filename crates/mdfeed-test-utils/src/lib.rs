//! Shared test utilities for mdfeed integration tests.
//!
//! Provides a temp-file SQLite fixture (no external services required — the
//! storage engine is embedded), a scripted `Transport` fake for exercising
//! the fetcher and producer pool without a network call, and small
//! builders for Task/DataBatch fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mdfeed_core::fetcher::transport::{RemoteRequest, Transport};
use mdfeed_core::fetcher::RemoteCallError;
use mdfeed_core::task::Params;
use mdfeed_db::models::{Priority, RowSet, ScalarValue, TaskType};
use mdfeed_db::{pool, DbConfig, Storage};

/// Open a fresh, migrated SQLite database in a temp directory.
///
/// The returned `TempDir` must be kept alive for as long as `Storage` is
/// used; dropping it deletes the backing file.
pub async fn temp_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().expect("failed to create temp dir for test database");
    let config = DbConfig::new(dir.path().join("test.db"));
    let sqlite_pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");
    pool::run_migrations(&sqlite_pool, pool::default_migrations_path())
        .await
        .expect("failed to migrate test database");
    (dir, Storage::new(sqlite_pool))
}

/// One scripted response or failure for a single endpoint call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Rows(RowSet),
    Fail(String),
}

/// A `Transport` whose responses are scripted per-endpoint in advance,
/// consumed in order; the last scripted response for an endpoint repeats
/// once exhausted. Every call is counted, for asserting retry/backoff
/// behavior without a real network.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<&'static str, Vec<Scripted>>>,
    calls: AtomicUsize,
    calls_by_endpoint: Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for `endpoint`.
    pub fn push_rows(&self, endpoint: &'static str, rows: RowSet) -> &Self {
        self.scripts.lock().unwrap().entry(endpoint).or_default().push(Scripted::Rows(rows));
        self
    }

    /// Queue a failure for `endpoint`; `message` is matched against
    /// retry-policy substring patterns the same way a real error would be.
    pub fn push_failure(&self, endpoint: &'static str, message: impl Into<String>) -> &Self {
        self.scripts.lock().unwrap().entry(endpoint).or_default().push(Scripted::Fail(message.into()));
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls_by_endpoint.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, request: RemoteRequest) -> Result<RowSet, RemoteCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_endpoint.lock().unwrap().entry(request.endpoint).or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(request.endpoint).or_default();
        let next = if queue.len() > 1 { Some(queue.remove(0)) } else { queue.first().cloned() };

        match next {
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Fail(message)) => Err(RemoteCallError::Network(message)),
            None => Ok(RowSet::default()),
        }
    }
}

/// A single-row `daily` response, the shape the real API returns for one
/// trading day.
pub fn daily_row(symbol: &str, trade_date: &str, close: f64) -> RowSet {
    RowSet::new(
        vec!["symbol".into(), "trade_date".into(), "close".into()],
        vec![vec![
            ScalarValue::Text(symbol.to_string()),
            ScalarValue::Text(trade_date.to_string()),
            ScalarValue::Real(close),
        ]],
    )
}

/// A single-row `stock_basic` response.
pub fn stock_list_row(symbol: &str, name: &str, list_date: &str) -> RowSet {
    RowSet::new(
        vec!["symbol".into(), "name".into(), "list_date".into()],
        vec![vec![
            ScalarValue::Text(symbol.to_string()),
            ScalarValue::Text(name.to_string()),
            ScalarValue::Text(list_date.to_string()),
        ]],
    )
}

/// A `Task` fixture with the given symbol/type, default params, NORMAL
/// priority, and 3 retries.
pub fn sample_task(symbol: &str, task_type: TaskType) -> mdfeed_core::task::Task {
    mdfeed_core::task::Task::new(symbol, task_type, Params::new(), Priority::Normal, 3)
}

/// A `Task` fixture carrying a `start_date`/`end_date` params pair, the
/// shape the planner emits for business tasks.
pub fn sample_task_with_range(symbol: &str, task_type: TaskType, start: &str, end: &str) -> mdfeed_core::task::Task {
    let mut params = Params::new();
    params.insert("start_date".to_string(), serde_json::json!(start));
    params.insert("end_date".to_string(), serde_json::json!(end));
    mdfeed_core::task::Task::new(symbol, task_type, params, Priority::Normal, 3)
}
