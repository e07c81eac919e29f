//! The consumer pool: a fixed-size worker pool that accumulates
//! [`DataBatch`]es per `(task_type, symbol)` and flushes them to storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mdfeed_db::models::{RowSet, ScalarValue, TaskType};
use mdfeed_db::Storage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::deadletter::DeadLetterLog;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::queue::DataQueue;
use crate::retry::RetryPolicy;
use crate::task::{DataBatch, Params, Task};

const DATA_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct WorkerStats {
    flushed_rows: AtomicU64,
    flush_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub flushed_rows: u64,
    pub flush_failures: u64,
}

pub struct ConsumerPool {
    worker_count: usize,
    data_queue: Arc<DataQueue>,
    storage: Storage,
    dead_letter: Arc<DeadLetterLog>,
    progress: ProgressSink,
    batch_size: usize,
    flush_interval: Duration,
    retry_policy: RetryPolicy,
}

impl ConsumerPool {
    pub fn new(
        worker_count: usize,
        data_queue: Arc<DataQueue>,
        storage: Storage,
        dead_letter: Arc<DeadLetterLog>,
        progress: ProgressSink,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            worker_count: worker_count.max(1),
            data_queue,
            storage,
            dead_letter,
            progress,
            batch_size: batch_size.max(1),
            flush_interval,
            retry_policy: RetryPolicy::default_policy(),
        }
    }

    pub fn spawn(&self, cancel: CancellationToken) -> ConsumerHandle {
        let mut handles = Vec::with_capacity(self.worker_count);
        let mut stats = Vec::with_capacity(self.worker_count);

        for worker_id in 0..self.worker_count {
            let worker_stats = Arc::new(WorkerStats::default());
            stats.push(Arc::clone(&worker_stats));

            let data_queue = Arc::clone(&self.data_queue);
            let storage = self.storage.clone();
            let dead_letter = Arc::clone(&self.dead_letter);
            let progress = self.progress.clone();
            let batch_size = self.batch_size;
            let flush_interval = self.flush_interval;
            let retry_policy = self.retry_policy.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    data_queue,
                    storage,
                    dead_letter,
                    progress,
                    batch_size,
                    flush_interval,
                    retry_policy,
                    cancel,
                    worker_stats,
                )
                .await;
            }));
        }

        ConsumerHandle { handles, stats }
    }
}

type PartitionKey = (TaskType, String);

async fn worker_loop(
    worker_id: usize,
    data_queue: Arc<DataQueue>,
    storage: Storage,
    dead_letter: Arc<DeadLetterLog>,
    progress: ProgressSink,
    batch_size: usize,
    flush_interval: Duration,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
) {
    let mut accumulators: HashMap<PartitionKey, Vec<DataBatch>> = HashMap::new();
    let mut last_flush = tokio::time::Instant::now();

    loop {
        let stopping = cancel.is_cancelled() && data_queue.is_empty().await;

        if let Some(batch) = data_queue.get(DATA_POLL_TIMEOUT).await {
            let key = batch.partition_key();
            let entry = accumulators.entry(key.clone()).or_default();
            entry.push(batch);

            if entry.len() >= batch_size {
                if let Some(batches) = accumulators.remove(&key) {
                    flush_one(worker_id, &storage, &dead_letter, &progress, &retry_policy, key, batches, &stats).await;
                }
            }
        }

        if last_flush.elapsed() >= flush_interval || stopping {
            flush_all(worker_id, &storage, &dead_letter, &progress, &retry_policy, &mut accumulators, &stats).await;
            last_flush = tokio::time::Instant::now();
        }

        if stopping {
            break;
        }
    }
}

async fn flush_all(
    worker_id: usize,
    storage: &Storage,
    dead_letter: &DeadLetterLog,
    progress: &ProgressSink,
    retry_policy: &RetryPolicy,
    accumulators: &mut HashMap<PartitionKey, Vec<DataBatch>>,
    stats: &WorkerStats,
) {
    for (key, batches) in accumulators.drain() {
        flush_one(worker_id, storage, dead_letter, progress, retry_policy, key, batches, stats).await;
    }
}

async fn flush_one(
    worker_id: usize,
    storage: &Storage,
    dead_letter: &DeadLetterLog,
    progress: &ProgressSink,
    retry_policy: &RetryPolicy,
    key: PartitionKey,
    batches: Vec<DataBatch>,
    stats: &WorkerStats,
) {
    let (task_type, symbol) = key;
    let non_empty: Vec<&DataBatch> = batches.iter().filter(|b| !b.no_data).collect();
    if non_empty.is_empty() {
        return;
    }

    let rows = merge_and_dedupe(task_type, &non_empty);
    let row_count = rows.len();

    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        let outcome = match task_type {
            TaskType::StockList => storage.save_stock_list(&rows).await,
            TaskType::Daily => storage.save_daily_data(&rows).await,
            TaskType::DailyBasic => storage.save_fundamental_data(&rows).await,
            TaskType::Financials => storage.save_financial_data(&rows).await,
        };

        match outcome {
            Ok(n) => break Ok(n),
            Err(e) => {
                if e.is_transient() && attempt < retry_policy.max_attempts {
                    tokio::time::sleep(retry_policy.get_delay(attempt)).await;
                    continue;
                }
                break Err(e);
            }
        }
    };

    match result {
        Ok(n) => {
            stats.flushed_rows.fetch_add(n, Ordering::Relaxed);
            progress.publish(ProgressEvent::BatchComplete { task_type, count: row_count });
        }
        Err(e) => {
            stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(worker_id, %task_type, symbol, error = %e, "flush failed, dead-lettering contributing tasks");

            let mut seen = std::collections::HashSet::new();
            for batch in &batches {
                if !seen.insert(batch.task_id) {
                    continue;
                }
                let synthetic = Task {
                    id: batch.task_id,
                    symbol: batch.symbol.clone(),
                    task_type: batch.task_type,
                    params: Params::new(),
                    priority: mdfeed_db::models::Priority::Normal,
                    retry_count: 0,
                    max_retries: 0,
                    created_at: batch.created_at,
                };
                if let Err(log_err) = dead_letter.write(&synthetic, "FlushError", &e.to_string()).await {
                    tracing::error!(worker_id, error = %log_err, "failed to record flush-failure dead-letter entry");
                }
            }
        }
    }
}

/// The extra key columns, beyond the partition's fixed symbol, that
/// distinguish rows within one `(task_type, symbol)` accumulator.
fn dedupe_key_columns(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::StockList => &["symbol"],
        TaskType::Daily | TaskType::DailyBasic => &["trade_date"],
        TaskType::Financials => &["ann_date", "end_date"],
    }
}

/// Concatenate every batch's rows onto a shared column superset, then
/// dedupe by natural key, keeping the last occurrence's values.
fn merge_and_dedupe(task_type: TaskType, batches: &[&DataBatch]) -> RowSet {
    let mut columns: Vec<String> = Vec::new();
    for batch in batches {
        for col in &batch.rows.columns {
            if !columns.contains(col) {
                columns.push(col.clone());
            }
        }
    }

    let key_columns = dedupe_key_columns(task_type);
    let key_indices: Vec<Option<usize>> = key_columns.iter().map(|c| columns.iter().position(|col| col == c)).collect();

    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Vec<ScalarValue>> = HashMap::new();
    let mut no_key_rows: Vec<Vec<ScalarValue>> = Vec::new();

    for batch in batches {
        for row in &batch.rows.rows {
            let remapped: Vec<ScalarValue> = columns
                .iter()
                .map(|col| {
                    batch
                        .rows
                        .column_index(col)
                        .and_then(|idx| row.get(idx).cloned())
                        .unwrap_or(ScalarValue::Null)
                })
                .collect();

            if key_indices.iter().all(Option::is_some) {
                let key: String = key_indices
                    .iter()
                    .map(|idx| remapped[idx.unwrap()].as_str().map(str::to_string).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("\u{1}");

                if !by_key.contains_key(&key) {
                    order.push(key.clone());
                }
                by_key.insert(key, remapped);
            } else {
                no_key_rows.push(remapped);
            }
        }
    }

    let mut rows: Vec<Vec<ScalarValue>> = order.into_iter().filter_map(|k| by_key.remove(&k)).collect();
    rows.extend(no_key_rows);

    RowSet::new(columns, rows)
}

pub struct ConsumerHandle {
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
}

impl ConsumerHandle {
    pub async fn stop(self, timeout: Duration) -> bool {
        let join_all = futures::future::join_all(self.handles);
        tokio::time::timeout(timeout, join_all).await.is_ok()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.iter().fold(ConsumerStats::default(), |acc, s| ConsumerStats {
            flushed_rows: acc.flushed_rows + s.flushed_rows.load(Ordering::Relaxed),
            flush_failures: acc.flush_failures + s.flush_failures.load(Ordering::Relaxed),
        })
    }
}
