//! The producer pool: a fixed-size worker pool converting [`Task`]s
//! into [`DataBatch`]es.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::deadletter::DeadLetterLog;
use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::progress::ProgressSink;
use crate::queue::{DataQueue, TaskQueue};
use crate::task::Task;

const TASK_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const DATA_QUEUE_PUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-worker counters, aggregated by [`ProducerHandle::stats`] once the
/// pool stops.
#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Aggregate counters across every worker in the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub processed: u64,
    pub failed: u64,
}

pub struct ProducerPool {
    worker_count: usize,
    task_queue: Arc<TaskQueue>,
    data_queue: Arc<DataQueue>,
    fetcher: Arc<Fetcher>,
    dead_letter: Arc<DeadLetterLog>,
    progress: ProgressSink,
}

impl ProducerPool {
    pub fn new(
        worker_count: usize,
        task_queue: Arc<TaskQueue>,
        data_queue: Arc<DataQueue>,
        fetcher: Arc<Fetcher>,
        dead_letter: Arc<DeadLetterLog>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            worker_count: worker_count.max(1),
            task_queue,
            data_queue,
            fetcher,
            dead_letter,
            progress,
        }
    }

    /// Spawn `worker_count` worker loops. Each polls the task queue with a
    /// short timeout so it notices `cancel` promptly even when idle.
    pub fn spawn(&self, cancel: CancellationToken) -> ProducerHandle {
        let mut handles = Vec::with_capacity(self.worker_count);
        let mut stats = Vec::with_capacity(self.worker_count);

        for worker_id in 0..self.worker_count {
            let worker_stats = Arc::new(WorkerStats::default());
            stats.push(Arc::clone(&worker_stats));

            let task_queue = Arc::clone(&self.task_queue);
            let data_queue = Arc::clone(&self.data_queue);
            let fetcher = Arc::clone(&self.fetcher);
            let dead_letter = Arc::clone(&self.dead_letter);
            let progress = self.progress.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, task_queue, data_queue, fetcher, dead_letter, progress, cancel, worker_stats)
                    .await;
            }));
        }

        ProducerHandle { handles, stats }
    }
}

async fn worker_loop(
    worker_id: usize,
    task_queue: Arc<TaskQueue>,
    data_queue: Arc<DataQueue>,
    fetcher: Arc<Fetcher>,
    dead_letter: Arc<DeadLetterLog>,
    progress: ProgressSink,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
) {
    loop {
        if cancel.is_cancelled() && task_queue.is_empty().await {
            break;
        }

        let Some(task) = task_queue.get(TASK_POLL_TIMEOUT).await else {
            continue;
        };

        progress.publish(crate::progress::ProgressEvent::TaskStart {
            task_id: task.id,
            symbol: Some(task.symbol.clone()),
        });

        match fetcher.dispatch(&task).await {
            Ok(rows) => {
                let count = rows.len();
                let batch = crate::task::DataBatch::new(&task, rows);
                if !data_queue.put(batch, DATA_QUEUE_PUT_TIMEOUT).await {
                    tracing::error!(worker_id, task_id = %task.id, "data queue put timed out, dropping batch");
                }
                stats.processed.fetch_add(1, Ordering::Relaxed);
                progress.publish(crate::progress::ProgressEvent::TaskComplete { task_id: task.id, count });
            }
            Err(err) => {
                handle_failure(worker_id, task, err, &task_queue, &dead_letter, &progress, &stats).await;
            }
        }
    }
}

async fn handle_failure(
    worker_id: usize,
    task: Task,
    err: FetchError,
    task_queue: &TaskQueue,
    dead_letter: &DeadLetterLog,
    progress: &ProgressSink,
    stats: &WorkerStats,
) {
    // A rate-limit wait that exceeded its own cap, or an error the retry
    // policy classifies as non-retryable (invalid parameters, auth
    // failures), is a configuration signal, not a transient failure;
    // retrying it would just fail the same way.
    let policy_allows = !matches!(err, FetchError::RateLimitWait(_))
        && crate::retry::RetryPolicy::default_policy().should_retry(&err.message(), 1);
    let retryable = task.can_retry() && policy_allows;

    if retryable {
        let delay = err
            .period_remaining_secs()
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| crate::retry::RetryPolicy::default_policy().get_delay(task.retry_count + 1));
        tokio::time::sleep(delay).await;

        let retried = task.increment_retry();
        tracing::warn!(worker_id, task_id = %retried.id, attempt = retried.retry_count, error = %err, "retrying task");
        if task_queue.put(retried.clone(), TASK_POLL_TIMEOUT).await {
            return;
        }
        tracing::error!(worker_id, task_id = %retried.id, "task queue full on retry, dead-lettering instead");
        stats.failed.fetch_add(1, Ordering::Relaxed);
        if let Err(log_err) = dead_letter.write(&retried, "QueueFull", "task queue full on retry enqueue").await {
            tracing::error!(worker_id, task_id = %retried.id, error = %log_err, "failed to record dead-letter entry");
        }
        return;
    }

    stats.failed.fetch_add(1, Ordering::Relaxed);
    progress.publish(crate::progress::ProgressEvent::TaskFailed {
        task_id: task.id,
        symbol: Some(task.symbol.clone()),
        count: 0,
        reason: err.message(),
    });

    if let Err(log_err) = dead_letter.write(&task, err.class_name(), &err.message()).await {
        tracing::error!(worker_id, task_id = %task.id, error = %log_err, "failed to record dead-letter entry");
    }
}

/// A handle to a running producer pool.
pub struct ProducerHandle {
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
}

impl ProducerHandle {
    /// Wait for all workers to stop, up to `timeout`. Returns `false` if any
    /// worker is still running when the deadline passes.
    pub async fn stop(self, timeout: Duration) -> bool {
        let join_all = futures::future::join_all(self.handles);
        tokio::time::timeout(timeout, join_all).await.is_ok()
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats.iter().fold(ProducerStats::default(), |acc, s| ProducerStats {
            processed: acc.processed + s.processed.load(Ordering::Relaxed),
            failed: acc.failed + s.failed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mdfeed_db::models::{Priority, RowSet, ScalarValue, TaskType};

    use crate::fetcher::transport::{RemoteRequest, Transport};
    use crate::fetcher::RemoteCallError;
    use crate::ratelimit::{RateLimiter, RateRule};
    use crate::retry::RetryPolicy;

    struct AlwaysOk;
    #[async_trait]
    impl Transport for AlwaysOk {
        fn name(&self) -> &str {
            "always_ok"
        }
        async fn call(&self, _req: RemoteRequest) -> Result<RowSet, RemoteCallError> {
            Ok(RowSet::new(vec!["symbol".into()], vec![vec![ScalarValue::Text("600519.SH".into())]]))
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl Transport for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        async fn call(&self, _req: RemoteRequest) -> Result<RowSet, RemoteCallError> {
            Err(RemoteCallError::Business("invalid parameter: bad symbol".to_string()))
        }
    }

    fn fetcher(transport: Box<dyn Transport>) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(
            transport,
            RateLimiter::new(RateRule::new(1000.0, Duration::from_secs(1))),
            RetryPolicy::new(1, crate::retry::BackoffStrategy::Fixed, 0.001, 1.0, 1.0),
        ))
    }

    #[tokio::test]
    async fn successful_fetch_enqueues_a_data_batch() {
        let dir = tempfile::tempdir().unwrap();
        let task_queue = Arc::new(TaskQueue::new(10));
        let data_queue = Arc::new(DataQueue::new(10));
        let dead_letter = Arc::new(DeadLetterLog::new(dir.path().join("dead_letter.jsonl")));
        let (progress, _stream) = crate::progress::channel();

        let pool = ProducerPool::new(1, Arc::clone(&task_queue), Arc::clone(&data_queue), fetcher(Box::new(AlwaysOk)), dead_letter, progress);
        let cancel = CancellationToken::new();

        task_queue
            .put(Task::new("600519.SH", TaskType::StockList, Default::default(), Priority::Normal, 3), Duration::from_secs(1))
            .await;

        let handle = pool.spawn(cancel.clone());
        let batch = tokio::time::timeout(Duration::from_secs(2), data_queue.get(Duration::from_secs(2))).await.unwrap();
        assert!(batch.is_some());

        cancel.cancel();
        assert!(handle.stop(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_dead_lettered() {
        let dir = tempfile::tempdir().unwrap();
        let task_queue = Arc::new(TaskQueue::new(10));
        let data_queue = Arc::new(DataQueue::new(10));
        let dead_letter = Arc::new(DeadLetterLog::new(dir.path().join("dead_letter.jsonl")));
        let (progress, _stream) = crate::progress::channel();

        let pool = ProducerPool::new(1, Arc::clone(&task_queue), Arc::clone(&data_queue), fetcher(Box::new(AlwaysFails)), Arc::clone(&dead_letter), progress);
        let cancel = CancellationToken::new();

        task_queue
            .put(Task::new("600519.SH", TaskType::StockList, Default::default(), Priority::Normal, 3), Duration::from_secs(1))
            .await;

        let handle = pool.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.stop(Duration::from_secs(2)).await;

        let records = dead_letter.read(&crate::deadletter::ReadFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
