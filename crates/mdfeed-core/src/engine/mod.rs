//! The engine: orchestrates planning and the two-phase
//! submit/drain/flush execution across the producer and consumer pools.

pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mdfeed_db::models::TaskType;
use mdfeed_db::Storage;
use tokio_util::sync::CancellationToken;

use crate::consumer::ConsumerPool;
use crate::deadletter::DeadLetterLog;
use crate::fetcher::SharedFetcher;
use crate::producer::ProducerPool;
use crate::progress::{Phase, ProgressSink};
use crate::queue::{DataQueue, TaskQueue};
use crate::task::Task;

use plan::{GroupSpec, Plan, TaskSpec};

const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(30);
/// Business tasks beyond this count add another producer, up to
/// `max_producers`.
const TASKS_PER_PRODUCER: usize = 50;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_producers: usize,
    pub max_consumers: usize,
    pub producer_queue_size: usize,
    pub data_queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_producers: 4,
            max_consumers: 2,
            producer_queue_size: 1000,
            data_queue_size: 1000,
            batch_size: 500,
            flush_interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// The aggregate outcome of one `Engine::run` call, reported back to the
/// caller (CLI exit code, `verify` summary, and so on).
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub total_planned: usize,
    pub processed: u64,
    pub failed: u64,
    pub dropped: usize,
    pub flush_failures: u64,
    pub by_task_type: HashMap<TaskType, u64>,
    pub aborted: bool,
}

/// Owns the long-lived collaborators (storage, fetcher, dead-letter log) and
/// drives one or more runs against them.
pub struct Engine {
    storage: Storage,
    fetcher: SharedFetcher,
    dead_letter: Arc<DeadLetterLog>,
    progress: ProgressSink,
    config: EngineConfig,
}

impl Engine {
    pub fn new(storage: Storage, fetcher: SharedFetcher, dead_letter: Arc<DeadLetterLog>, progress: ProgressSink, config: EngineConfig) -> Self {
        Self { storage, fetcher, dead_letter, progress, config }
    }

    /// Run one full planning + two-phase execution cycle.
    pub async fn run(
        &self,
        task_specs: &[TaskSpec],
        group: &GroupSpec,
        symbols_override: Option<&[String]>,
        force_run: bool,
        cancel: CancellationToken,
    ) -> anyhow::Result<EngineReport> {
        self.progress.phase_start(Phase::Planning, None);
        let planned = plan::plan(&self.storage, task_specs, group, symbols_override, force_run).await?;
        self.progress.phase_end(Phase::Planning);

        let mut report = EngineReport { total_planned: planned.total_planned(), dropped: planned.dropped, ..Default::default() };

        if cancel.is_cancelled() {
            report.aborted = true;
            return Ok(report);
        }

        // Phase 1 — system tasks, producer pool forced to a single worker:
        // these seed the security master that phase 2's symbol resolution
        // may depend on, so they must fully settle first.
        if !planned.system_tasks.is_empty() {
            self.progress.phase_start(Phase::System, Some(planned.system_tasks.len()));
            let phase1 = self.run_phase(planned.system_tasks, 1, &cancel).await?;
            accumulate(&mut report, &phase1);
            self.progress.phase_end(Phase::System);

            if cancel.is_cancelled() {
                report.aborted = true;
                return Ok(report);
            }
        }

        if !planned.business_tasks.is_empty() {
            let producer_workers = self.phase2_producer_count(planned.business_tasks.len());
            self.progress.phase_start(Phase::Business, Some(planned.business_tasks.len()));
            let phase2 = self.run_phase(planned.business_tasks, producer_workers, &cancel).await?;
            accumulate(&mut report, &phase2);
            self.progress.phase_end(Phase::Business);
        }

        report.aborted = cancel.is_cancelled();
        Ok(report)
    }

    fn phase2_producer_count(&self, business_task_count: usize) -> usize {
        let by_load = (business_task_count / TASKS_PER_PRODUCER).max(1);
        by_load.min(self.config.max_producers)
    }

    /// Submit `tasks`, run producers and consumers until both queues drain,
    /// then stop them in the staged order that avoids racing an in-flight
    /// fetch against the drain check: producers are only cancelled once the
    /// task queue alone is empty, and since a producer only checks
    /// cancellation at the top of its loop, any fetch already underway
    /// finishes — including its push onto the data queue — before that
    /// worker exits. Only after every producer has joined do we wait for
    /// the data queue to empty and stop the consumers, triggering their
    /// final force-flush.
    async fn run_phase(&self, tasks: Vec<Task>, producer_workers: usize, cancel: &CancellationToken) -> anyhow::Result<PhaseOutcome> {
        let task_queue = Arc::new(TaskQueue::new(self.config.producer_queue_size));
        let data_queue = Arc::new(DataQueue::new(self.config.data_queue_size));

        let consumer_pool = ConsumerPool::new(
            self.config.max_consumers,
            Arc::clone(&data_queue),
            self.storage.clone(),
            Arc::clone(&self.dead_letter),
            self.progress.clone(),
            self.config.batch_size,
            self.config.flush_interval,
        );
        let producer_pool = ProducerPool::new(
            producer_workers,
            Arc::clone(&task_queue),
            Arc::clone(&data_queue),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.dead_letter),
            self.progress.clone(),
        );

        let producer_cancel = cancel.child_token();
        let consumer_cancel = cancel.child_token();
        let producer_handle = producer_pool.spawn(producer_cancel.clone());
        let consumer_handle = consumer_pool.spawn(consumer_cancel.clone());

        for task in tasks {
            if !task_queue.put(task, ENQUEUE_TIMEOUT).await {
                tracing::error!("task queue rejected submission, producer pool fell behind");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        while !task_queue.is_empty().await && !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        producer_cancel.cancel();
        let producer_stats = producer_handle.stats();
        producer_pool_stop_or_warn(producer_handle.stop(STOP_TIMEOUT).await);

        while !data_queue.is_empty().await && !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        consumer_cancel.cancel();
        let consumer_stats = consumer_handle.stats();
        consumer_pool_stop_or_warn(consumer_handle.stop(STOP_TIMEOUT).await);

        Ok(PhaseOutcome { producer: producer_stats, consumer: consumer_stats })
    }
}

struct PhaseOutcome {
    producer: crate::producer::ProducerStats,
    consumer: crate::consumer::ConsumerStats,
}

fn accumulate(report: &mut EngineReport, outcome: &PhaseOutcome) {
    report.processed += outcome.producer.processed;
    report.failed += outcome.producer.failed;
    report.flush_failures += outcome.consumer.flush_failures;
}

fn producer_pool_stop_or_warn(joined: bool) {
    if !joined {
        tracing::error!("producer pool did not stop within the shutdown timeout");
    }
}

fn consumer_pool_stop_or_warn(joined: bool) {
    if !joined {
        tracing::error!("consumer pool did not stop within the shutdown timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::transport::{RemoteRequest, Transport};
    use crate::fetcher::{Fetcher, RemoteCallError};
    use crate::ratelimit::{RateLimiter, RateRule};
    use crate::retry::{BackoffStrategy, RetryPolicy};
    use async_trait::async_trait;
    use mdfeed_db::models::{RowSet, ScalarValue};

    struct StubTransport;
    #[async_trait]
    impl Transport for StubTransport {
        fn name(&self) -> &str {
            "stub"
        }
        async fn call(&self, req: RemoteRequest) -> Result<RowSet, RemoteCallError> {
            match req.endpoint {
                "stock_basic" => Ok(RowSet::new(
                    vec!["symbol".into(), "name".into()],
                    vec![vec![ScalarValue::Text("600519.SH".into()), ScalarValue::Text("Moutai".into())]],
                )),
                "daily" => Ok(RowSet::new(
                    vec!["symbol".into(), "trade_date".into(), "close".into()],
                    vec![vec![ScalarValue::Text("600519.SH".into()), ScalarValue::Text("20240101".into()), ScalarValue::Real(1.0)]],
                )),
                _ => Ok(RowSet::default()),
            }
        }
    }

    async fn test_engine(dir: &std::path::Path) -> Engine {
        let db_cfg = mdfeed_db::DbConfig::new(dir.join("test.db"));
        let pool = mdfeed_db::pool::create_pool(&db_cfg).await.unwrap();
        mdfeed_db::pool::run_migrations(&pool, mdfeed_db::pool::default_migrations_path()).await.unwrap();
        let storage = Storage::new(pool);

        let fetcher = Arc::new(Fetcher::new(
            Box::new(StubTransport),
            RateLimiter::new(RateRule::new(1000.0, Duration::from_secs(1))),
            RetryPolicy::new(2, BackoffStrategy::Fixed, 0.01, 1.0, 1.0),
        ));
        let dead_letter = Arc::new(DeadLetterLog::new(dir.join("dead_letter.jsonl")));
        let (progress, stream) = crate::progress::channel();
        tokio::spawn(crate::progress::log_delivery_worker(stream));

        let config = EngineConfig {
            max_producers: 2,
            max_consumers: 1,
            producer_queue_size: 100,
            data_queue_size: 100,
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
            max_retries: 3,
        };

        Engine::new(storage, fetcher, dead_letter, progress, config)
    }

    #[tokio::test]
    async fn fresh_run_plans_and_flushes_both_phases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;

        let specs = vec![
            TaskSpec { name: "stock_list".into(), task_type: TaskType::StockList, enabled: true, statement_type: None, adjust: None },
            TaskSpec { name: "daily".into(), task_type: TaskType::Daily, enabled: true, statement_type: None, adjust: None },
        ];
        let group = plan::GroupSpec {
            symbols: plan::SymbolScope::List(vec!["600519".to_string()]),
            task_names: vec!["stock_list".to_string(), "daily".to_string()],
        };

        let report = engine.run(&specs, &group, None, false, CancellationToken::new()).await.unwrap();
        assert_eq!(report.total_planned, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 0);
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn cancelled_before_start_aborts_without_planning_work() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;

        let specs = vec![TaskSpec { name: "daily".into(), task_type: TaskType::Daily, enabled: true, statement_type: None, adjust: None }];
        let group = plan::GroupSpec { symbols: plan::SymbolScope::List(vec!["600519".into()]), task_names: vec!["daily".into()] };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine.run(&specs, &group, None, false, cancel).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.processed, 0);
    }
}
