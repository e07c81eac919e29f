//! The `run` subcommand: load config, resolve a group, execute the engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mdfeed_core::deadletter::DeadLetterLog;
use mdfeed_core::engine::{Engine, EngineConfig};
use mdfeed_core::fetcher::transport::ReqwestTransport;
use mdfeed_core::fetcher::Fetcher;
use mdfeed_core::progress;
use mdfeed_core::ratelimit::{RateLimiter, RateRule};
use mdfeed_core::retry::RetryPolicy;
use mdfeed_db::{pool, DbConfig, Storage};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigFile;

const TUSHARE_BASE_URL: &str = "http://api.tushare.pro";
const DEAD_LETTER_PATH: &str = "logs/dead_letter.jsonl";

pub async fn run(config_path: &Path, group_name: &str, symbols_override: Option<Vec<String>>, force: bool) -> Result<()> {
    let config_file = ConfigFile::load(config_path)?;
    let token = config_file.resolve_token()?;
    let group = config_file.group_spec(group_name)?;
    let task_specs = config_file.task_specs()?;

    let db_config = DbConfig::new(config_file.database_path());
    let sqlite_pool = pool::create_pool(&db_config).await.context("failed to open database")?;
    pool::run_migrations(&sqlite_pool, pool::default_migrations_path())
        .await
        .context("failed to run migrations")?;
    let storage = Storage::new(sqlite_pool);

    let transport = Box::new(ReqwestTransport::new(TUSHARE_BASE_URL, token));
    let limiter = RateLimiter::new(RateRule::default_rule());
    let fetcher = Arc::new(Fetcher::new(transport, limiter, RetryPolicy::default_policy()).with_max_wait(Duration::from_secs(120)));

    let dead_letter = Arc::new(DeadLetterLog::new(DEAD_LETTER_PATH));

    let (progress_sink, progress_stream) = progress::channel();
    let delivery = tokio::spawn(progress::log_delivery_worker(progress_stream));

    let engine_config = EngineConfig {
        max_producers: config_file.downloader.max_producers,
        max_consumers: config_file.downloader.max_consumers,
        producer_queue_size: config_file.downloader.producer_queue_size,
        data_queue_size: config_file.downloader.data_queue_size,
        batch_size: config_file.consumer.batch_size,
        flush_interval: config_file.consumer.flush_interval(),
        max_retries: config_file.consumer.max_retries,
    };

    let engine = Engine::new(storage, fetcher, Arc::clone(&dead_letter), progress_sink.clone(), engine_config);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, finishing in-flight work before shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    let report = engine.run(&task_specs, &group, symbols_override.as_deref(), force, cancel).await?;

    drop(progress_sink);
    let _ = delivery.await;

    tracing::info!(
        planned = report.total_planned,
        processed = report.processed,
        failed = report.failed,
        dropped = report.dropped,
        flush_failures = report.flush_failures,
        aborted = report.aborted,
        "run complete"
    );

    if report.failed > 0 || report.flush_failures > 0 {
        tracing::warn!(
            dead_letter_log = %dead_letter.path().display(),
            "some tasks failed; see the dead-letter log for reconcile candidates"
        );
    }

    Ok(())
}
