//! The dead-letter log: an append-only, JSON-lines record of
//! terminally failed tasks and known-missing symbols.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mdfeed_db::models::{Priority, TaskType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::task::{Params, Task, SYSTEM_SYMBOL};

/// `error_type` assigned to symbols known to be absent from a data table,
/// surfaced by the `verify` reconcile workflow.
pub const MISSING_DATA: &str = "MISSING_DATA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: Uuid,
    pub symbol: String,
    pub task_type: TaskType,
    pub params: Params,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_type: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub original_created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_task(task: &Task, error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            symbol: task.symbol.clone(),
            task_type: task.task_type,
            params: task.params.clone(),
            priority: task.priority,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            error_type: error_type.into(),
            error_message: error_message.into(),
            failed_at: Utc::now(),
            original_created_at: task.created_at,
        }
    }

    /// Convert back into a fresh [`Task`] for a reconcile rerun. Retry count
    /// resets to zero, as the task starts a new lifetime.
    pub fn to_task(&self) -> Task {
        Task {
            id: self.task_id,
            symbol: self.symbol.clone(),
            task_type: self.task_type,
            params: self.params.clone(),
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: self.original_created_at,
        }
    }
}

/// Filter accepted by [`DeadLetterLog::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadFilter {
    pub task_type: Option<TaskType>,
    pub symbol_pattern: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentFailure {
    pub symbol: String,
    pub task_type: TaskType,
    pub error_type: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStatistics {
    pub total_count: usize,
    pub by_task_type: HashMap<String, usize>,
    pub by_error_type: HashMap<String, usize>,
    pub recent_failures: Vec<RecentFailure>,
}

/// Durable, inspectable record of terminally-failed tasks. Writes are
/// serialized by a process-wide mutex for portability.
pub struct DeadLetterLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON line recording `task`'s terminal failure. This is the
    /// single authoritative failure channel: every terminal failure, no
    /// matter the source, ends up here.
    pub async fn write(&self, task: &Task, error_type: &str, error_message: &str) -> Result<()> {
        let record = DeadLetterRecord::from_task(task, error_type, error_message);
        self.append_line(&record).await
    }

    /// Append one record per symbol known to be missing from `task_type`'s
    /// table, with `error_type = MISSING_DATA` and no retry budget.
    pub async fn log_missing_symbols(&self, task_type: TaskType, symbols: &[String]) -> Result<()> {
        if symbols.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        self.ensure_parent_dir().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open dead-letter log {}", self.path.display()))?;

        for symbol in symbols {
            let record = DeadLetterRecord {
                task_id: Uuid::new_v4(),
                symbol: symbol.clone(),
                task_type,
                params: Params::new(),
                priority: Priority::Normal,
                retry_count: 0,
                max_retries: 0,
                error_type: MISSING_DATA.to_string(),
                error_message: format!("symbol {symbol} not found in data source"),
                failed_at: Utc::now(),
                original_created_at: Utc::now(),
            };
            let mut line = serde_json::to_string(&record).context("failed to serialize dead-letter record")?;
            line.push('\n');
            file.write_all(line.as_bytes()).await.context("failed to append dead-letter record")?;
        }
        file.flush().await.context("failed to flush dead-letter log")?;
        Ok(())
    }

    async fn append_line(&self, record: &DeadLetterRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.ensure_parent_dir().await?;

        let mut line = serde_json::to_string(record).context("failed to serialize dead-letter record")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open dead-letter log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await.context("failed to append dead-letter record")?;
        file.flush().await.context("failed to flush dead-letter log")?;
        Ok(())
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
        }
        Ok(())
    }

    /// Parsed records matching `filter`. Missing file reads as empty.
    pub async fn read(&self, filter: &ReadFilter) -> Result<Vec<DeadLetterRecord>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open dead-letter log {}", self.path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await.context("failed to read dead-letter log")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<DeadLetterRecord>(line) else {
                tracing::warn!(line = %line, "skipping invalid dead-letter line");
                continue;
            };

            if let Some(task_type) = filter.task_type {
                if record.task_type != task_type {
                    continue;
                }
            }
            if let Some(pattern) = &filter.symbol_pattern {
                if !record.symbol.contains(pattern.as_str()) {
                    continue;
                }
            }

            records.push(record);

            if let Some(limit) = filter.limit {
                if records.len() >= limit {
                    break;
                }
            }
        }

        Ok(records)
    }

    pub fn convert_to_tasks(records: &[DeadLetterRecord]) -> Vec<Task> {
        records.iter().map(DeadLetterRecord::to_task).collect()
    }

    /// Rewrite the file without the named tasks: copy-remaining-on-write,
    /// via a temp-file-rename for atomicity.
    pub async fn archive(&self, task_ids: &[Uuid]) -> Result<usize> {
        let all = self.read(&ReadFilter::default()).await?;
        let to_drop: std::collections::HashSet<Uuid> = task_ids.iter().copied().collect();
        let (dropped, kept): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|r| to_drop.contains(&r.task_id));

        let tmp_path = self.path.with_extension("jsonl.tmp");
        self.ensure_parent_dir().await?;
        let mut tmp = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
        for record in &kept {
            let mut line = serde_json::to_string(record).context("failed to serialize dead-letter record")?;
            line.push('\n');
            tmp.write_all(line.as_bytes()).await.context("failed to write temp dead-letter file")?;
        }
        tmp.flush().await.context("failed to flush temp dead-letter file")?;
        drop(tmp);

        let _guard = self.write_lock.lock().await;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .context("failed to atomically replace dead-letter log")?;

        Ok(dropped.len())
    }

    pub async fn statistics(&self) -> Result<DeadLetterStatistics> {
        let records = self.read(&ReadFilter::default()).await?;

        if records.is_empty() {
            return Ok(DeadLetterStatistics {
                total_count: 0,
                by_task_type: HashMap::new(),
                by_error_type: HashMap::new(),
                recent_failures: Vec::new(),
            });
        }

        let mut by_task_type: HashMap<String, usize> = HashMap::new();
        let mut by_error_type: HashMap<String, usize> = HashMap::new();
        for record in &records {
            *by_task_type.entry(record.task_type.to_string()).or_default() += 1;
            *by_error_type.entry(record.error_type.clone()).or_default() += 1;
        }

        let mut sorted = records.clone();
        sorted.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        let recent_failures = sorted
            .into_iter()
            .take(10)
            .map(|r| RecentFailure {
                symbol: r.symbol,
                task_type: r.task_type,
                error_type: r.error_type,
                error_message: r.error_message,
                failed_at: r.failed_at,
            })
            .collect();

        Ok(DeadLetterStatistics {
            total_count: records.len(),
            by_task_type,
            by_error_type,
            recent_failures,
        })
    }
}

pub(crate) fn is_system_symbol(symbol: &str) -> bool {
    symbol == SYSTEM_SYMBOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfeed_db::models::TaskType;

    fn sample_task() -> Task {
        Task::new("600519.SH", TaskType::Daily, Params::new(), Priority::Normal, 3)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.jsonl"));
        let task = sample_task();
        log.write(&task, "NetworkError", "boom").await.unwrap();

        let records = log.read(&ReadFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, task.id);
        assert_eq!(records[0].error_type, "NetworkError");
    }

    #[tokio::test]
    async fn read_filters_by_task_type_and_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.jsonl"));
        log.write(&sample_task(), "X", "x").await.unwrap();
        let other = Task::new("000001.SZ", TaskType::DailyBasic, Params::new(), Priority::Normal, 1);
        log.write(&other, "Y", "y").await.unwrap();

        let filtered = log
            .read(&ReadFilter {
                task_type: Some(TaskType::Daily),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].symbol, "600519.SH");
    }

    #[tokio::test]
    async fn log_missing_symbols_uses_missing_data_error_type() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.jsonl"));
        log.log_missing_symbols(TaskType::Daily, &["000002.SZ".to_string()])
            .await
            .unwrap();

        let records = log.read(&ReadFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_type, MISSING_DATA);
        assert_eq!(records[0].max_retries, 0);
    }

    #[tokio::test]
    async fn archive_removes_named_tasks_and_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.jsonl"));
        let a = sample_task();
        let b = Task::new("000001.SZ", TaskType::DailyBasic, Params::new(), Priority::Normal, 1);
        log.write(&a, "X", "x").await.unwrap();
        log.write(&b, "Y", "y").await.unwrap();

        let dropped = log.archive(&[a.id]).await.unwrap();
        assert_eq!(dropped, 1);

        let remaining = log.read(&ReadFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, b.id);
    }

    #[tokio::test]
    async fn statistics_group_by_task_and_error_type() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("dead_letter.jsonl"));
        log.write(&sample_task(), "NetworkError", "a").await.unwrap();
        log.write(&sample_task(), "NetworkError", "b").await.unwrap();
        let other = Task::new("000001.SZ", TaskType::DailyBasic, Params::new(), Priority::Normal, 1);
        log.write(&other, "ServerError", "c").await.unwrap();

        let stats = log.statistics().await.unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.by_error_type.get("NetworkError"), Some(&2));
        assert_eq!(stats.by_task_type.get("daily"), Some(&2));
    }

    #[tokio::test]
    async fn read_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("nope.jsonl"));
        assert!(log.read(&ReadFilter::default()).await.unwrap().is_empty());
    }
}
