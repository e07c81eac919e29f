//! The task model: immutable work descriptors and the batches they
//! produce.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mdfeed_db::models::{Priority, RowSet, StatementType, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A parameter value: a scalar or a small container, matching the
/// "immutable mapping from string to scalar/container" of the data model.
pub type Params = BTreeMap<String, Value>;

/// A single unit of work. Immutable except through [`Task::increment_retry`],
/// which returns a new value rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub symbol: String,
    pub task_type: TaskType,
    pub params: Params,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

/// Sentinel symbol for system-level tasks (STOCK_LIST has no per-symbol
/// scope).
pub const SYSTEM_SYMBOL: &str = "system";

impl Task {
    pub fn new(
        symbol: impl Into<String>,
        task_type: TaskType,
        params: Params,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            task_type,
            params,
            priority,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Pure: returns a new task with `retry_count + 1`. Never mutates self.
    pub fn increment_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    pub fn start_date(&self) -> Option<&str> {
        self.params.get("start_date").and_then(Value::as_str)
    }

    pub fn end_date(&self) -> Option<&str> {
        self.params.get("end_date").and_then(Value::as_str)
    }

    pub fn statement_type(&self) -> Option<StatementType> {
        self.params
            .get("statement_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn adjust(&self) -> Option<&str> {
        self.params.get("adjust").and_then(Value::as_str)
    }
}

/// A result container produced by the producer pool and consumed by the
/// consumer pool.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub batch_id: Uuid,
    pub task_id: Uuid,
    pub symbol: String,
    pub task_type: TaskType,
    pub statement_type: Option<StatementType>,
    pub rows: RowSet,
    pub created_at: DateTime<Utc>,
    /// Set to `true` when the fetch legitimately returned no rows — still
    /// enqueued so counts stay accurate, never retried.
    pub no_data: bool,
}

impl DataBatch {
    pub fn new(task: &Task, rows: RowSet) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            task_id: task.id,
            symbol: task.symbol.clone(),
            task_type: task.task_type,
            statement_type: task.statement_type(),
            no_data: rows.is_empty(),
            rows,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// The accumulator key this batch belongs to, grouping rows destined
    /// for the same consumer flush.
    pub fn partition_key(&self) -> (TaskType, String) {
        (self.task_type, self.symbol.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfeed_db::models::RowSet;

    fn sample_task() -> Task {
        Task::new("600519.SH", TaskType::Daily, Params::new(), Priority::Normal, 3)
    }

    #[test]
    fn increment_retry_does_not_mutate_original() {
        let t = sample_task();
        let t2 = t.increment_retry();
        assert_eq!(t.retry_count, 0);
        assert_eq!(t2.retry_count, 1);
        assert_ne!(t.retry_count, t2.retry_count);
    }

    #[test]
    fn can_retry_respects_max() {
        let mut t = sample_task();
        t.max_retries = 1;
        assert!(t.can_retry());
        t = t.increment_retry();
        assert!(!t.can_retry());
    }

    #[test]
    fn ids_are_fresh_per_task() {
        let a = sample_task();
        let b = sample_task();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn data_batch_partition_key_groups_by_type_and_symbol() {
        let task = sample_task();
        let batch = DataBatch::new(&task, RowSet::default());
        assert_eq!(batch.partition_key(), (TaskType::Daily, "600519.SH".to_string()));
        assert!(batch.is_empty());
        assert!(batch.no_data);
    }
}
