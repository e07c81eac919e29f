//! The planning algorithm: turns a declarative job into a concrete set of
//! [`Task`]s with incremental date ranges.

use std::collections::HashMap;

use chrono::Utc;
use mdfeed_db::models::{Priority, StatementType, TaskType};
use mdfeed_db::Storage;
use serde_json::json;

use crate::fetcher::normalize;
use crate::task::{Params, Task, SYSTEM_SYMBOL};

/// The earliest feasible market date, used whenever no watermark exists or
/// `force_run` is set.
pub const EARLIEST_DATE: &str = "19901219";

/// One configured task within a group: a task type plus its static params.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub task_type: TaskType,
    pub enabled: bool,
    pub statement_type: Option<StatementType>,
    pub adjust: Option<String>,
}

/// The symbol scope of a group: an explicit list, or the `all` sentinel
/// resolved against the security master.
#[derive(Debug, Clone)]
pub enum SymbolScope {
    List(Vec<String>),
    All,
}

/// A declarative job: the symbol scope plus the task specs to run against
/// it.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub symbols: SymbolScope,
    pub task_names: Vec<String>,
}

/// The resolved output of planning: tasks partitioned by phase.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub system_tasks: Vec<Task>,
    pub business_tasks: Vec<Task>,
    /// Planned-but-dropped count (start date after end date), tracked so
    /// `processed + failed + dropped == planned` always holds.
    pub dropped: usize,
}

impl Plan {
    pub fn total_planned(&self) -> usize {
        self.system_tasks.len() + self.business_tasks.len() + self.dropped
    }
}

/// Compute a `(start, end)` date range for one `(task-spec, symbol)` pair,
/// or `None` if the range is empty and the task should be dropped.
pub fn compute_range(force_run: bool, watermark: Option<&str>, today: &str) -> Option<(String, String)> {
    let start = if force_run {
        EARLIEST_DATE.to_string()
    } else if let Some(w) = watermark {
        next_day(w)
    } else {
        EARLIEST_DATE.to_string()
    };

    if start.as_str() > today {
        return None;
    }

    Some((start, today.to_string()))
}

fn next_day(date: &str) -> String {
    use chrono::NaiveDate;
    match NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) => (d + chrono::Duration::days(1)).format("%Y%m%d").to_string(),
        Err(_) => EARLIEST_DATE.to_string(),
    }
}

fn today_utc() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

/// Run the planning algorithm against `storage`.
///
/// `task_specs` is the full configured catalog; `group` selects which
/// specs (by name) and which symbols apply to this run. `symbols_override`
/// takes precedence over `group.symbols` (a CLI `--symbols` flag).
pub async fn plan(
    storage: &Storage,
    task_specs: &[TaskSpec],
    group: &GroupSpec,
    symbols_override: Option<&[String]>,
    force_run: bool,
) -> anyhow::Result<Plan> {
    let selected: Vec<&TaskSpec> = task_specs
        .iter()
        .filter(|s| s.enabled && group.task_names.iter().any(|n| n == &s.name))
        .collect();

    let (system_specs, business_specs): (Vec<&TaskSpec>, Vec<&TaskSpec>) =
        selected.into_iter().partition(|s| s.task_type.is_system());

    let mut plan = Plan::default();

    for spec in &system_specs {
        plan.system_tasks.push(Task::new(
            SYSTEM_SYMBOL,
            spec.task_type,
            Params::new(),
            Priority::High,
            3,
        ));
    }

    if business_specs.is_empty() {
        return Ok(plan);
    }

    let symbols = resolve_symbols(storage, group, symbols_override).await?;
    if symbols.is_empty() {
        tracing::warn!("symbol scope resolved to zero symbols, no business tasks planned");
        return Ok(plan);
    }

    let today = today_utc();

    for spec in &business_specs {
        // One watermark query per task-spec, not per symbol.
        let watermarks: HashMap<String, String> = storage.batch_get_latest_dates(spec.task_type, &symbols).await?;

        for symbol in &symbols {
            let range = compute_range(force_run, watermarks.get(symbol).map(String::as_str), &today);
            let Some((start, end)) = range else {
                plan.dropped += 1;
                continue;
            };

            let mut params = Params::new();
            params.insert("start_date".to_string(), json!(start));
            params.insert("end_date".to_string(), json!(end));
            if let Some(statement_type) = spec.statement_type {
                params.insert("statement_type".to_string(), json!(statement_type.to_string()));
            }
            if let Some(adjust) = &spec.adjust {
                params.insert("adjust".to_string(), json!(adjust));
            }

            plan.business_tasks.push(Task::new(symbol.clone(), spec.task_type, params, Priority::Normal, 3));
        }
    }

    Ok(plan)
}

async fn resolve_symbols(
    storage: &Storage,
    group: &GroupSpec,
    symbols_override: Option<&[String]>,
) -> anyhow::Result<Vec<String>> {
    let raw: Vec<String> = if let Some(overridden) = symbols_override {
        overridden.to_vec()
    } else {
        match &group.symbols {
            SymbolScope::List(list) => list.clone(),
            SymbolScope::All => storage.get_all_stock_codes().await?,
        }
    };

    let mut normalized = Vec::with_capacity(raw.len());
    for symbol in raw {
        match normalize::normalize(&symbol) {
            Ok(n) => normalized.push(n),
            Err(e) => tracing::warn!(symbol, error = %e, "dropping unnormalizable symbol from plan"),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_run_always_starts_at_earliest_date() {
        let range = compute_range(true, Some("20240101"), "20240201");
        assert_eq!(range, Some((EARLIEST_DATE.to_string(), "20240201".to_string())));
    }

    #[test]
    fn watermark_advances_start_by_one_day() {
        let range = compute_range(false, Some("20240110"), "20240201");
        assert_eq!(range, Some(("20240111".to_string(), "20240201".to_string())));
    }

    #[test]
    fn no_watermark_falls_back_to_earliest_date() {
        let range = compute_range(false, None, "20240201");
        assert_eq!(range, Some((EARLIEST_DATE.to_string(), "20240201".to_string())));
    }

    #[test]
    fn start_after_end_drops_the_task() {
        let range = compute_range(false, Some("20240201"), "20240201");
        assert_eq!(range, None);
    }

    #[tokio::test]
    async fn plan_partitions_system_and_business_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mdfeed_db::DbConfig::new(dir.path().join("test.db"));
        let pool = mdfeed_db::pool::create_pool(&cfg).await.unwrap();
        mdfeed_db::pool::run_migrations(&pool, mdfeed_db::pool::default_migrations_path()).await.unwrap();
        let storage = Storage::new(pool);

        let specs = vec![
            TaskSpec { name: "stock_list".into(), task_type: TaskType::StockList, enabled: true, statement_type: None, adjust: None },
            TaskSpec { name: "daily".into(), task_type: TaskType::Daily, enabled: true, statement_type: None, adjust: None },
        ];
        let group = GroupSpec {
            symbols: SymbolScope::List(vec!["600519".to_string()]),
            task_names: vec!["stock_list".to_string(), "daily".to_string()],
        };

        let plan = plan(&storage, &specs, &group, None, false).await.unwrap();
        assert_eq!(plan.system_tasks.len(), 1);
        assert_eq!(plan.business_tasks.len(), 1);
        assert_eq!(plan.business_tasks[0].symbol, "600519.SH");
        assert_eq!(plan.total_planned(), 2);
    }

    #[tokio::test]
    async fn disabled_task_specs_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = mdfeed_db::DbConfig::new(dir.path().join("test.db"));
        let pool = mdfeed_db::pool::create_pool(&cfg).await.unwrap();
        mdfeed_db::pool::run_migrations(&pool, mdfeed_db::pool::default_migrations_path()).await.unwrap();
        let storage = Storage::new(pool);

        let specs = vec![TaskSpec {
            name: "daily".into(),
            task_type: TaskType::Daily,
            enabled: false,
            statement_type: None,
            adjust: None,
        }];
        let group = GroupSpec { symbols: SymbolScope::List(vec!["600519".into()]), task_names: vec!["daily".into()] };

        let plan = plan(&storage, &specs, &group, None, false).await.unwrap();
        assert!(plan.business_tasks.is_empty());
    }
}
