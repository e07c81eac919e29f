//! The `verify` subcommand: reconcile the security master against stored
//! business data and dead-letter any (symbol, task type) pair missing from
//! storage, so a later `run` with `--force` can pick it back up.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use mdfeed_core::deadletter::DeadLetterLog;
use mdfeed_db::models::TaskType;
use mdfeed_db::{pool, DbConfig, Storage};

use crate::config::ConfigFile;

const DEAD_LETTER_PATH: &str = "logs/dead_letter.jsonl";

/// Business task types a symbol is expected to have rows for, once fetched
/// at least once — `StockList` is the system task that produces the master
/// itself, so it is never a reconcile target.
const BUSINESS_TASK_TYPES: &[TaskType] = &[TaskType::Daily, TaskType::DailyBasic, TaskType::Financials];

pub async fn run(config_path: &Path) -> Result<()> {
    let config_file = ConfigFile::load(config_path)?;
    let db_config = DbConfig::new(config_file.database_path());
    let sqlite_pool = pool::create_pool(&db_config).await.context("failed to open database")?;
    let storage = Storage::new(sqlite_pool);

    let all_symbols = storage.get_all_stock_codes().await.context("failed to read security master")?;
    let present = storage.list_business_tables().await.context("failed to read business tables")?;

    let mut present_by_type: HashMap<TaskType, HashSet<String>> = HashMap::new();
    for entry in present {
        present_by_type.entry(entry.task_type).or_default().insert(entry.symbol);
    }

    let dead_letter = DeadLetterLog::new(DEAD_LETTER_PATH);
    let mut total_missing = 0usize;

    for &task_type in BUSINESS_TASK_TYPES {
        let have = present_by_type.get(&task_type);
        let missing: Vec<String> = all_symbols
            .iter()
            .filter(|symbol| !have.is_some_and(|set| set.contains(*symbol)))
            .cloned()
            .collect();

        if missing.is_empty() {
            continue;
        }

        tracing::warn!(%task_type, count = missing.len(), "symbols missing business data");
        dead_letter
            .log_missing_symbols(task_type, &missing)
            .await
            .with_context(|| format!("failed to log missing symbols for {task_type}"))?;
        total_missing += missing.len();
    }

    let stats = dead_letter.statistics().await.context("failed to read dead-letter statistics")?;
    tracing::info!(
        master_symbols = all_symbols.len(),
        newly_flagged = total_missing,
        dead_letter_total = stats.total_count,
        "verify complete"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfeed_core::deadletter::{ReadFilter, MISSING_DATA};

    #[tokio::test]
    async fn flags_symbols_absent_from_every_business_table() {
        let (_dir, storage) = mdfeed_test_utils::temp_storage().await;
        storage
            .save_stock_list(&mdfeed_test_utils::stock_list_row("600519.SH", "Moutai", "20010101"))
            .await
            .unwrap();
        storage
            .save_stock_list(&mdfeed_test_utils::stock_list_row("000001.SZ", "PingAn", "19910101"))
            .await
            .unwrap();
        storage.save_daily_data(&mdfeed_test_utils::daily_row("600519.SH", "20240101", 10.0)).await.unwrap();

        let dl_dir = tempfile::tempdir().unwrap();
        let dead_letter = DeadLetterLog::new(dl_dir.path().join("dead_letter.jsonl"));

        let all_symbols = storage.get_all_stock_codes().await.unwrap();
        let present = storage.list_business_tables().await.unwrap();
        let mut present_by_type: HashMap<TaskType, HashSet<String>> = HashMap::new();
        for entry in present {
            present_by_type.entry(entry.task_type).or_default().insert(entry.symbol);
        }

        for &task_type in BUSINESS_TASK_TYPES {
            let have = present_by_type.get(&task_type);
            let missing: Vec<String> =
                all_symbols.iter().filter(|s| !have.is_some_and(|set| set.contains(*s))).cloned().collect();
            if !missing.is_empty() {
                dead_letter.log_missing_symbols(task_type, &missing).await.unwrap();
            }
        }

        let records = dead_letter.read(&ReadFilter::default()).await.unwrap();
        assert!(records.iter().any(|r| r.symbol == "000001.SZ" && r.task_type == TaskType::Daily));
        assert!(records.iter().all(|r| r.error_type == MISSING_DATA));
    }
}
