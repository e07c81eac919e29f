//! Query functions for `sys_stock_list`, the security master.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{BusinessTableEntry, TaskType};

/// All currently-listed security codes.
pub async fn get_all_stock_codes(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT symbol FROM sys_stock_list ORDER BY symbol")
        .fetch_all(pool)
        .await
        .context("failed to read security master")?;

    Ok(rows.into_iter().map(|(s,)| s).collect())
}

/// Enumerate `(task_type, symbol)` pairs with at least one persisted row —
/// the reconciliation helper used by `verify`.
pub async fn list_business_tables(pool: &SqlitePool) -> Result<Vec<BusinessTableEntry>> {
    let mut entries = Vec::new();

    let daily: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT symbol FROM daily_data")
            .fetch_all(pool)
            .await
            .context("failed to list daily_data symbols")?;
    entries.extend(daily.into_iter().map(|(symbol,)| BusinessTableEntry {
        task_type: TaskType::Daily,
        symbol,
    }));

    let fundamental: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT symbol FROM fundamental_data")
            .fetch_all(pool)
            .await
            .context("failed to list fundamental_data symbols")?;
    entries.extend(fundamental.into_iter().map(|(symbol,)| BusinessTableEntry {
        task_type: TaskType::DailyBasic,
        symbol,
    }));

    let financial: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT symbol FROM financial_data")
            .fetch_all(pool)
            .await
            .context("failed to list financial_data symbols")?;
    entries.extend(financial.into_iter().map(|(symbol,)| BusinessTableEntry {
        task_type: TaskType::Financials,
        symbol,
    }));

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RowSet, ScalarValue};
    use crate::{pool, storage::Storage};

    async fn seeded_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let cfg = crate::config::DbConfig::new(db_path);
        let sqlite_pool = pool::create_pool(&cfg).await.unwrap();
        pool::run_migrations(&sqlite_pool, pool::default_migrations_path())
            .await
            .unwrap();
        (dir, Storage::new(sqlite_pool))
    }

    #[tokio::test]
    async fn overwrite_all_replaces_prior_master() {
        let (_dir, storage) = seeded_storage().await;

        let first = RowSet::new(
            vec!["symbol".into(), "name".into()],
            vec![vec![ScalarValue::Text("600519".into()), ScalarValue::Text("A".into())]],
        );
        storage.save_stock_list(&first).await.unwrap();

        let second = RowSet::new(
            vec!["symbol".into(), "name".into()],
            vec![vec![ScalarValue::Text("000001".into()), ScalarValue::Text("B".into())]],
        );
        storage.save_stock_list(&second).await.unwrap();

        let codes = get_all_stock_codes(storage.pool()).await.unwrap();
        assert_eq!(codes, vec!["000001".to_string()]);
    }
}
