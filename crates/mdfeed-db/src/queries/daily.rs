//! Query functions for `daily_data` (DAILY task type).

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// The watermark for one symbol: the maximum `trade_date` on file.
pub async fn get_latest_date(pool: &SqlitePool, symbol: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT MAX(trade_date) FROM daily_data WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .context("failed to query daily_data watermark")?;

    Ok(row.and_then(|(d,)| d))
}

/// Watermarks for many symbols in a single query — the critical performance
/// invariant of the planning algorithm.
pub async fn batch_get_latest_dates(
    pool: &SqlitePool,
    symbols: &[String],
) -> Result<HashMap<String, String>> {
    if symbols.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = std::iter::repeat("?")
        .take(symbols.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT symbol, MAX(trade_date) AS latest FROM daily_data \
         WHERE symbol IN ({placeholders}) GROUP BY symbol"
    );

    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    for symbol in symbols {
        query = query.bind(symbol);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .context("failed to batch-query daily_data watermarks")?;

    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::ScalarValue, models::RowSet, pool, storage::Storage};

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

    fn row(symbol: &str, date: &str) -> RowSet {
        RowSet::new(
            vec!["symbol".into(), "trade_date".into(), "close".into()],
            vec![vec![
                ScalarValue::Text(symbol.into()),
                ScalarValue::Text(date.into()),
                ScalarValue::Real(10.0),
            ]],
        )
    }

    #[tokio::test]
    async fn watermark_reflects_saved_rows() {
        let (_dir, storage) = seeded_storage().await;
        storage.save_daily_data(&row("600519", "20240110")).await.unwrap();
        storage.save_daily_data(&row("600519", "20240105")).await.unwrap();

        let latest = get_latest_date(storage.pool(), "600519").await.unwrap();
        assert_eq!(latest.as_deref(), Some("20240110"));
    }

    #[tokio::test]
    async fn batch_watermarks_single_query() {
        let (_dir, storage) = seeded_storage().await;
        storage.save_daily_data(&row("600519", "20240110")).await.unwrap();
        storage.save_daily_data(&row("000001", "20240105")).await.unwrap();

        let map = batch_get_latest_dates(
            storage.pool(),
            &["600519".to_string(), "000001".to_string(), "999999".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(map.get("600519").map(String::as_str), Some("20240110"));
        assert_eq!(map.get("000001").map(String::as_str), Some("20240105"));
        assert!(!map.contains_key("999999"));
    }
}
