//! Query functions for `fundamental_data` (DAILY_BASIC task type).

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

pub async fn get_latest_date(pool: &SqlitePool, symbol: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT MAX(trade_date) FROM fundamental_data WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .context("failed to query fundamental_data watermark")?;

    Ok(row.and_then(|(d,)| d))
}

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
        "SELECT symbol, MAX(trade_date) AS latest FROM fundamental_data \
         WHERE symbol IN ({placeholders}) GROUP BY symbol"
    );

    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    for symbol in symbols {
        query = query.bind(symbol);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .context("failed to batch-query fundamental_data watermarks")?;

    Ok(rows.into_iter().collect())
}
