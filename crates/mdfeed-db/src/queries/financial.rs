//! Query functions for `financial_data` (FINANCIALS task type).
//!
//! The watermark date column here is `ann_date`, not `trade_date` — the
//! natural key also includes `end_date`, but watermark computation only
//! ever needs the announcement date.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

pub async fn get_latest_date(pool: &SqlitePool, symbol: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT MAX(ann_date) FROM financial_data WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .context("failed to query financial_data watermark")?;

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
        "SELECT symbol, MAX(ann_date) AS latest FROM financial_data \
         WHERE symbol IN ({placeholders}) GROUP BY symbol"
    );

    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    for symbol in symbols {
        query = query.bind(symbol);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .context("failed to batch-query financial_data watermarks")?;

    Ok(rows.into_iter().collect())
}
