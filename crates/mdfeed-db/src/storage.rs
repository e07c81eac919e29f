//! The storage engine: durable, indexed, concurrent-read/single-writer
//! tables for the four logical data types, with schema-drift-tolerant
//! upserts.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::StorageError;
use crate::models::{RowSet, ScalarValue};
use crate::queries;

/// One of the four logical tables, with its identity key and upsert
/// discipline baked in.
#[derive(Debug, Clone, Copy)]
struct TableSpec {
    name: &'static str,
    /// Columns storage recognizes, in addition to `created_at`/`updated_at`.
    columns: &'static [&'static str],
    /// The natural-key columns, used as the `ON CONFLICT` target.
    key: &'static [&'static str],
}

const DAILY_DATA: TableSpec = TableSpec {
    name: "daily_data",
    columns: &[
        "symbol", "trade_date", "open", "high", "low", "close", "pre_close", "change",
        "pct_chg", "vol", "amount",
    ],
    key: &["symbol", "trade_date"],
};

const FUNDAMENTAL_DATA: TableSpec = TableSpec {
    name: "fundamental_data",
    columns: &[
        "symbol",
        "trade_date",
        "close",
        "turnover_rate",
        "turnover_rate_f",
        "volume_ratio",
        "pe",
        "pe_ttm",
        "pb",
        "ps",
        "ps_ttm",
        "dv_ratio",
        "dv_ttm",
        "total_share",
        "float_share",
        "free_share",
        "total_mv",
        "circ_mv",
    ],
    key: &["symbol", "trade_date"],
};

const FINANCIAL_DATA: TableSpec = TableSpec {
    name: "financial_data",
    columns: &[
        "symbol",
        "ann_date",
        "end_date",
        "statement_type",
        "total_revenue",
        "revenue",
        "n_income",
        "n_income_attr_p",
        "total_profit",
        "operate_profit",
        "ebit",
        "ebitda",
    ],
    key: &["symbol", "ann_date", "end_date"],
};

const SYS_STOCK_LIST: TableSpec = TableSpec {
    name: "sys_stock_list",
    columns: &["symbol", "name", "area", "industry", "market", "list_date"],
    key: &["symbol"],
};

/// The storage engine. Cheap to clone — it wraps a pool, not a connection.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent upsert by natural key. Unknown supplied columns are
    /// dropped; missing recognized columns are left `NULL`.
    pub async fn save_daily_data(&self, batch: &RowSet) -> Result<u64, StorageError> {
        self.upsert(&DAILY_DATA, batch).await
    }

    pub async fn save_fundamental_data(&self, batch: &RowSet) -> Result<u64, StorageError> {
        self.upsert(&FUNDAMENTAL_DATA, batch).await
    }

    pub async fn save_financial_data(&self, batch: &RowSet) -> Result<u64, StorageError> {
        self.upsert(&FINANCIAL_DATA, batch).await
    }

    /// The security master is overwrite-all: delete then insert, inside one
    /// transaction, rather than merge-by-key.
    pub async fn save_stock_list(&self, batch: &RowSet) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let spec = &SYS_STOCK_LIST;
        let recognized = recognized_columns(spec, batch);
        if recognized.is_empty() {
            return Err(StorageError::NoRecognizedColumns { table: spec.name });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sys_stock_list")
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();
        let mut builder = insert_builder(spec, &recognized);
        push_values(&mut builder, batch, &recognized, now);
        // Overwrite-all has no conflicting rows by construction (table was
        // just emptied), so no ON CONFLICT clause is needed here.
        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn upsert(&self, spec: &TableSpec, batch: &RowSet) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let recognized = recognized_columns(spec, batch);
        if recognized.is_empty() {
            return Err(StorageError::NoRecognizedColumns { table: spec.name });
        }

        let now = Utc::now();
        let mut builder = insert_builder(spec, &recognized);
        push_values(&mut builder, batch, &recognized, now);
        push_upsert_clause(&mut builder, spec, &recognized);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_latest_date(
        &self,
        task_type: crate::models::TaskType,
        symbol: &str,
    ) -> anyhow::Result<Option<String>> {
        use crate::models::TaskType::*;
        match task_type {
            Daily => queries::daily::get_latest_date(&self.pool, symbol).await,
            DailyBasic => queries::fundamental::get_latest_date(&self.pool, symbol).await,
            Financials => queries::financial::get_latest_date(&self.pool, symbol).await,
            StockList => Ok(None),
        }
    }

    pub async fn batch_get_latest_dates(
        &self,
        task_type: crate::models::TaskType,
        symbols: &[String],
    ) -> anyhow::Result<std::collections::HashMap<String, String>> {
        use crate::models::TaskType::*;
        match task_type {
            Daily => queries::daily::batch_get_latest_dates(&self.pool, symbols).await,
            DailyBasic => queries::fundamental::batch_get_latest_dates(&self.pool, symbols).await,
            Financials => queries::financial::batch_get_latest_dates(&self.pool, symbols).await,
            StockList => Ok(std::collections::HashMap::new()),
        }
    }

    pub async fn get_all_stock_codes(&self) -> anyhow::Result<Vec<String>> {
        queries::stock_list::get_all_stock_codes(&self.pool).await
    }

    pub async fn list_business_tables(
        &self,
    ) -> anyhow::Result<Vec<crate::models::BusinessTableEntry>> {
        queries::stock_list::list_business_tables(&self.pool).await
    }
}

/// Columns present in both the batch and the table, preserving table order
/// so bind positions line up with the generated SQL.
fn recognized_columns(spec: &TableSpec, batch: &RowSet) -> Vec<&'static str> {
    spec.columns
        .iter()
        .copied()
        .filter(|col| batch.columns.iter().any(|c| c == col))
        .collect()
}

fn insert_builder<'a>(spec: &TableSpec, recognized: &[&'static str]) -> QueryBuilder<'a, Sqlite> {
    let mut cols = recognized.to_vec();
    cols.push("created_at");
    cols.push("updated_at");
    let mut builder = QueryBuilder::new(format!("INSERT INTO {} (", spec.name));
    let mut separated = builder.separated(", ");
    for col in &cols {
        separated.push(*col);
    }
    builder.push(") ");
    builder
}

fn push_values<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    batch: &'a RowSet,
    recognized: &[&'static str],
    stamp: chrono::DateTime<Utc>,
) {
    let indices: Vec<usize> = recognized
        .iter()
        .map(|col| batch.column_index(col).expect("column recognized against batch"))
        .collect();

    builder.push_values(&batch.rows, |mut row_builder, row| {
        for &idx in &indices {
            match &row[idx] {
                ScalarValue::Text(s) => {
                    row_builder.push_bind(s.as_str());
                }
                ScalarValue::Real(v) => {
                    row_builder.push_bind(*v);
                }
                ScalarValue::Integer(v) => {
                    row_builder.push_bind(*v);
                }
                ScalarValue::Null => {
                    row_builder.push_bind(Option::<&str>::None);
                }
            }
        }
        row_builder.push_bind(stamp.to_rfc3339());
        row_builder.push_bind(stamp.to_rfc3339());
    });
}

fn push_upsert_clause(builder: &mut QueryBuilder<'_, Sqlite>, spec: &TableSpec, recognized: &[&'static str]) {
    let key_set: std::collections::HashSet<&str> = spec.key.iter().copied().collect();
    let update_cols: Vec<&str> = recognized
        .iter()
        .copied()
        .filter(|c| !key_set.contains(c))
        .collect();

    builder.push(" ON CONFLICT (");
    {
        let mut separated = builder.separated(", ");
        for col in spec.key {
            separated.push(*col);
        }
    }
    builder.push(") DO UPDATE SET ");
    let mut separated = builder.separated(", ");
    for col in &update_cols {
        separated.push(format!("{col} = excluded.{col}"));
    }
    separated.push("updated_at = excluded.updated_at");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DbConfig, pool};

    async fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DbConfig::new(dir.path().join("test.db"));
        let sqlite_pool = pool::create_pool(&cfg).await.unwrap();
        pool::run_migrations(&sqlite_pool, pool::default_migrations_path())
            .await
            .unwrap();
        (dir, Storage::new(sqlite_pool))
    }

    fn daily_row(symbol: &str, date: &str, close: f64) -> RowSet {
        RowSet::new(
            vec!["symbol".into(), "trade_date".into(), "close".into(), "bogus_col".into()],
            vec![vec![
                ScalarValue::Text(symbol.into()),
                ScalarValue::Text(date.into()),
                ScalarValue::Real(close),
                ScalarValue::Text("dropped by schema drift".into()),
            ]],
        )
    }

    #[tokio::test]
    async fn upsert_merges_on_second_write() {
        let (_dir, storage) = storage().await;
        storage
            .save_daily_data(&daily_row("600519", "20240101", 10.0))
            .await
            .unwrap();
        storage
            .save_daily_data(&daily_row("600519", "20240101", 20.0))
            .await
            .unwrap();

        let row: (f64,) =
            sqlx::query_as("SELECT close FROM daily_data WHERE symbol = ? AND trade_date = ?")
                .bind("600519")
                .bind("20240101")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(row.0, 20.0);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM daily_data")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let (_dir, storage) = storage().await;
        let empty = RowSet::new(vec!["symbol".into()], vec![]);
        let affected = storage.save_daily_data(&empty).await.unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn batch_with_no_recognized_columns_errors() {
        let (_dir, storage) = storage().await;
        let bogus = RowSet::new(
            vec!["not_a_real_column".into()],
            vec![vec![ScalarValue::Text("x".into())]],
        );
        let result = storage.save_daily_data(&bogus).await;
        assert!(matches!(result, Err(StorageError::NoRecognizedColumns { .. })));
    }
}
