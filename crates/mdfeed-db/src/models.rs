use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The closed set of task kinds. `StockList` is the single system-level
/// type; the rest are business-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StockList,
    Daily,
    DailyBasic,
    Financials,
}

impl TaskType {
    /// `true` for the single system-level task type.
    pub fn is_system(self) -> bool {
        matches!(self, Self::StockList)
    }

    /// The natural-key date column governing this type's watermark.
    pub fn date_column(self) -> &'static str {
        match self {
            Self::StockList => "list_date",
            Self::Daily | Self::DailyBasic => "trade_date",
            Self::Financials => "ann_date",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StockList => "stock_list",
            Self::Daily => "daily",
            Self::DailyBasic => "daily_basic",
            Self::Financials => "financials",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock_list" => Ok(Self::StockList),
            "daily" => Ok(Self::Daily),
            "daily_basic" => Ok(Self::DailyBasic),
            "financials" => Ok(Self::Financials),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Secondary discriminator for `Financials` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    Income,
    Balancesheet,
    Cashflow,
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Income => "income",
            Self::Balancesheet => "balancesheet",
            Self::Cashflow => "cashflow",
        };
        f.write_str(s)
    }
}

impl FromStr for StatementType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(Self::Income),
            "balancesheet" => Ok(Self::Balancesheet),
            "cashflow" => Ok(Self::Cashflow),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Ordered task priority; `HIGH` drains before `NORMAL` before `LOW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

/// A row of `daily_data`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DailyDataRow {
    pub symbol: String,
    pub trade_date: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub pre_close: Option<f64>,
    pub change: Option<f64>,
    pub pct_chg: Option<f64>,
    pub vol: Option<f64>,
    pub amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `fundamental_data`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct FundamentalDataRow {
    pub symbol: String,
    pub trade_date: String,
    pub close: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub turnover_rate_f: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub pe: Option<f64>,
    pub pe_ttm: Option<f64>,
    pub pb: Option<f64>,
    pub ps: Option<f64>,
    pub ps_ttm: Option<f64>,
    pub dv_ratio: Option<f64>,
    pub dv_ttm: Option<f64>,
    pub total_share: Option<f64>,
    pub float_share: Option<f64>,
    pub free_share: Option<f64>,
    pub total_mv: Option<f64>,
    pub circ_mv: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `financial_data`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct FinancialDataRow {
    pub symbol: String,
    pub ann_date: String,
    pub end_date: String,
    pub statement_type: Option<String>,
    pub total_revenue: Option<f64>,
    pub revenue: Option<f64>,
    pub n_income: Option<f64>,
    pub n_income_attr_p: Option<f64>,
    pub total_profit: Option<f64>,
    pub operate_profit: Option<f64>,
    pub ebit: Option<f64>,
    pub ebitda: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `sys_stock_list`, the security master.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StockListRow {
    pub symbol: String,
    pub name: Option<String>,
    pub area: Option<String>,
    pub industry: Option<String>,
    pub market: Option<String>,
    pub list_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A `(task_type, symbol)` pair with at least one persisted row — the
/// output of `list_business_tables`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusinessTableEntry {
    pub task_type: TaskType,
    pub symbol: String,
}

// ---------------------------------------------------------------------------
// Generic row set (schema-drift-tolerant batch representation)
// ---------------------------------------------------------------------------

/// One SQLite-representable scalar. `DataBatch` rows are untyped at the
/// producer/fetcher boundary — the remote API's column set can shift
/// release to release — so storage accepts rows shaped this way rather than
/// a fixed struct per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Real(f64),
    Integer(i64),
    Null,
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// A tabular block of named, uniformly-shaped rows. Storage's `save`
/// operation accepts the intersection of `columns` and a table's known
/// columns, tolerating schema drift: unknown supplied columns are dropped,
/// missing ones become `NULL`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_roundtrip() {
        for t in [
            TaskType::StockList,
            TaskType::Daily,
            TaskType::DailyBasic,
            TaskType::Financials,
        ] {
            assert_eq!(t.to_string().parse::<TaskType>().unwrap(), t);
        }
    }

    #[test]
    fn task_type_rejects_unknown() {
        assert!("bogus".parse::<TaskType>().is_err());
    }

    #[test]
    fn date_column_matches_spec() {
        assert_eq!(TaskType::Daily.date_column(), "trade_date");
        assert_eq!(TaskType::DailyBasic.date_column(), "trade_date");
        assert_eq!(TaskType::Financials.date_column(), "ann_date");
        assert_eq!(TaskType::StockList.date_column(), "list_date");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn statement_type_roundtrip() {
        for s in [
            StatementType::Income,
            StatementType::Balancesheet,
            StatementType::Cashflow,
        ] {
            assert_eq!(s.to_string().parse::<StatementType>().unwrap(), s);
        }
    }
}
