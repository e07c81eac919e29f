//! YAML job configuration: the declarative document naming the database
//! path, downloader/consumer tuning, task catalog, and groups.
//!
//! Resolution chain: environment variable > config file value. The
//! `tushare_token` field may be overridden by an environment variable of
//! the same uppercased name, environment wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mdfeed_core::engine::plan::{GroupSpec, SymbolScope, TaskSpec};
use mdfeed_db::models::{StatementType, TaskType};
use serde::Deserialize;

/// A `symbols` value: either an explicit list or the `all` sentinel.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SymbolsValue {
    All(AllSentinel),
    List(Vec<String>),
}

/// Matches only the literal string `"all"`, so a config typo like `"All"`
/// or `"everything"` fails to parse instead of silently becoming a list.
#[derive(Debug, Clone)]
pub struct AllSentinel;

impl<'de> Deserialize<'de> for AllSentinel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "all" {
            Ok(AllSentinel)
        } else {
            Err(serde::de::Error::custom(format!("expected the literal \"all\", got {s:?}")))
        }
    }
}

impl SymbolsValue {
    fn into_scope(self) -> SymbolScope {
        match self {
            Self::All(_) => SymbolScope::All,
            Self::List(list) => SymbolScope::List(list),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

fn default_database_path() -> String {
    "data/stock.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloaderSection {
    #[serde(default = "default_max_producers")]
    pub max_producers: usize,
    #[serde(default = "default_max_consumers")]
    pub max_consumers: usize,
    #[serde(default = "default_producer_queue_size")]
    pub producer_queue_size: usize,
    #[serde(default = "default_data_queue_size")]
    pub data_queue_size: usize,
    #[serde(default = "default_symbols")]
    pub symbols: SymbolsValue,
}

fn default_max_producers() -> usize {
    4
}
fn default_max_consumers() -> usize {
    2
}
fn default_producer_queue_size() -> usize {
    1000
}
fn default_data_queue_size() -> usize {
    1000
}
fn default_symbols() -> SymbolsValue {
    SymbolsValue::All(AllSentinel)
}

impl Default for DownloaderSection {
    fn default() -> Self {
        Self {
            max_producers: default_max_producers(),
            max_consumers: default_max_consumers(),
            producer_queue_size: default_producer_queue_size(),
            data_queue_size: default_data_queue_size(),
            symbols: default_symbols(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size() -> usize {
    500
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ConsumerSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }
}

/// One entry in `tasks:`, naming a task-type and its static parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfigEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub date_col: Option<String>,
    pub statement_type: Option<String>,
    /// Adjustment mode for DAILY fetches (`qfq`/`hfq`/`none`), passed
    /// straight through to `Fetcher::fetch_daily_history`'s `adjust`
    /// parameter.
    pub adjust: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One entry in `groups:`: a symbol scope plus the ordered task names to
/// run against it.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfigEntry {
    #[serde(default)]
    pub description: Option<String>,
    pub symbols: SymbolsValue,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub tushare_token: Option<String>,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub downloader: DownloaderSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub tasks: HashMap<String, TaskConfigEntry>,
    #[serde(default)]
    pub groups: HashMap<String, GroupConfigEntry>,
}

impl ConfigFile {
    /// Parse a YAML document from a path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// The resolved Tushare API token: `TUSHARE_TOKEN` env var wins over
    /// the config file's `tushare_token`.
    pub fn resolve_token(&self) -> Result<String> {
        if let Ok(env_token) = std::env::var("TUSHARE_TOKEN") {
            return Ok(env_token);
        }
        self.tushare_token
            .clone()
            .context("no tushare_token in config and TUSHARE_TOKEN is not set")
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }

    /// The full task catalog as [`TaskSpec`]s, keyed by config task name —
    /// the shape `mdfeed_core::engine::plan::plan` consumes.
    pub fn task_specs(&self) -> Result<Vec<TaskSpec>> {
        self.tasks
            .values()
            .map(|entry| {
                let task_type: TaskType = entry
                    .task_type
                    .parse()
                    .with_context(|| format!("task {:?} has unrecognized type {:?}", entry.name, entry.task_type))?;
                let statement_type = entry
                    .statement_type
                    .as_deref()
                    .map(str::parse::<StatementType>)
                    .transpose()
                    .with_context(|| format!("task {:?} has unrecognized statement_type", entry.name))?;

                Ok(TaskSpec {
                    name: entry.name.clone(),
                    task_type,
                    enabled: entry.enabled,
                    statement_type,
                    adjust: entry.adjust.clone(),
                })
            })
            .collect()
    }

    /// Resolve a named group into a [`GroupSpec`].
    pub fn group_spec(&self, group_name: &str) -> Result<GroupSpec> {
        let entry = self
            .groups
            .get(group_name)
            .with_context(|| format!("no group named {group_name:?} in config"))?;
        if entry.tasks.is_empty() {
            bail!("group {group_name:?} names no tasks");
        }
        Ok(GroupSpec {
            symbols: entry.symbols.clone().into_scope(),
            task_names: entry.tasks.clone(),
        })
    }
}
