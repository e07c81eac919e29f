use std::env;
use std::path::{Path, PathBuf};

/// Storage configuration: the path to the embedded database file.
///
/// Reads from the `MDFEED_DATABASE_PATH` environment variable, falling back
/// to `data/stock.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// The default path used when no environment variable or config value
    /// is supplied.
    pub const DEFAULT_PATH: &str = "data/stock.db";

    /// Build a config from the environment.
    ///
    /// Priority: `MDFEED_DATABASE_PATH` env var, then the compile-time
    /// default.
    pub fn from_env() -> Self {
        let database_path = env::var("MDFEED_DATABASE_PATH")
            .unwrap_or_else(|_| Self::DEFAULT_PATH.to_owned());
        Self {
            database_path: PathBuf::from(database_path),
        }
    }

    /// Build a config from an explicit path (useful for tests and CLI
    /// overrides).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// The `sqlx` connection URL for this path, creating the file if it
    /// does not yet exist.
    pub fn connect_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path.display())
    }

    pub fn parent_dir(&self) -> Option<&Path> {
        self.database_path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
