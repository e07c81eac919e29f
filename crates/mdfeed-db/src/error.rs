use thiserror::Error;

/// Storage-layer failures, distinguished so callers can decide whether to
/// retry a flush or dead-letter it outright.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("batch for {table} carries no columns the table recognizes")]
    NoRecognizedColumns { table: &'static str },

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StorageError {
    /// `true` when the failure is plausibly transient (lock contention, busy
    /// timeout, I/O hiccup) and worth retrying under the consumer's
    /// `max_retries` envelope. `false` for failures a retry cannot fix.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            Self::Database(sqlx::Error::PoolTimedOut) | Self::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}
