//! Job store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from job store operations.
///
/// `InvalidArgument` is always a caller bug and never worth retrying. Every
/// other variant is a storage failure the worker treats as job-level.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed id, status or required field.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection pool could not be built or hand out a connection.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored JSON document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row holds a value the store never writes.
    #[error("Corrupt row {id} in '{table}': {reason}")]
    CorruptRow {
        table: &'static str,
        id: i64,
        reason: String,
    },
}

impl StoreError {
    /// True for I/O-level failures (everything except caller mistakes).
    pub fn is_storage(&self) -> bool {
        !matches!(self, StoreError::InvalidArgument(_))
    }
}

pub(crate) fn require_positive_id(name: &str, id: i64) -> Result<(), StoreError> {
    if id <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "{} must be a positive integer (got {})",
            name, id
        )));
    }
    Ok(())
}

pub(crate) fn require_non_empty(name: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "{} must be a non-empty string",
            name
        )));
    }
    Ok(())
}
