//! Common error types for vaultsync.

use thiserror::Error;

/// Top-level error type for vaultsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The filesystem watch backend failed.
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another holder owns an unexpired lock on the path.
    #[error("Lock acquisition failed: {path} is held by {holder}")]
    LockContended { path: String, holder: String },

    /// Conflict handling failed.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The engine or database has been shut down.
    #[error("Engine is closed")]
    Closed,
}

impl Error {
    /// Whether the failure is expected to clear up on a later attempt.
    ///
    /// Covers I/O failures and SQLite busy/locked contention from another
    /// process holding the write lock.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether this is a lock contention failure.
    pub fn is_lock_contended(&self) -> bool {
        matches!(self, Error::LockContended { .. })
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
