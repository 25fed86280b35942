//! Error types for the store layer.

use fedsync_types::StoreId;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while accessing stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection acquisition timed out.
    #[error("acquiring a connection to {store} timed out after {waited:?}")]
    AcquireTimeout { store: StoreId, waited: Duration },

    /// The store is not in the registry, or is currently MISSING.
    #[error("unknown or missing store: {0}")]
    UnknownStore(StoreId),

    /// Identifier failed validation (table or column name).
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A blocking task failed to complete.
    #[error("blocking task failed: {0}")]
    Task(String),

    /// The pool has been shut down.
    #[error("connection pool closed")]
    PoolClosed,
}

impl StoreError {
    /// Whether the error is transient (lock contention, momentary
    /// unavailability, timeouts) and worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::AcquireTimeout { .. } => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
