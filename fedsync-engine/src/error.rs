use fedsync_audit::AuditError;
use fedsync_store::StoreError;
use fedsync_types::StoreId;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("store {0} is not active")]
    MissingStore(StoreId),

    #[error("invalid mapping configuration: {0}")]
    MappingConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transient failures are worth retrying within the same sync pass.
    /// Everything else aborts the current mapping.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
