//! Core type definitions for FedSync.
//!
//! This crate defines the fundamental types shared across the engine:
//! - Store, sync-run and check identifiers
//! - The federation data model (store handles, mappings, sync/conflict
//!   records, metrics, consistency results)
//! - Engine configuration with documented defaults
//!
//! Everything here is plain data. Store access, reconciliation logic and
//! scheduling live in their respective crates.

mod config;
mod ids;
mod model;

pub use config::EngineConfig;
pub use ids::{CheckId, StoreId, SyncId};
pub use model::{
    AuditAction, AuditLine, ConflictRecord, ConflictResolution, ConsistencyCheckResult,
    MetricKind, MissingRowPolicy, ParseAuditError, PerformanceMetric, Severity, StoreHandle,
    StoreState, SyncMapping, SyncOperationRecord, SyncStatus, SyncType, TieBreak,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid configuration value for {key}: {value}")]
    InvalidConfig { key: String, value: String },
}
