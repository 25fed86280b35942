//! The FedSync engine: synchronization, maintenance, validation and the
//! orchestration loop that ties them together.
//!
//! The [`Orchestrator`] is the usual entry point. It wires a
//! [`fedsync_store::StoreRegistry`], the connection pools, the
//! [`fedsync_audit::AuditLog`] and every engine component from one
//! [`fedsync_types::EngineConfig`], and can either run one-shot phases
//! (for CLI use) or be spawned as a periodic background loop.

mod engine;
mod error;
mod maintenance;
mod mapping;
mod orchestrator;
mod retry;
mod validator;

pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult};
pub use maintenance::{MaintenanceKind, MaintenanceScheduler};
pub use mapping::{load_mappings, MappingFile, MAPPING_FILE_VERSION};
pub use orchestrator::{Orchestrator, OrchestratorCommand, OrchestratorHandle};
pub use retry::RetryConfig;
pub use validator::ConsistencyValidator;
