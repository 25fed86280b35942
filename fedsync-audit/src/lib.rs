//! Durable append-only audit and metrics log.
//!
//! Every sync decision, retry, conflict and maintenance action lands here.
//! Two sinks, which must agree:
//!
//! - a line log of `"<action> <table>:<id>"` entries (stable format,
//!   round-trips via [`fedsync_types::AuditLine`]), and
//! - structured rows in a dedicated SQLite file.
//!
//! Both sinks are append-only; no component ever rewrites or deletes an
//! entry. Batched sync entries write their log lines first and commit the
//! structured rows after, so a committed row always has its line.
//!
//! All methods are blocking; async callers wrap them in `spawn_blocking`.

mod error;
mod store;

pub use error::{AuditError, AuditResult};
pub use store::{AuditEvent, AuditLog, OperationRow, SyncAuditEntry};
