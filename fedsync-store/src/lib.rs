//! SQLite store access for FedSync.
//!
//! Two pieces live here:
//!
//! - [`StoreRegistry`] — catalogs every known store (path, size, table
//!   inventory, health score) and refreshes the catalog by scanning the
//!   configured directories. The registry is the only process-wide mutable
//!   state; it is injected as an `Arc` and synchronized internally
//!   (single writer, multiple readers).
//! - [`PoolManager`] / [`ConnectionPool`] — bounded per-store pools of
//!   reusable connections with timeout on acquisition and guaranteed
//!   release on every exit path.

mod error;
mod pool;
mod registry;

pub use error::{StoreError, StoreResult};
pub use pool::{ConnectionPool, ExclusiveLock, PoolManager, PooledConnection};
pub use registry::StoreRegistry;

/// Validates a SQL identifier (table or column name).
///
/// Only alphanumerics and underscores are allowed, which prevents SQL
/// injection via identifiers that cannot be bound as parameters.
pub fn sanitize_identifier(name: &str) -> StoreResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
