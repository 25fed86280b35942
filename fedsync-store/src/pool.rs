//! Bounded per-store connection pools.
//!
//! Each store gets at most `pool_size` concurrently open handles.
//! Acquisition blocks up to a timeout and then fails with a typed error
//! rather than hanging. Connections are handed out behind a guard that
//! returns them to the pool on drop, so a panic or early return during use
//! never leaks a handle. A connection that errors on a query is discarded
//! via [`PooledConnection::mark_broken`]; connections past their maximum
//! lifetime are dropped instead of recycled.

use crate::{StoreError, StoreRegistry, StoreResult};
use fedsync_types::StoreId;
use rusqlite::Connection;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct IdleConn {
    conn: Connection,
    opened: Instant,
}

/// Bounded pool of reusable connections to one store.
pub struct ConnectionPool {
    store: StoreId,
    path: PathBuf,
    size: usize,
    max_lifetime: Duration,
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<IdleConn>>>,
}

impl ConnectionPool {
    /// Creates a pool for the store at `path` with `size` permits.
    pub fn new(store: StoreId, path: PathBuf, size: usize, max_lifetime: Duration) -> Self {
        Self {
            store,
            path,
            size,
            max_lifetime,
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquires a connection, waiting up to `timeout`.
    ///
    /// Fails with [`StoreError::AcquireTimeout`] instead of blocking
    /// indefinitely. The returned guard releases its permit on every exit
    /// path, panics included.
    pub async fn acquire(&self, timeout: Duration) -> StoreResult<PooledConnection> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| StoreError::AcquireTimeout {
                store: self.store.clone(),
                waited: timeout,
            })?
            .map_err(|_| StoreError::PoolClosed)?;

        let recycled = self.pop_idle();
        let (conn, opened) = match recycled {
            Some(idle) => (idle.conn, idle.opened),
            None => {
                let path = self.path.clone();
                let conn = tokio::task::spawn_blocking(move || Connection::open(path))
                    .await
                    .map_err(|e| StoreError::Task(e.to_string()))??;
                debug!("opened new connection to {}", self.store);
                (conn, Instant::now())
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            opened,
            broken: false,
            idle: Arc::clone(&self.idle),
            max_lifetime: self.max_lifetime,
            _permit: permit,
        })
    }

    /// Acquires every permit, excluding all other users of this store for
    /// the lifetime of the returned lock. Used by maintenance so it never
    /// overlaps sync activity on the same store.
    pub async fn lock_exclusive(&self, timeout: Duration) -> StoreResult<ExclusiveLock> {
        let permits = tokio::time::timeout(
            timeout,
            self.semaphore.clone().acquire_many_owned(self.size as u32),
        )
        .await
        .map_err(|_| StoreError::AcquireTimeout {
            store: self.store.clone(),
            waited: timeout,
        })?
        .map_err(|_| StoreError::PoolClosed)?;

        // Idle handles are dropped so the exclusive holder sees no open
        // connections at all.
        self.idle.lock().expect("pool lock poisoned").clear();

        Ok(ExclusiveLock { _permits: permits })
    }

    fn pop_idle(&self) -> Option<IdleConn> {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        while let Some(candidate) = idle.pop() {
            if candidate.opened.elapsed() < self.max_lifetime {
                return Some(candidate);
            }
            // Past max lifetime: drop and look for a fresher one.
        }
        None
    }
}

/// Guard over every permit of one store's pool.
pub struct ExclusiveLock {
    _permits: OwnedSemaphorePermit,
}

/// A pooled connection guard.
///
/// Dereferences to [`rusqlite::Connection`]. On drop the connection is
/// returned to the pool unless it was marked broken or outlived the pool's
/// maximum connection lifetime.
pub struct PooledConnection {
    conn: Option<Connection>,
    opened: Instant,
    broken: bool,
    idle: Arc<Mutex<Vec<IdleConn>>>,
    max_lifetime: Duration,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Marks the connection as broken; it will be discarded instead of
    /// returned to the pool. Call after a query error.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .field("age", &self.opened.elapsed())
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken && self.opened.elapsed() < self.max_lifetime {
                self.idle
                    .lock()
                    .expect("pool lock poisoned")
                    .push(IdleConn {
                        conn,
                        opened: self.opened,
                    });
            }
            // Broken or stale connections are simply dropped; the permit
            // release lets the next acquirer open a fresh one.
        }
    }
}

/// Per-store pool directory, keyed by store ID.
///
/// Pools are created lazily from registry paths, so a store that appears in
/// a later discovery cycle gets a pool on first use.
pub struct PoolManager {
    registry: Arc<StoreRegistry>,
    pool_size: usize,
    acquire_timeout: Duration,
    max_lifetime: Duration,
    pools: RwLock<HashMap<StoreId, Arc<ConnectionPool>>>,
}

impl PoolManager {
    pub fn new(
        registry: Arc<StoreRegistry>,
        pool_size: usize,
        acquire_timeout: Duration,
        max_lifetime: Duration,
    ) -> Self {
        Self {
            registry,
            pool_size,
            acquire_timeout,
            max_lifetime,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Returns (creating if needed) the pool for an active store.
    pub fn pool(&self, store: &StoreId) -> StoreResult<Arc<ConnectionPool>> {
        if let Some(pool) = self.pools.read().expect("pools lock poisoned").get(store) {
            return Ok(Arc::clone(pool));
        }
        let path = self.registry.path_of(store)?;
        let mut pools = self.pools.write().expect("pools lock poisoned");
        let pool = pools.entry(store.clone()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(
                store.clone(),
                path,
                self.pool_size,
                self.max_lifetime,
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// Acquires a connection to an active store with the configured timeout.
    pub async fn acquire(&self, store: &StoreId) -> StoreResult<PooledConnection> {
        let pool = self.pool(store)?;
        pool.acquire(self.acquire_timeout).await
    }

    /// Configured acquisition timeout.
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// The registry this manager resolves paths against.
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }
}
