//! Engine configuration.
//!
//! All knobs are externally supplied (environment or CLI) with documented
//! defaults. Paths for the audit log, mapping file and store directory are
//! derived from the workspace root so one variable relocates everything.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workspace root; stores live under `<root>/databases`.
    pub workspace_root: PathBuf,
    /// Per-store connection pool size.
    pub pool_size: usize,
    /// Maximum wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Maximum lifetime of a pooled connection before it is recycled.
    pub max_connection_lifetime: Duration,
    /// Idle wait between orchestration cycles.
    pub sync_interval: Duration,
    /// Attempts per batch before it is marked failed.
    pub retry_budget: usize,
    /// Base delay for exponential backoff between batch retries.
    pub backoff_base: Duration,
    /// Mappings sharing no target store may run this many at a time.
    pub max_parallel_syncs: usize,
    /// Consistency score below which an alert is raised.
    pub alert_threshold: f64,
    /// Allowed record-count drift between mapped tables, as a fraction.
    pub drift_tolerance: f64,
    /// Maintenance cadences.
    pub compaction_interval: Duration,
    pub stats_interval: Duration,
    pub reindex_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            pool_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_connection_lifetime: Duration::from_secs(600),
            sync_interval: Duration::from_secs(300),
            retry_budget: 3,
            backoff_base: Duration::from_millis(50),
            max_parallel_syncs: 4,
            alert_threshold: 90.0,
            drift_tolerance: 0.0,
            compaction_interval: Duration::from_secs(24 * 3600),
            stats_interval: Duration::from_secs(3600),
            reindex_interval: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from `FEDSYNC_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// Recognized variables: `FEDSYNC_ROOT`, `FEDSYNC_POOL_SIZE`,
    /// `FEDSYNC_ACQUIRE_TIMEOUT_SECS`, `FEDSYNC_SYNC_INTERVAL_SECS`,
    /// `FEDSYNC_RETRY_BUDGET`, `FEDSYNC_ALERT_THRESHOLD`.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("FEDSYNC_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(n) = read_env("FEDSYNC_POOL_SIZE")? {
            config.pool_size = n;
        }
        if let Some(secs) = read_env("FEDSYNC_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env("FEDSYNC_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(n) = read_env("FEDSYNC_RETRY_BUDGET")? {
            config.retry_budget = n;
        }
        if let Some(v) = read_env("FEDSYNC_ALERT_THRESHOLD")? {
            config.alert_threshold = v;
        }
        Ok(config)
    }

    /// Directory scanned for `*.db` store files.
    pub fn store_root(&self) -> PathBuf {
        self.workspace_root.join("databases")
    }

    /// Path of the structured audit database.
    pub fn audit_db_path(&self) -> PathBuf {
        self.workspace_root.join("audit").join("fedsync.db")
    }

    /// Path of the append-only audit line log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.workspace_root.join("audit").join("fedsync.log")
    }

    /// Path of the versioned sync-mapping configuration file.
    pub fn mappings_path(&self) -> PathBuf {
        self.workspace_root.join("mappings.json")
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => {
            let parsed = raw.parse().map_err(|_| crate::Error::InvalidConfig {
                key: key.to_string(),
                value: raw.clone(),
            })?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
