//! The store registry.
//!
//! Catalogs every known store and refreshes the catalog by scanning the
//! configured directories for `*.db` files. Each store is opened briefly
//! during discovery to read its table inventory, estimate row counts and
//! run a quick integrity check.
//!
//! A store that cannot be reached for three consecutive discovery cycles is
//! marked `MISSING` — a state, not a deletion. The entry stays in the
//! registry and the store rejoins the federation when its file reappears.

use crate::{sanitize_identifier, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use fedsync_types::{StoreHandle, StoreId, StoreState};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive failed cycles before a store is marked MISSING.
const MISSING_AFTER_CYCLES: u32 = 3;

/// EWMA weight given to the newest latency observation.
const BASELINE_ALPHA: f64 = 0.2;

struct StoreEntry {
    handle: StoreHandle,
    missed_cycles: u32,
    /// Rolling baseline of probe latency, milliseconds.
    latency_baseline_ms: Option<f64>,
}

/// Catalog of every known store in the federation.
///
/// Internally synchronized: reads take a shared lock, `discover` takes the
/// exclusive lock. Inject as `Arc<StoreRegistry>`.
pub struct StoreRegistry {
    inner: RwLock<HashMap<StoreId, StoreEntry>>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Scans the given directories for `*.db` files and refreshes the
    /// catalog. One `StoreHandle` write per store per cycle; previously
    /// known stores whose file is gone accrue a miss. Returns the full
    /// refreshed catalog, MISSING entries included.
    ///
    /// Blocking; callers on the async runtime should wrap this in
    /// `spawn_blocking`.
    pub fn discover(&self, roots: &[PathBuf]) -> StoreResult<Vec<StoreHandle>> {
        let mut found: Vec<PathBuf> = Vec::new();
        for root in roots {
            if !root.is_dir() {
                debug!("store root {} does not exist yet, skipping", root.display());
                continue;
            }
            for entry in std::fs::read_dir(root)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "db") && path.is_file() {
                    found.push(path);
                }
            }
        }
        // Stable order keeps discovery output comparable across runs.
        found.sort();

        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut seen: Vec<StoreId> = Vec::with_capacity(found.len());

        for path in found {
            let id = StoreId::from_path(&path);
            seen.push(id.clone());
            match probe_store(&path) {
                Ok(probe) => {
                    let entry = inner.entry(id.clone()).or_insert_with(|| StoreEntry {
                        handle: StoreHandle {
                            id: id.clone(),
                            path: path.clone(),
                            size_bytes: 0,
                            table_count: 0,
                            record_count_estimate: 0,
                            health_score: 0.0,
                            state: StoreState::Healthy,
                            last_modified: None,
                        },
                        missed_cycles: 0,
                        latency_baseline_ms: None,
                    });
                    apply_probe(entry, &path, probe);
                }
                Err(e) => {
                    warn!("probe of {} failed: {e}", path.display());
                    if let Some(entry) = inner.get_mut(&id) {
                        record_miss(entry);
                    }
                }
            }
        }

        // Stores whose backing file disappeared this cycle.
        for (id, entry) in inner.iter_mut() {
            if !seen.contains(id) {
                record_miss(entry);
                if entry.handle.state == StoreState::Missing {
                    info!("store {id} is MISSING (unreachable for {} cycles)", entry.missed_cycles);
                }
            }
        }

        let mut handles: Vec<StoreHandle> =
            inner.values().map(|e| e.handle.clone()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }

    /// Returns the handle for a store, if known.
    pub fn get(&self, id: &StoreId) -> Option<StoreHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(|e| e.handle.clone())
    }

    /// Returns all known handles, MISSING included, in stable order.
    pub fn handles(&self) -> Vec<StoreHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut handles: Vec<StoreHandle> =
            inner.values().map(|e| e.handle.clone()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Whether a store is known and not MISSING.
    pub fn is_active(&self, id: &StoreId) -> bool {
        self.get(id)
            .is_some_and(|h| h.state != StoreState::Missing)
    }

    /// Resolves the backing path of an active store.
    pub fn path_of(&self, id: &StoreId) -> StoreResult<PathBuf> {
        match self.get(id) {
            Some(h) if h.state != StoreState::Missing => Ok(h.path),
            _ => Err(StoreError::UnknownStore(id.clone())),
        }
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ProbeResult {
    size_bytes: u64,
    table_count: usize,
    record_count: u64,
    integrity_ok: bool,
    latency_ms: f64,
    last_modified: Option<DateTime<Utc>>,
}

/// Opens a store briefly and reads its vitals.
fn probe_store(path: &Path) -> StoreResult<ProbeResult> {
    let metadata = std::fs::metadata(path)?;
    let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    let conn = Connection::open(path)?;
    let integrity: String =
        conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    let integrity_ok = integrity == "ok";

    let mut tables: Vec<String> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in rows {
            tables.push(name?);
        }
    }

    let started = Instant::now();
    let mut record_count: u64 = 0;
    for table in &tables {
        let Ok(table) = sanitize_identifier(table) else {
            continue;
        };
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get(0)
            })?;
        record_count += count.max(0) as u64;
    }
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    Ok(ProbeResult {
        size_bytes: metadata.len(),
        table_count: tables.len(),
        record_count,
        integrity_ok,
        latency_ms,
        last_modified,
    })
}

fn apply_probe(entry: &mut StoreEntry, path: &Path, probe: ProbeResult) {
    // Health: 50% integrity pass/fail, 50% probe latency vs. the rolling
    // baseline, clamped to [0, 100].
    let integrity_component = if probe.integrity_ok { 50.0 } else { 0.0 };
    let latency_component = match entry.latency_baseline_ms {
        Some(baseline) if probe.latency_ms > 0.0 => {
            (baseline / probe.latency_ms).clamp(0.0, 1.0) * 50.0
        }
        _ => 50.0,
    };
    let health = (integrity_component + latency_component).clamp(0.0, 100.0);

    entry.latency_baseline_ms = Some(match entry.latency_baseline_ms {
        Some(baseline) => baseline * (1.0 - BASELINE_ALPHA) + probe.latency_ms * BASELINE_ALPHA,
        None => probe.latency_ms,
    });

    entry.missed_cycles = 0;
    entry.handle.path = path.to_path_buf();
    entry.handle.size_bytes = probe.size_bytes;
    entry.handle.table_count = probe.table_count;
    entry.handle.record_count_estimate = probe.record_count;
    entry.handle.health_score = health;
    entry.handle.last_modified = probe.last_modified;
    entry.handle.state = if probe.integrity_ok && health >= 50.0 {
        StoreState::Healthy
    } else {
        StoreState::Degraded
    };
}

fn record_miss(entry: &mut StoreEntry) {
    entry.missed_cycles = entry.missed_cycles.saturating_add(1);
    if entry.missed_cycles >= MISSING_AFTER_CYCLES {
        entry.handle.state = StoreState::Missing;
    } else if entry.handle.state != StoreState::Missing {
        entry.handle.state = StoreState::Degraded;
    }
}
