//! Scheduled store maintenance: compaction, statistics refresh and index
//! rebuild.
//!
//! Every maintenance pass takes the store's pool exclusively, so it never
//! overlaps sync activity on the same store. A failing action is logged and
//! skipped; it never aborts the remaining actions or the store's syncs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use fedsync_audit::AuditLog;
use fedsync_store::PoolManager;
use fedsync_types::{EngineConfig, MetricKind, PerformanceMetric, StoreId};

use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceKind {
    /// `VACUUM`: reclaims free pages and defragments.
    Compaction,
    /// `ANALYZE` plus `PRAGMA optimize`: refreshes planner statistics.
    StatsRefresh,
    /// `REINDEX`: rebuilds all indexes.
    IndexRebuild,
}

impl MaintenanceKind {
    pub const ALL: [MaintenanceKind; 3] = [
        MaintenanceKind::Compaction,
        MaintenanceKind::StatsRefresh,
        MaintenanceKind::IndexRebuild,
    ];

    fn metric(self) -> MetricKind {
        match self {
            MaintenanceKind::Compaction => MetricKind::CompactionMs,
            MaintenanceKind::StatsRefresh => MetricKind::StatsRefreshMs,
            MaintenanceKind::IndexRebuild => MetricKind::ReindexMs,
        }
    }

    fn label(self) -> &'static str {
        match self {
            MaintenanceKind::Compaction => "compaction",
            MaintenanceKind::StatsRefresh => "stats refresh",
            MaintenanceKind::IndexRebuild => "index rebuild",
        }
    }

    fn run(self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            MaintenanceKind::Compaction => conn.execute_batch("VACUUM"),
            MaintenanceKind::StatsRefresh => conn.execute_batch("ANALYZE; PRAGMA optimize;"),
            MaintenanceKind::IndexRebuild => conn.execute_batch("REINDEX"),
        }
    }
}

#[derive(Debug, Default)]
struct SweepOutcome {
    completed: Vec<(MaintenanceKind, f64)>,
    size_before: Option<u64>,
    size_after: Option<u64>,
}

/// Per-store maintenance cadence tracking and execution.
pub struct MaintenanceScheduler {
    pools: Arc<PoolManager>,
    audit: Arc<AuditLog>,
    cadences: HashMap<MaintenanceKind, Duration>,
    last_run: Mutex<HashMap<(StoreId, MaintenanceKind), Instant>>,
}

impl MaintenanceScheduler {
    pub fn new(pools: Arc<PoolManager>, audit: Arc<AuditLog>, config: &EngineConfig) -> Self {
        let cadences = HashMap::from([
            (MaintenanceKind::Compaction, config.compaction_interval),
            (MaintenanceKind::StatsRefresh, config.stats_interval),
            (MaintenanceKind::IndexRebuild, config.reindex_interval),
        ]);
        Self {
            pools,
            audit,
            cadences,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Actions currently due for a store. With `force` every action is due.
    fn due_kinds(&self, store: &StoreId, force: bool) -> Vec<MaintenanceKind> {
        let last_run = self.last_run.lock().expect("maintenance lock poisoned");
        MaintenanceKind::ALL
            .into_iter()
            .filter(|kind| {
                if force {
                    return true;
                }
                let cadence = self.cadences[kind];
                match last_run.get(&(store.clone(), *kind)) {
                    Some(at) => at.elapsed() >= cadence,
                    None => true,
                }
            })
            .collect()
    }

    /// Runs all due maintenance actions on one store under its exclusive
    /// pool lock and records one timing metric per completed action, plus
    /// before/after file sizes when compaction ran. Returns the recorded
    /// metrics.
    pub async fn optimize(
        &self,
        store: &StoreId,
        force: bool,
    ) -> EngineResult<Vec<PerformanceMetric>> {
        let due = self.due_kinds(store, force);
        if due.is_empty() {
            debug!("no maintenance due for {store}");
            return Ok(Vec::new());
        }

        let pool = self.pools.pool(store)?;
        let path = self.pools.registry().path_of(store)?;
        let _lock = pool.lock_exclusive(self.pools.acquire_timeout()).await?;
        info!("maintenance on {store}: {:?}", due.iter().map(|k| k.label()).collect::<Vec<_>>());

        let store_name = store.clone();
        let due_for_task = due.clone();
        let outcome = tokio::task::spawn_blocking(move || -> EngineResult<SweepOutcome> {
            let conn = Connection::open(&path)?;
            let mut outcome = SweepOutcome::default();
            for kind in due_for_task {
                // Compaction reports the file size on both sides so the
                // reclaimed space is visible in the metric trail.
                let measure_size = kind == MaintenanceKind::Compaction;
                if measure_size {
                    outcome.size_before = Some(std::fs::metadata(&path)?.len());
                }
                let started = Instant::now();
                match kind.run(&conn) {
                    Ok(()) => {
                        outcome
                            .completed
                            .push((kind, started.elapsed().as_secs_f64() * 1000.0));
                        if measure_size {
                            outcome.size_after = Some(std::fs::metadata(&path)?.len());
                        }
                    }
                    Err(e) => {
                        warn!("{} of {store_name} failed: {e}", kind.label());
                        if measure_size {
                            outcome.size_before = None;
                        }
                    }
                }
            }
            Ok(outcome)
        })
        .await
        .map_err(|e| crate::error::EngineError::Task(e.to_string()))??;

        let now = Utc::now();
        let completed = outcome.completed;
        let mut metrics = Vec::with_capacity(completed.len() + 2);
        for (kind, elapsed_ms) in &completed {
            metrics.push(PerformanceMetric {
                store: store.clone(),
                kind: kind.metric(),
                value: *elapsed_ms,
                measured_at: now,
            });
        }
        if let (Some(before), Some(after)) = (outcome.size_before, outcome.size_after) {
            metrics.push(PerformanceMetric {
                store: store.clone(),
                kind: MetricKind::SizeBeforeBytes,
                value: before as f64,
                measured_at: now,
            });
            metrics.push(PerformanceMetric {
                store: store.clone(),
                kind: MetricKind::SizeAfterBytes,
                value: after as f64,
                measured_at: now,
            });
        }
        for metric in &metrics {
            self.audit.record_metric(metric)?;
        }

        let mut last_run = self.last_run.lock().expect("maintenance lock poisoned");
        let finished = Instant::now();
        for (kind, _) in completed {
            last_run.insert((store.clone(), kind), finished);
        }
        Ok(metrics)
    }

    /// One maintenance sweep over every active store. Failures are logged
    /// per store and never propagate.
    pub async fn run_due(&self) {
        let stores: Vec<StoreId> = self
            .pools
            .registry()
            .handles()
            .into_iter()
            .filter(|h| h.state != fedsync_types::StoreState::Missing)
            .map(|h| h.id)
            .collect();
        for store in stores {
            if let Err(e) = self.optimize(&store, false).await {
                warn!("maintenance sweep skipped {store}: {e}");
            }
        }
    }
}
