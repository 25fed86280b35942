//! The background orchestration loop.
//!
//! One cycle runs discovery, then sync, then maintenance, then validation.
//! A failure anywhere is logged and the cycle moves on; the loop itself
//! never dies with a store. Shutdown is cooperative: the cancel flag lets
//! in-flight syncs finish their current batch before the loop exits.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use fedsync_audit::AuditLog;
use fedsync_store::{PoolManager, StoreRegistry};
use fedsync_types::{
    ConsistencyCheckResult, EngineConfig, PerformanceMetric, StoreHandle, StoreId, StoreState,
    SyncMapping, SyncOperationRecord,
};

use crate::engine::SyncEngine;
use crate::error::{EngineError, EngineResult};
use crate::maintenance::MaintenanceScheduler;
use crate::mapping::load_mappings;
use crate::retry::RetryConfig;
use crate::validator::ConsistencyValidator;

/// Commands accepted by a spawned orchestrator.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Run one full cycle now, outside the timer cadence. The sender is
    /// notified once the cycle has finished.
    RunCycle(oneshot::Sender<()>),
    /// Stop the loop after any in-flight work drains.
    Shutdown,
}

/// Owns every engine component and drives them as one federation.
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<StoreRegistry>,
    audit: Arc<AuditLog>,
    engine: Arc<SyncEngine>,
    maintenance: Arc<MaintenanceScheduler>,
    validator: Arc<ConsistencyValidator>,
    mappings: Vec<SyncMapping>,
    cancel_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Wires up registry, pools, audit log and all engine components from
    /// one configuration. Mappings are loaded once here; edits to the
    /// mapping file require a restart.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let registry = Arc::new(StoreRegistry::new());
        let pools = Arc::new(PoolManager::new(
            Arc::clone(&registry),
            config.pool_size,
            config.acquire_timeout,
            config.max_connection_lifetime,
        ));
        let audit = Arc::new(AuditLog::open(
            &config.audit_db_path(),
            &config.audit_log_path(),
        )?);
        let mappings = load_mappings(&config.mappings_path())?;
        info!("loaded {} sync mapping(s)", mappings.len());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let retry = RetryConfig::new(config.retry_budget as u32, config.backoff_base);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&pools),
            Arc::clone(&audit),
            retry,
            cancel_rx,
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            Arc::clone(&pools),
            Arc::clone(&audit),
            &config,
        ));
        let validator = Arc::new(ConsistencyValidator::new(
            pools,
            Arc::clone(&audit),
            config.alert_threshold,
            config.drift_tolerance,
        ));

        Ok(Self {
            config,
            registry,
            audit,
            engine,
            maintenance,
            validator,
            mappings,
            cancel_tx,
        })
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn mappings(&self) -> &[SyncMapping] {
        &self.mappings
    }

    /// Refreshes the store catalog and snapshots every handle into the
    /// audit log.
    pub async fn discover(&self) -> EngineResult<Vec<StoreHandle>> {
        let registry = Arc::clone(&self.registry);
        let roots = vec![self.config.store_root()];
        let handles = tokio::task::spawn_blocking(move || registry.discover(&roots))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        for handle in &handles {
            self.audit.record_store_handle(handle)?;
        }
        Ok(handles)
    }

    /// Runs every applicable sync mapping. Mappings that share a target
    /// store run sequentially in registration order; distinct targets run
    /// concurrently, at most `max_parallel_syncs` at a time. A failing
    /// mapping is logged and skipped.
    pub async fn sync_all(&self, filter: Option<&StoreId>) -> Vec<SyncOperationRecord> {
        let mut groups: BTreeMap<StoreId, Vec<SyncMapping>> = BTreeMap::new();
        for mapping in &self.mappings {
            let selected = match filter {
                Some(store) => mapping.source == *store || mapping.target == *store,
                None => true,
            };
            if selected {
                groups
                    .entry(mapping.target.clone())
                    .or_default()
                    .push(mapping.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_syncs.max(1)));
        let mut tasks = JoinSet::new();
        for (target, group) in groups {
            let engine = Arc::clone(&self.engine);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Vec::new();
                };
                let mut records = Vec::new();
                for mapping in group {
                    match engine.sync(&mapping).await {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!("sync of {} into {target} skipped: {e}", mapping.table);
                        }
                    }
                }
                records
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut records) => all.append(&mut records),
                Err(e) => warn!("sync task panicked: {e}"),
            }
        }
        all
    }

    /// Runs due (or, with `force`, all) maintenance on the selected active
    /// stores.
    pub async fn optimize_all(
        &self,
        filter: Option<&StoreId>,
        force: bool,
    ) -> Vec<PerformanceMetric> {
        let stores: Vec<StoreId> = self
            .registry
            .handles()
            .into_iter()
            .filter(|h| h.state != StoreState::Missing)
            .filter(|h| filter.is_none_or(|f| h.id == *f))
            .map(|h| h.id)
            .collect();
        let mut metrics = Vec::new();
        for store in stores {
            match self.maintenance.optimize(&store, force).await {
                Ok(mut m) => metrics.append(&mut m),
                Err(e) => warn!("maintenance of {store} skipped: {e}"),
            }
        }
        metrics
    }

    /// Runs one validation pass over the current mappings.
    pub async fn validate(&self) -> EngineResult<ConsistencyCheckResult> {
        self.validator.validate(&self.mappings).await
    }

    /// One full orchestration cycle. Individual phase failures are logged
    /// and never abort the cycle.
    pub async fn run_cycle(&self) {
        info!("orchestration cycle starting");
        if let Err(e) = self.discover().await {
            warn!("discovery failed: {e}");
        }
        let records = self.sync_all(None).await;
        debug!("cycle produced {} sync record(s)", records.len());
        self.maintenance.run_due().await;
        if let Err(e) = self.validate().await {
            warn!("validation failed: {e}");
        }
        info!("orchestration cycle complete");
    }

    /// Moves the orchestrator onto the runtime as a periodic background
    /// loop and returns a handle for commands and shutdown.
    pub fn spawn(self) -> OrchestratorHandle {
        let (commands, mut command_rx) = mpsc::channel::<OrchestratorCommand>(8);
        let cancel = self.cancel_tx.clone();
        let orchestrator = Arc::new(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.run_cycle().await,
                    command = command_rx.recv() => match command {
                        Some(OrchestratorCommand::RunCycle(done)) => {
                            orchestrator.run_cycle().await;
                            let _ = done.send(());
                        }
                        Some(OrchestratorCommand::Shutdown) | None => {
                            info!("orchestrator shutting down");
                            break;
                        }
                    }
                }
            }
        });

        OrchestratorHandle {
            commands,
            cancel,
            task,
        }
    }
}

/// Handle to a spawned orchestration loop.
pub struct OrchestratorHandle {
    commands: mpsc::Sender<OrchestratorCommand>,
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Runs an immediate cycle and waits for it to finish, so a shutdown
    /// issued right after cannot cancel it mid-flight. Returns false if
    /// the loop is gone.
    pub async fn run_cycle(&self) -> bool {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(OrchestratorCommand::RunCycle(done))
            .await
            .is_err()
        {
            return false;
        }
        finished.await.is_ok()
    }

    /// Signals cancellation, asks the loop to stop and waits for it.
    /// In-flight syncs finish their current batch first.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.commands.send(OrchestratorCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("orchestrator task ended abnormally: {e}");
        }
    }
}
