//! FedSync command line front end.
//!
//! One-shot subcommands (`sync`, `optimize`, `validate`, `report`) run a
//! single engine phase and exit; `run` starts the periodic orchestration
//! loop and keeps it alive until interrupted.
//!
//! Usage:
//!   fedsync --root /srv/fed sync
//!   fedsync report --limit 50

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fedsync_engine::Orchestrator;
use fedsync_types::{EngineConfig, StoreId, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "fedsync")]
#[command(about = "Cross-store SQLite synchronization engine")]
struct Args {
    /// Workspace root (overrides FEDSYNC_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass over the configured mappings
    Sync {
        /// Only run mappings touching this store
        #[arg(long)]
        store: Option<StoreId>,
    },
    /// Run store maintenance (compaction, stats refresh, reindex)
    Optimize {
        /// Only maintain this store
        #[arg(long)]
        store: Option<StoreId>,
        /// Run every action regardless of cadence
        #[arg(long)]
        force: bool,
    },
    /// Run one consistency validation pass
    Validate,
    /// Print recent audit events and sync operations
    Report {
        /// Maximum entries per section
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Run the periodic orchestration loop until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = EngineConfig::from_env()?;
    if let Some(root) = args.root {
        config.workspace_root = root;
    }
    info!("FedSync workspace: {}", config.workspace_root.display());
    let orchestrator = Orchestrator::new(config)?;

    match args.command {
        Command::Sync { store } => {
            orchestrator.discover().await?;
            let records = orchestrator.sync_all(store.as_ref()).await;
            if records.is_empty() {
                info!("no applicable sync mappings");
            }
            for record in &records {
                info!(
                    "{} {} -> {} table {}: {} ({} synced, {} conflicts, {} ms)",
                    record.status,
                    record.mapping.source,
                    record.mapping.target,
                    record.mapping.table,
                    record.sync_id,
                    record.records_synced,
                    record.conflicts_skipped,
                    record.duration_ms,
                );
            }
            let unrecovered = records
                .iter()
                .filter(|r| r.status != SyncStatus::Success)
                .count();
            if unrecovered > 0 {
                anyhow::bail!("{unrecovered} sync mapping(s) did not complete");
            }
        }
        Command::Optimize { store, force } => {
            orchestrator.discover().await?;
            let metrics = orchestrator.optimize_all(store.as_ref(), force).await;
            for metric in &metrics {
                info!("{} {} = {:.1}", metric.store, metric.kind, metric.value);
            }
            info!("recorded {} maintenance metric(s)", metrics.len());
        }
        Command::Validate => {
            orchestrator.discover().await?;
            let result = orchestrator.validate().await?;
            info!(
                "validation {}: {}/{} checks passed, score {:.1}, {} critical",
                result.check_id,
                result.checks_passed,
                result.checks_total,
                result.consistency_score,
                result.critical_issues,
            );
        }
        Command::Report { limit } => {
            let audit = orchestrator.audit();
            println!("recent sync operations:");
            for op in audit.recent_operations(limit)? {
                println!(
                    "  {} {} {} -> {} table {}: {} rows, {} ms ({})",
                    op.timestamp,
                    op.status,
                    op.source,
                    op.target,
                    op.table,
                    op.records_synced,
                    op.duration_ms,
                    op.sync_id,
                );
            }
            println!("recent audit events:");
            for event in audit.recent_events(limit)? {
                println!(
                    "  {} {} {}:{} ({} -> {})",
                    event.timestamp, event.action, event.table, event.row_key,
                    event.source, event.target,
                );
            }
        }
        Command::Run => {
            let handle = orchestrator.spawn();
            info!("orchestration loop running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
    }
    Ok(())
}
