//! Validation and maintenance passes over real on-disk stores.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection};
use tempfile::TempDir;

use fedsync_engine::{MappingFile, Orchestrator};
use fedsync_types::{
    EngineConfig, MetricKind, MissingRowPolicy, StoreId, SyncMapping, SyncType, TieBreak,
};

fn mapping(source: &str, target: &str, table: &str) -> SyncMapping {
    SyncMapping {
        source: StoreId::new(source),
        target: StoreId::new(target),
        table: table.to_string(),
        sync_type: SyncType::Incremental,
        batch_size: 500,
        missing_row_policy: MissingRowPolicy::Keep,
        tie_break: TieBreak::TargetWins,
    }
}

fn setup(mappings: &[SyncMapping]) -> (TempDir, EngineConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        workspace_root: dir.path().to_path_buf(),
        acquire_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    std::fs::create_dir_all(config.store_root()).unwrap();
    let file = MappingFile::new(mappings.to_vec());
    std::fs::write(
        config.mappings_path(),
        serde_json::to_string_pretty(&file).unwrap(),
    )
    .unwrap();
    (dir, config)
}

fn store_path(config: &EngineConfig, name: &str) -> PathBuf {
    config.store_root().join(format!("{name}.db"))
}

fn create_store(config: &EngineConfig, name: &str) -> Connection {
    let conn = Connection::open(store_path(config, name)).unwrap();
    conn.execute_batch(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, payload TEXT, updated_at INTEGER NOT NULL)",
    )
    .unwrap();
    conn
}

fn seed(conn: &Connection, id: i64, payload: &str, updated_at: i64) {
    conn.execute(
        "REPLACE INTO items (id, payload, updated_at) VALUES (?1, ?2, ?3)",
        params![id, payload, updated_at],
    )
    .unwrap();
}

#[tokio::test]
async fn converged_stores_score_a_clean_hundred() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", "items")]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&src, 1, "a", 100);
    seed(&tgt, 1, "a", 100);

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let result = orchestrator.validate().await.unwrap();

    // 2 integrity + presence + count parity + checksum.
    assert_eq!(result.checks_total, 5);
    assert_eq!(result.checks_passed, 5);
    assert_eq!(result.consistency_score, 100.0);
    assert_eq!(result.critical_issues, 0);
    assert_eq!(result.stores_involved.len(), 2);
}

#[tokio::test]
async fn diverged_content_fails_only_the_checksum_check() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", "items")]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    // Same row count, different content: count parity passes, checksum
    // fails. One warning failure out of five checks.
    seed(&src, 1, "a", 100);
    seed(&tgt, 1, "b", 100);

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let result = orchestrator.validate().await.unwrap();

    assert_eq!(result.checks_total, 5);
    assert_eq!(result.checks_passed, 4);
    assert_eq!(result.consistency_score, 80.0);
    assert_eq!(result.critical_issues, 0);
}

#[tokio::test]
async fn count_drift_fails_parity_within_zero_tolerance() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", "items")]);
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    seed(&src, 1, "a", 100);
    seed(&src, 2, "b", 100);

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let result = orchestrator.validate().await.unwrap();

    // Count parity and checksum both fail; presence and integrity pass.
    assert_eq!(result.checks_total, 5);
    assert_eq!(result.checks_passed, 3);
    assert_eq!(result.consistency_score, 60.0);
}

#[tokio::test]
async fn missing_mapped_table_is_a_critical_issue() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", "widgets")]);
    create_store(&config, "metrics");
    create_store(&config, "archive");

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let result = orchestrator.validate().await.unwrap();

    // 2 integrity pass; presence fails critically; the dependent count and
    // checksum checks are not run.
    assert_eq!(result.checks_total, 3);
    assert_eq!(result.checks_passed, 2);
    assert_eq!(result.critical_issues, 1);
    assert!(result.consistency_score < 90.0);
}

#[tokio::test]
async fn mappings_over_missing_stores_are_not_checked() {
    let (_dir, config) = setup(&[mapping("metrics", "nowhere", "items")]);
    create_store(&config, "metrics");

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let result = orchestrator.validate().await.unwrap();

    // Only the one active store's integrity check runs.
    assert_eq!(result.checks_total, 1);
    assert_eq!(result.consistency_score, 100.0);
}

#[tokio::test]
async fn forced_maintenance_records_timing_and_size_metrics() {
    let (_dir, config) = setup(&[]);
    let conn = create_store(&config, "metrics");
    for id in 1..=50 {
        seed(&conn, id, "payload", 100);
    }
    conn.execute("DELETE FROM items WHERE id > 25", []).unwrap();

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();
    let metrics = orchestrator
        .optimize_all(Some(&StoreId::new("metrics")), true)
        .await;

    let kinds: Vec<MetricKind> = metrics.iter().map(|m| m.kind).collect();
    assert!(kinds.contains(&MetricKind::CompactionMs));
    assert!(kinds.contains(&MetricKind::StatsRefreshMs));
    assert!(kinds.contains(&MetricKind::ReindexMs));

    // Compaction measures the file on both sides; half the rows were
    // deleted above, so VACUUM must not grow the file.
    let size_of = |kind: MetricKind| {
        metrics
            .iter()
            .find(|m| m.kind == kind)
            .map(|m| m.value)
            .unwrap()
    };
    let before = size_of(MetricKind::SizeBeforeBytes);
    let after = size_of(MetricKind::SizeAfterBytes);
    assert!(before > 0.0);
    assert!(after > 0.0);
    assert!(after <= before);

    // The store still works after VACUUM/ANALYZE/REINDEX.
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 25);
}

#[tokio::test]
async fn maintenance_cadence_skips_freshly_maintained_stores() {
    let (_dir, config) = setup(&[]);
    create_store(&config, "metrics");

    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.discover().await.unwrap();

    let first = orchestrator.optimize_all(None, false).await;
    assert!(!first.is_empty());

    // Everything just ran; nothing is due again.
    let second = orchestrator.optimize_all(None, false).await;
    assert!(second.is_empty());
}
