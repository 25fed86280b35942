//! End-to-end sync scenarios over real on-disk stores.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tempfile::TempDir;
use tokio::sync::watch;

use fedsync_audit::AuditLog;
use fedsync_engine::{MappingFile, Orchestrator, RetryConfig, SyncEngine};
use fedsync_store::{PoolManager, StoreRegistry};
use fedsync_types::{
    EngineConfig, MissingRowPolicy, StoreId, SyncMapping, SyncStatus, SyncType, TieBreak,
};

fn mapping(source: &str, target: &str, sync_type: SyncType) -> SyncMapping {
    SyncMapping {
        source: StoreId::new(source),
        target: StoreId::new(target),
        table: "items".to_string(),
        sync_type,
        batch_size: 500,
        missing_row_policy: MissingRowPolicy::Keep,
        tie_break: TieBreak::TargetWins,
    }
}

fn setup(mappings: &[SyncMapping]) -> (TempDir, EngineConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        workspace_root: dir.path().to_path_buf(),
        backoff_base: Duration::from_millis(2),
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

fn payload_of(config: &EngineConfig, store: &str, id: i64) -> Option<String> {
    let conn = Connection::open(store_path(config, store)).unwrap();
    conn.query_row(
        "SELECT payload FROM items WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
    .unwrap()
}

fn audit_lines(config: &EngineConfig) -> Vec<String> {
    std::fs::read_to_string(config.audit_log_path())
        .unwrap_or_default()
        .lines()
        .map(|l| l.to_string())
        .collect()
}

async fn sync_once(config: &EngineConfig) -> Vec<fedsync_types::SyncOperationRecord> {
    let orchestrator = Orchestrator::new(config.clone()).unwrap();
    orchestrator.discover().await.unwrap();
    orchestrator.sync_all(None).await
}

#[tokio::test]
async fn missing_source_row_is_inserted_and_audited() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    seed(&src, 42, "hello", 1_000);

    let records = sync_once(&config).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].records_synced, 1);
    assert_eq!(records[0].conflicts_skipped, 0);
    assert_eq!(records[0].mapping.sync_type, SyncType::Incremental);

    assert_eq!(payload_of(&config, "archive", 42).as_deref(), Some("hello"));
    assert_eq!(audit_lines(&config), vec!["insert items:42"]);
}

#[tokio::test]
async fn sync_is_idempotent() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    seed(&src, 1, "a", 100);
    seed(&src, 2, "b", 200);

    let first = sync_once(&config).await;
    assert_eq!(first[0].records_synced, 2);

    let second = sync_once(&config).await;
    assert_eq!(second[0].status, SyncStatus::Success);
    assert_eq!(second[0].records_synced, 0);
    assert_eq!(second[0].conflicts_skipped, 0);
    // No second wave of audit lines.
    assert_eq!(audit_lines(&config).len(), 2);
}

#[tokio::test]
async fn newer_target_row_survives_as_a_recorded_conflict() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&src, 7, "stale", 1_000);
    seed(&tgt, 7, "fresh", 2_000);

    let orchestrator = Orchestrator::new(config.clone()).unwrap();
    orchestrator.discover().await.unwrap();
    let records = orchestrator.sync_all(None).await;

    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].records_synced, 0);
    assert_eq!(records[0].conflicts_skipped, 1);

    // The target row was not overwritten.
    assert_eq!(payload_of(&config, "archive", 7).as_deref(), Some("fresh"));
    assert_eq!(audit_lines(&config), vec!["conflict_skip items:7"]);
    assert_eq!(orchestrator.audit().conflict_count().unwrap(), 1);
}

#[tokio::test]
async fn newer_target_row_with_identical_content_converges_without_conflict() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&src, 3, "same", 1_000);
    seed(&tgt, 3, "same", 2_000);

    let orchestrator = Orchestrator::new(config.clone()).unwrap();
    orchestrator.discover().await.unwrap();
    let records = orchestrator.sync_all(None).await;

    // Only the timestamps differ, so the rows already agree.
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].records_synced, 0);
    assert_eq!(records[0].conflicts_skipped, 0);
    assert!(audit_lines(&config).is_empty());
    assert_eq!(orchestrator.audit().conflict_count().unwrap(), 0);
}

#[tokio::test]
async fn newer_source_rows_overwrite_older_target_rows() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&src, 1, "new", 2_000);
    seed(&tgt, 1, "old", 1_000);

    let records = sync_once(&config).await;
    assert_eq!(records[0].records_synced, 1);
    assert_eq!(payload_of(&config, "archive", 1).as_deref(), Some("new"));
    assert_eq!(audit_lines(&config), vec!["update items:1"]);
}

#[tokio::test]
async fn audit_line_sequence_is_deterministic_across_runs() {
    let run = |payloads: Vec<(i64, &'static str, i64)>| async move {
        let (dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
        let src = create_store(&config, "metrics");
        create_store(&config, "archive");
        for (id, payload, ts) in payloads {
            seed(&src, id, payload, ts);
        }
        sync_once(&config).await;
        let lines = audit_lines(&config);
        drop(dir);
        lines
    };

    let seeds = vec![(10, "j", 100), (2, "b", 100), (1, "a", 100), (21, "u", 100)];
    let first = run(seeds.clone()).await;
    let second = run(seeds).await;

    assert_eq!(first, second);
    // Numeric key order, not lexical.
    assert_eq!(
        first,
        vec![
            "insert items:1",
            "insert items:2",
            "insert items:10",
            "insert items:21"
        ]
    );
}

#[tokio::test]
async fn full_sync_with_delete_policy_mirrors_the_source() {
    let mut m = mapping("metrics", "archive", SyncType::Full);
    m.missing_row_policy = MissingRowPolicy::Delete;
    let (_dir, config) = setup(&[m]);
    let src = create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&src, 1, "kept", 100);
    seed(&tgt, 1, "kept", 100);
    seed(&tgt, 9, "orphan", 100);

    let records = sync_once(&config).await;
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].records_synced, 1);

    assert_eq!(payload_of(&config, "archive", 9), None);
    assert_eq!(payload_of(&config, "archive", 1).as_deref(), Some("kept"));
    assert_eq!(audit_lines(&config), vec!["delete items:9"]);
}

#[tokio::test]
async fn incremental_sync_keeps_target_only_rows() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    create_store(&config, "metrics");
    let tgt = create_store(&config, "archive");
    seed(&tgt, 9, "orphan", 100);

    let records = sync_once(&config).await;
    assert_eq!(records[0].records_synced, 0);
    assert_eq!(payload_of(&config, "archive", 9).as_deref(), Some("orphan"));
}

#[tokio::test]
async fn missing_target_table_is_created_from_the_source_schema() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    seed(&src, 1, "a", 100);
    // Target store exists but has no items table at all.
    Connection::open(store_path(&config, "archive"))
        .unwrap()
        .execute_batch("CREATE TABLE unrelated (id INTEGER PRIMARY KEY, updated_at INTEGER)")
        .unwrap();

    let records = sync_once(&config).await;
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(payload_of(&config, "archive", 1).as_deref(), Some("a"));
}

#[tokio::test]
async fn table_without_id_primary_key_is_skipped() {
    let mut m = mapping("metrics", "archive", SyncType::Incremental);
    m.table = "named".to_string();
    let (_dir, config) = setup(&[m]);
    for store in ["metrics", "archive"] {
        Connection::open(store_path(&config, store))
            .unwrap()
            .execute_batch("CREATE TABLE named (name TEXT PRIMARY KEY, updated_at INTEGER)")
            .unwrap();
    }

    // The mapping is rejected during planning and the pass carries on.
    let records = sync_once(&config).await;
    assert!(records.is_empty());
}

#[tokio::test]
async fn mapping_to_an_unknown_store_is_skipped() {
    let (_dir, config) = setup(&[mapping("metrics", "nowhere", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    seed(&src, 1, "a", 100);

    let records = sync_once(&config).await;
    assert!(records.is_empty());
    assert!(audit_lines(&config).is_empty());
}

#[tokio::test]
async fn persistently_locked_target_ends_as_failed() {
    let (_dir, config) = setup(&[mapping("metrics", "archive", SyncType::Incremental)]);
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    seed(&src, 1, "a", 100);

    // A RESERVED lock lets the planner read but blocks every write for the
    // whole retry budget.
    let blocker = Connection::open(store_path(&config, "archive")).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let records = sync_once(&config).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Failed);
    assert_eq!(records[0].records_synced, 0);

    blocker.execute_batch("ROLLBACK").unwrap();
    // Nothing landed in the target or the audit line log.
    assert_eq!(payload_of(&config, "archive", 1), None);
    assert!(audit_lines(&config).is_empty());
}

#[tokio::test(start_paused = true)]
async fn write_retries_stop_at_the_attempt_budget() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        workspace_root: dir.path().to_path_buf(),
        backoff_base: Duration::from_millis(100),
        retry_budget: 3,
        acquire_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    std::fs::create_dir_all(config.store_root()).unwrap();
    let file = MappingFile::new(vec![mapping("metrics", "archive", SyncType::Incremental)]);
    std::fs::write(
        config.mappings_path(),
        serde_json::to_string_pretty(&file).unwrap(),
    )
    .unwrap();
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    seed(&src, 1, "a", 100);

    let blocker = Connection::open(store_path(&config, "archive")).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    // On the paused clock only the backoff sleeps advance time, so a
    // three-attempt budget elapses exactly two backoffs (100 + 200 ms).
    let start = tokio::time::Instant::now();
    let records = sync_once(&config).await;
    let elapsed = start.elapsed();

    assert_eq!(records[0].status, SyncStatus::Failed);
    assert!(
        elapsed >= Duration::from_millis(300),
        "gave up early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(700),
        "a fourth attempt ran: {elapsed:?}"
    );

    blocker.execute_batch("ROLLBACK").unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_connection_pool_is_retried_then_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        workspace_root: dir.path().to_path_buf(),
        ..Default::default()
    };
    std::fs::create_dir_all(config.store_root()).unwrap();
    create_store(&config, "metrics");
    create_store(&config, "archive");

    let registry = Arc::new(StoreRegistry::new());
    registry.discover(&[config.store_root()]).unwrap();
    let pools = Arc::new(PoolManager::new(
        Arc::clone(&registry),
        1,
        Duration::from_secs(1),
        Duration::from_secs(300),
    ));
    let audit = Arc::new(
        AuditLog::open(&config.audit_db_path(), &config.audit_log_path()).unwrap(),
    );
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let engine = SyncEngine::new(
        Arc::clone(&pools),
        Arc::clone(&audit),
        RetryConfig::new(3, Duration::from_millis(100)),
        cancel_rx,
    );

    // Hold the target pool's only connection so every acquisition times out.
    let held = pools.acquire(&StoreId::new("archive")).await.unwrap();

    let start = tokio::time::Instant::now();
    let result = engine
        .sync(&mapping("metrics", "archive", SyncType::Incremental))
        .await;
    let elapsed = start.elapsed();
    drop(held);

    assert!(result.is_err());
    // Three timed-out acquisitions plus two backoffs on the paused clock.
    assert!(
        elapsed >= Duration::from_millis(3_300),
        "gave up early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(4_500),
        "a fourth attempt ran: {elapsed:?}"
    );

    let ops = audit.recent_operations(1).unwrap();
    assert_eq!(ops[0].status, "FAILED");
}

#[tokio::test]
async fn batches_commit_independently() {
    let mut m = mapping("metrics", "archive", SyncType::Incremental);
    m.batch_size = 2;
    let (_dir, config) = setup(&[m]);
    let src = create_store(&config, "metrics");
    create_store(&config, "archive");
    for id in 1..=5 {
        seed(&src, id, "row", 100);
    }

    let records = sync_once(&config).await;
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].records_synced, 5);
    assert_eq!(audit_lines(&config).len(), 5);
}
