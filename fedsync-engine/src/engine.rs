//! Deterministic cross-store table synchronization.
//!
//! A sync run snapshots the mapped table on both sides, computes a plan in
//! canonical row-key order, then applies the plan in batches. Each batch is
//! one target transaction whose audit entries are appended before the data
//! commits, so no mutation ever lands without its audit trail. Conflicts
//! (target strictly newer than source) are recorded but never overwrite the
//! target row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fedsync_audit::{AuditLog, SyncAuditEntry};
use fedsync_store::{sanitize_identifier, PoolManager, PooledConnection};
use fedsync_types::{
    AuditAction, AuditLine, ConflictRecord, ConflictResolution, MissingRowPolicy, SyncId,
    SyncMapping, SyncOperationRecord, SyncStatus, SyncType, TieBreak,
};

use crate::error::{EngineError, EngineResult};
use crate::retry::{backoff_sleep, RetryConfig};

/// One row as read from a store, with its reconciliation metadata.
#[derive(Debug, Clone)]
struct TableRow {
    key: String,
    id: Value,
    updated_at: i64,
    /// All columns in table order, `id` and `updated_at` included.
    cells: Vec<(String, Value)>,
}

impl TableRow {
    /// Order-insensitive view of the business content: every cell except
    /// the key and the reconciliation timestamp. Two rows with the same
    /// content but different `updated_at` values have converged.
    fn content(&self) -> HashMap<&str, &Value> {
        self.cells
            .iter()
            .filter(|(c, _)| c.as_str() != "id" && c.as_str() != "updated_at")
            .map(|(c, v)| (c.as_str(), v))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum PlannedAction {
    Insert(TableRow),
    Update(TableRow),
    Delete { key: String, id: Value },
    ConflictSkip(ConflictRecord),
}

impl PlannedAction {
    fn audit_action(&self) -> AuditAction {
        match self {
            PlannedAction::Insert(_) => AuditAction::Insert,
            PlannedAction::Update(_) => AuditAction::Update,
            PlannedAction::Delete { .. } => AuditAction::Delete,
            PlannedAction::ConflictSkip(_) => AuditAction::ConflictSkip,
        }
    }

    fn row_key(&self) -> &str {
        match self {
            PlannedAction::Insert(row) | PlannedAction::Update(row) => &row.key,
            PlannedAction::Delete { key, .. } => key,
            PlannedAction::ConflictSkip(c) => &c.row_key,
        }
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    synced: u64,
    conflicts: u64,
}

/// The synchronization engine. Cheap to share behind an [`Arc`].
pub struct SyncEngine {
    pools: Arc<PoolManager>,
    audit: Arc<AuditLog>,
    retry: RetryConfig,
    cancel: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        pools: Arc<PoolManager>,
        audit: Arc<AuditLog>,
        retry: RetryConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pools,
            audit,
            retry,
            cancel,
        }
    }

    /// Runs one sync for a mapping and returns the finalized record.
    ///
    /// Batch failures do not surface as `Err`: they are absorbed into the
    /// record's terminal status (`PARTIAL` or `FAILED`) so one bad mapping
    /// never aborts a whole cycle. `Err` is reserved for setup problems
    /// such as an inactive store or an unusable table.
    pub async fn sync(&self, mapping: &SyncMapping) -> EngineResult<SyncOperationRecord> {
        let table = sanitize_identifier(&mapping.table)
            .map_err(|e| EngineError::MappingConfig(e.to_string()))?
            .to_string();

        let registry = self.pools.registry();
        if !registry.is_active(&mapping.source) {
            return Err(EngineError::MissingStore(mapping.source.clone()));
        }
        if !registry.is_active(&mapping.target) {
            return Err(EngineError::MissingStore(mapping.target.clone()));
        }

        let sync_id = SyncId::new();
        let started = Instant::now();
        info!(
            "sync {sync_id}: {} -> {} table {} ({})",
            mapping.source, mapping.target, table, mapping.sync_type
        );
        self.audit
            .record_operation(&make_record(sync_id, mapping, 0, 0, 0, SyncStatus::Pending))?;

        // Acquisition timeouts are transient and get the same retry budget
        // as batch application.
        let mut cancel = self.cancel.clone();
        let mut attempt = 1u32;
        let (src, tgt) = loop {
            let acquired = async {
                let src = self.pools.acquire(&mapping.source).await?;
                let tgt = self.pools.acquire(&mapping.target).await?;
                Ok::<_, EngineError>((src, tgt))
            }
            .await;
            match acquired {
                Ok(pair) => break pair,
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        "acquiring connections for table {table} failed (attempt {attempt}): {e}"
                    );
                    if backoff_sleep(&self.retry, attempt, &mut cancel).await.is_err() {
                        self.finalize(sync_id, mapping, 0, 0, &started, SyncStatus::Failed)?;
                        return Err(EngineError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    self.finalize(sync_id, mapping, 0, 0, &started, SyncStatus::Failed)?;
                    return Err(e);
                }
            }
        };

        let mapping_snapshot = mapping.clone();
        let table_snapshot = table.clone();
        let (tgt, plan) = tokio::task::spawn_blocking(move || {
            let res = build_plan(&src, &tgt, &mapping_snapshot, &table_snapshot);
            drop(src);
            (tgt, res)
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?;

        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                drop(tgt);
                self.finalize(sync_id, mapping, 0, 0, &started, SyncStatus::Failed)?;
                return Err(e);
            }
        };
        debug!("sync {sync_id}: plan has {} actions", plan.len());

        let (synced, conflicts, batches_applied, aborted) =
            self.apply_plan(mapping, &table, plan, tgt).await?;

        let status = if !aborted {
            SyncStatus::Success
        } else if batches_applied > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        };
        let record = self.finalize(sync_id, mapping, synced, conflicts, &started, status)?;
        info!(
            "sync {sync_id}: {} ({} synced, {} conflicts, {} ms)",
            status, synced, conflicts, record.duration_ms
        );
        Ok(record)
    }

    /// Writes the terminal operation record. The pending row stays behind
    /// untouched; the log is append-only.
    fn finalize(
        &self,
        sync_id: SyncId,
        mapping: &SyncMapping,
        synced: u64,
        conflicts: u64,
        started: &Instant,
        status: SyncStatus,
    ) -> EngineResult<SyncOperationRecord> {
        let record = make_record(
            sync_id,
            mapping,
            synced,
            conflicts,
            started.elapsed().as_millis() as u64,
            status,
        );
        self.audit.record_operation(&record)?;
        Ok(record)
    }

    /// Applies the plan batch by batch. Returns (synced, conflicts,
    /// batches applied, aborted).
    async fn apply_plan(
        &self,
        mapping: &SyncMapping,
        table: &str,
        plan: Vec<PlannedAction>,
        tgt: PooledConnection,
    ) -> EngineResult<(u64, u64, usize, bool)> {
        let batch_size = mapping.batch_size.max(1);
        let plan = Arc::new(plan);
        let mut cancel = self.cancel.clone();

        let mut tgt_slot = Some(tgt);
        let mut synced = 0u64;
        let mut conflicts = 0u64;
        let mut batches_applied = 0usize;
        let mut aborted = false;

        let mut start = 0usize;
        'batches: while start < plan.len() {
            // Shutdown is honored between batches, never inside one.
            if *cancel.borrow() {
                warn!("sync of table {table} stopping early: shutdown requested");
                aborted = true;
                break;
            }
            let end = (start + batch_size).min(plan.len());

            let mut attempt = 1u32;
            loop {
                let guard = tgt_slot
                    .take()
                    .ok_or_else(|| EngineError::Task("connection slot empty".into()))?;
                let plan_ref = Arc::clone(&plan);
                let audit = Arc::clone(&self.audit);
                let mapping_snapshot = mapping.clone();
                let table_snapshot = table.to_string();
                let (guard, res) = tokio::task::spawn_blocking(move || {
                    let mut guard = guard;
                    let res = apply_batch(
                        &mut guard,
                        &audit,
                        &mapping_snapshot,
                        &table_snapshot,
                        &plan_ref[start..end],
                    );
                    (guard, res)
                })
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?;
                tgt_slot = Some(guard);

                match res {
                    Ok(out) => {
                        synced += out.synced;
                        conflicts += out.conflicts;
                        batches_applied += 1;
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                        warn!(
                            "batch {start}..{end} of table {table} failed (attempt {attempt}): {e}"
                        );
                        if backoff_sleep(&self.retry, attempt, &mut cancel).await.is_err() {
                            aborted = true;
                            break 'batches;
                        }
                        attempt += 1;
                    }
                    Err(e) => {
                        warn!(
                            "batch {start}..{end} of table {table} failed permanently after \
                             {attempt} attempt(s): {e}"
                        );
                        if let (Some(guard), EngineError::Database(_)) = (tgt_slot.as_mut(), &e) {
                            guard.mark_broken();
                        }
                        aborted = true;
                        break 'batches;
                    }
                }
            }
            start = end;
        }

        drop(tgt_slot);
        Ok((synced, conflicts, batches_applied, aborted))
    }
}

fn make_record(
    sync_id: SyncId,
    mapping: &SyncMapping,
    synced: u64,
    conflicts: u64,
    duration_ms: u64,
    status: SyncStatus,
) -> SyncOperationRecord {
    SyncOperationRecord {
        sync_id,
        mapping: mapping.clone(),
        records_synced: synced,
        conflicts_skipped: conflicts,
        duration_ms,
        status,
        timestamp: Utc::now(),
    }
}

// ── Blocking plan construction ───────────────────────────────────

fn build_plan(
    src: &Connection,
    tgt: &Connection,
    mapping: &SyncMapping,
    table: &str,
) -> EngineResult<Vec<PlannedAction>> {
    ensure_target_table(src, tgt, table)?;
    if !primary_key_is_id(src, table)? {
        return Err(EngineError::MappingConfig(format!(
            "table {table} does not use a single `id` primary key"
        )));
    }
    let source_rows = read_table_rows(src, table)?;
    let target_rows = read_table_rows(tgt, table)?;
    Ok(compute_plan(mapping, table, source_rows, target_rows))
}

/// Replays the source's CREATE TABLE statement on the target when the
/// mapped table does not exist there yet.
fn ensure_target_table(src: &Connection, tgt: &Connection, table: &str) -> EngineResult<()> {
    let create: Option<Option<String>> = src
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    let Some(Some(create)) = create else {
        return Err(EngineError::Integrity(format!(
            "source has no table named {table}"
        )));
    };
    let exists: Option<i64> = tgt
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        debug!("creating table {table} on target from source schema");
        tgt.execute_batch(&create)?;
    }
    Ok(())
}

fn primary_key_is_id(conn: &Connection, table: &str) -> EngineResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
    })?;
    let mut pk_columns = Vec::new();
    for row in rows {
        let (name, pk) = row?;
        if pk > 0 {
            pk_columns.push(name);
        }
    }
    Ok(pk_columns == ["id"])
}

fn read_table_rows(conn: &Connection, table: &str) -> EngineResult<HashMap<String, TableRow>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\""))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    for column in &columns {
        sanitize_identifier(column)
            .map_err(|e| EngineError::Integrity(format!("table {table}: {e}")))?;
    }
    let id_idx = columns
        .iter()
        .position(|c| c == "id")
        .ok_or_else(|| EngineError::Integrity(format!("table {table} lacks an id column")))?;
    let ts_idx = columns.iter().position(|c| c == "updated_at").ok_or_else(|| {
        EngineError::Integrity(format!("table {table} lacks an updated_at column"))
    })?;

    let mut out = HashMap::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            cells.push((name.clone(), row.get::<_, Value>(i)?));
        }
        let id = cells[id_idx].1.clone();
        let updated_at = match &cells[ts_idx].1 {
            Value::Integer(ms) => *ms,
            Value::Null => 0,
            other => {
                return Err(EngineError::Integrity(format!(
                    "table {table}: updated_at must be INTEGER epoch milliseconds, got {other:?}"
                )));
            }
        };
        let key = row_key_display(table, &id)?;
        out.insert(
            key.clone(),
            TableRow {
                key,
                id,
                updated_at,
                cells,
            },
        );
    }
    Ok(out)
}

fn row_key_display(table: &str, id: &Value) -> EngineResult<String> {
    match id {
        Value::Integer(v) => Ok(v.to_string()),
        Value::Text(v) => Ok(v.clone()),
        Value::Real(v) => Ok(v.to_string()),
        Value::Blob(v) => Ok(hex::encode(v)),
        Value::Null => Err(EngineError::Integrity(format!(
            "table {table} has a row with a NULL id"
        ))),
    }
}

/// Canonical plan order: numeric keys first in numeric order, then the
/// rest lexically. Two runs over identical snapshots produce an identical
/// plan and therefore an identical audit line sequence.
fn compare_row_keys(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn compute_plan(
    mapping: &SyncMapping,
    table: &str,
    source: HashMap<String, TableRow>,
    target: HashMap<String, TableRow>,
) -> Vec<PlannedAction> {
    let mut keys: Vec<&String> = source.keys().collect();
    for key in target.keys() {
        if !source.contains_key(key) {
            keys.push(key);
        }
    }
    keys.sort_by(|a, b| compare_row_keys(a, b));

    let mut plan = Vec::new();
    for key in keys {
        match (source.get(key), target.get(key)) {
            (Some(src_row), None) => plan.push(PlannedAction::Insert(src_row.clone())),
            (Some(src_row), Some(tgt_row)) => {
                if src_row.updated_at > tgt_row.updated_at {
                    plan.push(PlannedAction::Update(src_row.clone()));
                } else if src_row.updated_at < tgt_row.updated_at
                    && src_row.content() != tgt_row.content()
                {
                    let resolution = match mapping.tie_break {
                        TieBreak::TargetWins => ConflictResolution::TargetWins,
                        TieBreak::SourceWins => ConflictResolution::SourceWins,
                    };
                    plan.push(PlannedAction::ConflictSkip(ConflictRecord {
                        table: table.to_string(),
                        row_key: key.clone(),
                        source_updated_at: src_row.updated_at,
                        target_updated_at: tgt_row.updated_at,
                        resolution,
                    }));
                }
                // Equal timestamps, or an older-but-identical source row,
                // mean the pair has converged: no action.
            }
            (None, Some(tgt_row)) => {
                if mapping.sync_type == SyncType::Full
                    && mapping.missing_row_policy == MissingRowPolicy::Delete
                {
                    plan.push(PlannedAction::Delete {
                        key: tgt_row.key.clone(),
                        id: tgt_row.id.clone(),
                    });
                }
            }
            (None, None) => unreachable!("key came from one of the two maps"),
        }
    }
    plan
}

// ── Blocking batch application ───────────────────────────────────

/// Applies one batch inside a single target transaction.
///
/// Audit log lines and structured rows are appended before the data
/// commits; an audit failure rolls the whole batch back. The reverse skew
/// (audit entry without its data commit) is possible on a crash between
/// the appends and the commit, and is the accepted direction: the log may
/// over-report, never under-report.
fn apply_batch(
    conn: &mut Connection,
    audit: &AuditLog,
    mapping: &SyncMapping,
    table: &str,
    actions: &[PlannedAction],
) -> EngineResult<BatchOutcome> {
    let tx = conn.transaction()?;
    let now = Utc::now();
    let mut out = BatchOutcome::default();
    let mut entries = Vec::with_capacity(actions.len());
    let mut conflict_records = Vec::new();

    for action in actions {
        match action {
            PlannedAction::Insert(row) | PlannedAction::Update(row) => {
                let columns: Vec<String> =
                    row.cells.iter().map(|(c, _)| format!("\"{c}\"")).collect();
                let placeholders: Vec<String> =
                    (1..=row.cells.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "REPLACE INTO \"{table}\" ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                );
                tx.execute(&sql, rusqlite::params_from_iter(row.cells.iter().map(|(_, v)| v)))?;
                out.synced += 1;
            }
            PlannedAction::Delete { id, .. } => {
                tx.execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), params![id])?;
                out.synced += 1;
            }
            PlannedAction::ConflictSkip(conflict) => {
                out.conflicts += 1;
                conflict_records.push(conflict.clone());
            }
        }
        entries.push(SyncAuditEntry {
            source: mapping.source.clone(),
            target: mapping.target.clone(),
            line: AuditLine::new(action.audit_action(), table, action.row_key()),
            timestamp: now,
        });
    }

    audit.append_sync_entries(&entries)?;
    for conflict in &conflict_records {
        audit.record_conflict(&mapping.source, &mapping.target, conflict, now)?;
    }
    tx.commit()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsync_types::StoreId;

    fn mapping(sync_type: SyncType, policy: MissingRowPolicy, tie: TieBreak) -> SyncMapping {
        SyncMapping {
            source: StoreId::new("alpha"),
            target: StoreId::new("beta"),
            table: "items".to_string(),
            sync_type,
            batch_size: 500,
            missing_row_policy: policy,
            tie_break: tie,
        }
    }

    fn row(id: i64, updated_at: i64, payload: &str) -> TableRow {
        TableRow {
            key: id.to_string(),
            id: Value::Integer(id),
            updated_at,
            cells: vec![
                ("id".to_string(), Value::Integer(id)),
                ("payload".to_string(), Value::Text(payload.to_string())),
                ("updated_at".to_string(), Value::Integer(updated_at)),
            ],
        }
    }

    fn keyed(rows: Vec<TableRow>) -> HashMap<String, TableRow> {
        rows.into_iter().map(|r| (r.key.clone(), r)).collect()
    }

    #[test]
    fn numeric_keys_sort_numerically() {
        assert_eq!(compare_row_keys("2", "10"), std::cmp::Ordering::Less);
        assert_eq!(compare_row_keys("10", "abc"), std::cmp::Ordering::Less);
        assert_eq!(compare_row_keys("abc", "abd"), std::cmp::Ordering::Less);
    }

    #[test]
    fn newer_source_row_is_an_update() {
        let m = mapping(SyncType::Incremental, MissingRowPolicy::Keep, TieBreak::TargetWins);
        let plan = compute_plan(
            &m,
            "items",
            keyed(vec![row(1, 200, "new")]),
            keyed(vec![row(1, 100, "old")]),
        );
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], PlannedAction::Update(r) if r.key == "1"));
    }

    #[test]
    fn newer_target_row_is_a_conflict_not_an_overwrite() {
        let m = mapping(SyncType::Incremental, MissingRowPolicy::Keep, TieBreak::TargetWins);
        let plan = compute_plan(
            &m,
            "items",
            keyed(vec![row(7, 100, "stale")]),
            keyed(vec![row(7, 200, "fresh")]),
        );
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            PlannedAction::ConflictSkip(c) => {
                assert_eq!(c.row_key, "7");
                assert_eq!(c.resolution, ConflictResolution::TargetWins);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn source_wins_tie_break_changes_only_the_recorded_resolution() {
        let m = mapping(SyncType::Incremental, MissingRowPolicy::Keep, TieBreak::SourceWins);
        let plan = compute_plan(
            &m,
            "items",
            keyed(vec![row(7, 100, "stale")]),
            keyed(vec![row(7, 200, "fresh")]),
        );
        match &plan[0] {
            PlannedAction::ConflictSkip(c) => {
                assert_eq!(c.resolution, ConflictResolution::SourceWins);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn equal_timestamps_are_converged() {
        let m = mapping(SyncType::Incremental, MissingRowPolicy::Keep, TieBreak::TargetWins);
        let plan = compute_plan(
            &m,
            "items",
            keyed(vec![row(1, 100, "same")]),
            keyed(vec![row(1, 100, "same")]),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn older_identical_source_row_is_not_a_conflict() {
        let m = mapping(SyncType::Incremental, MissingRowPolicy::Keep, TieBreak::TargetWins);
        // The target is newer but carries the same payload; only the
        // timestamps differ.
        let plan = compute_plan(
            &m,
            "items",
            keyed(vec![row(1, 100, "same")]),
            keyed(vec![row(1, 200, "same")]),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn deletes_require_full_sync_and_delete_policy() {
        let target_only = keyed(vec![row(3, 100, "orphan")]);

        let keep = mapping(SyncType::Full, MissingRowPolicy::Keep, TieBreak::TargetWins);
        assert!(compute_plan(&keep, "items", HashMap::new(), target_only.clone()).is_empty());

        let incr = mapping(SyncType::Incremental, MissingRowPolicy::Delete, TieBreak::TargetWins);
        assert!(compute_plan(&incr, "items", HashMap::new(), target_only.clone()).is_empty());

        let full = mapping(SyncType::Full, MissingRowPolicy::Delete, TieBreak::TargetWins);
        let plan = compute_plan(&full, "items", HashMap::new(), target_only);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], PlannedAction::Delete { key, .. } if key == "3"));
    }

    #[test]
    fn plan_order_is_deterministic() {
        let m = mapping(SyncType::Full, MissingRowPolicy::Delete, TieBreak::TargetWins);
        let source = keyed(vec![row(10, 100, "a"), row(2, 100, "b"), row(1, 100, "c")]);
        let first = compute_plan(&m, "items", source.clone(), HashMap::new());
        let second = compute_plan(&m, "items", source, HashMap::new());
        let keys: Vec<&str> = first.iter().map(|a| a.row_key()).collect();
        assert_eq!(keys, vec!["1", "2", "10"]);
        assert_eq!(
            keys,
            second.iter().map(|a| a.row_key()).collect::<Vec<_>>()
        );
    }
}
