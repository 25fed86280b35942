//! The audit log implementation: SQLite tables plus the line log file.

use crate::{AuditError, AuditResult};
use chrono::{DateTime, Utc};
use fedsync_types::{
    AuditAction, AuditLine, CheckId, ConflictRecord, ConsistencyCheckResult, PerformanceMetric,
    StoreHandle, StoreId, SyncId, SyncOperationRecord, SyncStatus,
};
use rusqlite::{params, Connection};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// One sync decision destined for both audit sinks.
#[derive(Debug, Clone)]
pub struct SyncAuditEntry {
    pub source: StoreId,
    pub target: StoreId,
    pub line: AuditLine,
    pub timestamp: DateTime<Utc>,
}

/// A structured audit row read back for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub source: StoreId,
    pub target: StoreId,
    pub action: AuditAction,
    pub table: String,
    pub row_key: String,
    pub timestamp: String,
}

/// A sync operation row read back for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRow {
    pub sync_id: String,
    pub source: StoreId,
    pub target: StoreId,
    pub table: String,
    pub sync_type: String,
    pub records_synced: u64,
    pub duration_ms: u64,
    pub status: String,
    pub timestamp: String,
}

/// Durable append-only audit log.
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
    line_log: Arc<Mutex<File>>,
}

impl AuditLog {
    /// Opens (or creates) the audit log at the given paths.
    pub fn open(db_path: &Path, line_log_path: &Path) -> AuditResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = line_log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let line_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(line_log_path)?;
        let log = Self {
            conn: Arc::new(Mutex::new(conn)),
            line_log: Arc::new(Mutex::new(line_log)),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_db TEXT NOT NULL,
                target_db TEXT NOT NULL,
                action TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_key TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sync_id TEXT NOT NULL,
                source_db TEXT NOT NULL,
                target_db TEXT NOT NULL,
                table_name TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                records_synced INTEGER NOT NULL,
                sync_duration INTEGER NOT NULL,
                sync_status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_db TEXT NOT NULL,
                target_db TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_key TEXT NOT NULL,
                source_updated_at INTEGER NOT NULL,
                target_updated_at INTEGER NOT NULL,
                resolution TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                store_id TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                measured_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consistency_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                check_id TEXT NOT NULL,
                stores_involved TEXT NOT NULL,
                checks_passed INTEGER NOT NULL,
                checks_total INTEGER NOT NULL,
                consistency_score REAL NOT NULL,
                critical_issues INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                check_id TEXT,
                score REAL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS store_registry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                db_id TEXT NOT NULL,
                db_name TEXT NOT NULL,
                db_path TEXT NOT NULL,
                db_size INTEGER NOT NULL,
                table_count INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                last_modified TEXT,
                health_status TEXT NOT NULL,
                performance_score REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Line log ─────────────────────────────────────────────────

    /// Appends one `"<action> <table>:<id>"` line to the durable log.
    pub fn record(&self, action: AuditAction, table: &str, row_key: &str) -> AuditResult<()> {
        let line = AuditLine::new(action, table, row_key);
        let mut file = self.line_log.lock().expect("line log lock poisoned");
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    // ── Structured audit rows ────────────────────────────────────

    /// Appends a batch of sync decisions to both sinks.
    ///
    /// Log lines are written and flushed first; the structured rows commit
    /// in one transaction after. A committed row therefore always has its
    /// corresponding line, and a failure here leaves no structured rows,
    /// letting the caller roll back the data mutations of the batch.
    pub fn append_sync_entries(&self, entries: &[SyncAuditEntry]) -> AuditResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        {
            let mut file = self.line_log.lock().expect("line log lock poisoned");
            let mut buf = String::new();
            for entry in entries {
                buf.push_str(&entry.line.to_string());
                buf.push('\n');
            }
            file.write_all(buf.as_bytes())?;
            file.flush()?;
        }

        let mut conn = self.conn.lock().expect("audit lock poisoned");
        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO sync_audit (source_db, target_db, action, table_name, row_key, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.source.as_str(),
                    entry.target.as_str(),
                    entry.line.action.as_str(),
                    entry.line.table,
                    entry.line.row_key,
                    entry.timestamp.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Appends a finalized sync operation record.
    pub fn record_operation(&self, record: &SyncOperationRecord) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO sync_operations
                 (sync_id, source_db, target_db, table_name, sync_type,
                  records_synced, sync_duration, sync_status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.sync_id.to_string(),
                record.mapping.source.as_str(),
                record.mapping.target.as_str(),
                record.mapping.table,
                record.mapping.sync_type.to_string(),
                record.records_synced,
                record.duration_ms,
                record.status.to_string(),
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Appends a conflict record.
    pub fn record_conflict(
        &self,
        source: &StoreId,
        target: &StoreId,
        conflict: &ConflictRecord,
        timestamp: DateTime<Utc>,
    ) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO sync_conflicts
                 (source_db, target_db, table_name, row_key,
                  source_updated_at, target_updated_at, resolution, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                source.as_str(),
                target.as_str(),
                conflict.table,
                conflict.row_key,
                conflict.source_updated_at,
                conflict.target_updated_at,
                conflict.resolution.to_string(),
                timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Appends a performance metric.
    pub fn record_metric(&self, metric: &PerformanceMetric) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO performance_metrics (store_id, metric_type, value, measured_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                metric.store.as_str(),
                metric.kind.to_string(),
                metric.value,
                metric.measured_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Appends a consistency check result.
    pub fn record_check(&self, result: &ConsistencyCheckResult) -> AuditResult<()> {
        let stores = serde_json::to_string(
            &result
                .stores_involved
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>(),
        )?;
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO consistency_checks
                 (check_id, stores_involved, checks_passed, checks_total,
                  consistency_score, critical_issues, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.check_id.to_string(),
                stores,
                result.checks_passed,
                result.checks_total,
                result.consistency_score,
                result.critical_issues,
                result.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Raises an alert. Alerts are informational: they never mutate any
    /// store, only this log.
    pub fn record_alert(
        &self,
        check_id: Option<CheckId>,
        score: Option<f64>,
        message: &str,
    ) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO alerts (check_id, score, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                check_id.map(|c| c.to_string()),
                score,
                message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Appends one registry snapshot row for a store.
    pub fn record_store_handle(&self, handle: &StoreHandle) -> AuditResult<()> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO store_registry
                 (db_id, db_name, db_path, db_size, table_count, record_count,
                  last_modified, health_status, performance_score, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                handle.id.as_str(),
                handle.id.as_str(),
                handle.path.to_string_lossy(),
                handle.size_bytes,
                handle.table_count,
                handle.record_count_estimate,
                handle.last_modified.map(|t| t.to_rfc3339()),
                handle.state.to_string(),
                handle.health_score,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ── Reporting queries ────────────────────────────────────────

    /// Returns the most recent structured audit rows, newest first.
    pub fn recent_events(&self, limit: usize) -> AuditResult<Vec<AuditEvent>> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT source_db, target_db, action, table_name, row_key, timestamp
             FROM sync_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (source, target, action, table, row_key, timestamp) = row?;
            let action: AuditAction = action
                .parse()
                .map_err(|e| AuditError::InvalidData(format!("{e}")))?;
            events.push(AuditEvent {
                source: StoreId::new(source),
                target: StoreId::new(target),
                action,
                table,
                row_key,
                timestamp,
            });
        }
        Ok(events)
    }

    /// Returns the most recent sync operations, newest first.
    pub fn recent_operations(&self, limit: usize) -> AuditResult<Vec<OperationRow>> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT sync_id, source_db, target_db, table_name, sync_type,
                    records_synced, sync_duration, sync_status, timestamp
             FROM sync_operations ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(OperationRow {
                sync_id: row.get(0)?,
                source: StoreId::new(row.get::<_, String>(1)?),
                target: StoreId::new(row.get::<_, String>(2)?),
                table: row.get(3)?,
                sync_type: row.get(4)?,
                records_synced: row.get::<_, i64>(5)?.max(0) as u64,
                duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
                status: row.get(7)?,
                timestamp: row.get(8)?,
            })
        })?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    /// Number of structured audit rows.
    pub fn audit_row_count(&self) -> AuditResult<usize> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_audit", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Number of recorded conflicts.
    pub fn conflict_count(&self) -> AuditResult<usize> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_conflicts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Terminal status of the most recent operation for a sync ID, if any.
    pub fn operation_status(&self, sync_id: SyncId) -> AuditResult<Option<SyncStatus>> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let status: Option<String> = conn
            .query_row(
                "SELECT sync_status FROM sync_operations WHERE sync_id = ?1 ORDER BY id DESC LIMIT 1",
                params![sync_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(status) = status else {
            return Ok(None);
        };
        let status = match status.as_str() {
            "PENDING" => SyncStatus::Pending,
            "SUCCESS" => SyncStatus::Success,
            "PARTIAL" => SyncStatus::Partial,
            "FAILED" => SyncStatus::Failed,
            other => {
                warn!("unknown sync status in audit store: {other}");
                return Err(AuditError::InvalidData(format!(
                    "unknown sync status: {other}"
                )));
            }
        };
        Ok(Some(status))
    }
}
