//! The federation data model.
//!
//! Sync and conflict records are append-only: once a record's status is
//! terminal it is never rewritten, so the audit trail stays a faithful
//! causal log. Audit actions carry stable wire strings because the
//! `"<action> <table>:<id>"` log line format must round-trip for tooling.

use crate::{CheckId, StoreId, SyncId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a registered store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    /// Reachable and passing integrity checks.
    Healthy,
    /// Reachable but failing integrity or performing poorly.
    Degraded,
    /// Unreachable for three consecutive discovery cycles. Registry entries
    /// are never deleted; a missing store is excluded from sync mappings
    /// until its file reappears.
    Missing,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreState::Healthy => "HEALTHY",
            StoreState::Degraded => "DEGRADED",
            StoreState::Missing => "MISSING",
        };
        write!(f, "{s}")
    }
}

/// Registry entry for one data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHandle {
    /// Stable name, derived from the file stem.
    pub id: StoreId,
    /// Backing file path.
    pub path: PathBuf,
    /// File size in bytes at last discovery.
    pub size_bytes: u64,
    /// Number of user tables.
    pub table_count: usize,
    /// Sum of per-table row counts at last discovery. An estimate; never
    /// used for correctness.
    pub record_count_estimate: u64,
    /// Composite 0–100 score: 50% integrity, 50% probe latency vs. a
    /// rolling baseline.
    pub health_score: f64,
    /// Current lifecycle state.
    pub state: StoreState,
    /// Backing file mtime at last discovery.
    pub last_modified: Option<DateTime<Utc>>,
}

/// How one sync run treats rows present only in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRowPolicy {
    /// Mirror semantics: delete target rows absent from the source.
    /// Honored only for `SyncType::Full` mappings.
    Delete,
    /// Leave target-only rows in place.
    Keep,
}

impl Default for MissingRowPolicy {
    fn default() -> Self {
        MissingRowPolicy::Keep
    }
}

/// Conflict tie-break policy when the target row is strictly newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Record the conflict with the target's version winning.
    TargetWins,
    /// Record the conflict attributing the win to the source. The target
    /// row is still not overwritten; a conflict never mutates data.
    SourceWins,
}

impl Default for TieBreak {
    fn default() -> Self {
        TieBreak::TargetWins
    }
}

/// Full vs. incremental reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncType {
    Full,
    Incremental,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Full => write!(f, "FULL"),
            SyncType::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

/// Configuration for one source→target table synchronization relationship.
///
/// Immutable once loaded for a cycle. Deletion of target-only rows is an
/// explicit per-mapping choice ([`MissingRowPolicy`]), never inferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub source: StoreId,
    pub target: StoreId,
    pub table: String,
    pub sync_type: SyncType,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub missing_row_policy: MissingRowPolicy,
    #[serde(default)]
    pub tie_break: TieBreak,
}

/// Terminal (or pending) status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Pending,
    Success,
    Partial,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Partial => "PARTIAL",
            SyncStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one sync run. Created at sync start, finalized once at sync
/// end, then never updated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperationRecord {
    pub sync_id: SyncId,
    pub mapping: SyncMapping,
    pub records_synced: u64,
    pub conflicts_skipped: u64,
    pub duration_ms: u64,
    pub status: SyncStatus,
    pub timestamp: DateTime<Utc>,
}

/// How a detected conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolution {
    SourceWins,
    TargetWins,
    Skipped,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictResolution::SourceWins => "SOURCE_WINS",
            ConflictResolution::TargetWins => "TARGET_WINS",
            ConflictResolution::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// One detected row conflict. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub table: String,
    pub row_key: String,
    /// `updated_at` of the source row, epoch milliseconds.
    pub source_updated_at: i64,
    /// `updated_at` of the target row, epoch milliseconds.
    pub target_updated_at: i64,
    pub resolution: ConflictResolution,
}

/// Kind of a recorded performance measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    QueryLatencyMs,
    CompactionMs,
    StatsRefreshMs,
    ReindexMs,
    /// File size immediately before a compaction run.
    SizeBeforeBytes,
    /// File size immediately after a compaction run.
    SizeAfterBytes,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::QueryLatencyMs => "query_latency_ms",
            MetricKind::CompactionMs => "compaction_ms",
            MetricKind::StatsRefreshMs => "stats_refresh_ms",
            MetricKind::ReindexMs => "reindex_ms",
            MetricKind::SizeBeforeBytes => "size_before_bytes",
            MetricKind::SizeAfterBytes => "size_after_bytes",
        };
        write!(f, "{s}")
    }
}

/// One time-series measurement. Append-only, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub store: StoreId,
    pub kind: MetricKind,
    pub value: f64,
    pub measured_at: DateTime<Utc>,
}

/// Severity of a failing consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

/// Result of one validation pass over the federation.
///
/// `consistency_score` is recomputed from the full set of checks in the
/// current pass, never incrementally patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    pub check_id: CheckId,
    pub stores_involved: Vec<StoreId>,
    pub checks_passed: usize,
    pub checks_total: usize,
    /// Severity-weighted 0–100 score. A failing WARNING check subtracts its
    /// per-check share; a failing CRITICAL check subtracts double.
    pub consistency_score: f64,
    pub critical_issues: usize,
    pub timestamp: DateTime<Utc>,
}

/// Action recorded in the audit log for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    ConflictSkip,
}

impl AuditAction {
    /// Stable wire string used in audit log lines.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "insert",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::ConflictSkip => "conflict_skip",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error parsing an audit action or line.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid audit {what}: {input}")]
pub struct ParseAuditError {
    pub what: &'static str,
    pub input: String,
}

impl FromStr for AuditAction {
    type Err = ParseAuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(AuditAction::Insert),
            "update" => Ok(AuditAction::Update),
            "delete" => Ok(AuditAction::Delete),
            "conflict_skip" => Ok(AuditAction::ConflictSkip),
            _ => Err(ParseAuditError {
                what: "action",
                input: s.to_string(),
            }),
        }
    }
}

/// One audit log line, formatted exactly as `"<action> <table>:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLine {
    pub action: AuditAction,
    pub table: String,
    pub row_key: String,
}

impl AuditLine {
    pub fn new(action: AuditAction, table: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            action,
            table: table.into(),
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for AuditLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.action, self.table, self.row_key)
    }
}

impl FromStr for AuditLine {
    type Err = ParseAuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseAuditError {
            what: "line",
            input: s.to_string(),
        };
        let (action, rest) = s.split_once(' ').ok_or_else(malformed)?;
        let (table, row_key) = rest.split_once(':').ok_or_else(malformed)?;
        if table.is_empty() || row_key.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            action: action.parse()?,
            table: table.to_string(),
            row_key: row_key.to_string(),
        })
    }
}
