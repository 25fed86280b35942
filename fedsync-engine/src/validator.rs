//! Cross-store consistency validation.
//!
//! A validation pass runs a battery of read-only checks over the active
//! stores and mapped tables, then records one severity-weighted score.
//! The score is always recomputed from the full battery of the current
//! pass. A pass below the alert threshold raises an alert in the audit
//! log; validation itself never mutates any store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use fedsync_audit::AuditLog;
use fedsync_store::{sanitize_identifier, PoolManager, PooledConnection};
use fedsync_types::{CheckId, ConsistencyCheckResult, Severity, StoreId, SyncMapping};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
struct CheckOutcome {
    name: String,
    severity: Severity,
    passed: bool,
}

impl CheckOutcome {
    fn new(name: String, severity: Severity, passed: bool) -> Self {
        Self {
            name,
            severity,
            passed,
        }
    }
}

/// Severity-weighted score over one pass's outcomes.
///
/// Each check owns an equal share of 100 points. A failing WARNING check
/// subtracts its share; a failing CRITICAL check subtracts double. An
/// empty battery scores a clean 100.
fn score_outcomes(outcomes: &[CheckOutcome]) -> (usize, usize, f64, usize) {
    let total = outcomes.len();
    if total == 0 {
        return (0, 0, 100.0, 0);
    }
    let share = 100.0 / total as f64;
    let mut penalty = 0.0;
    let mut passed = 0;
    let mut critical = 0;
    for outcome in outcomes {
        if outcome.passed {
            passed += 1;
            continue;
        }
        match outcome.severity {
            Severity::Warning => penalty += share,
            Severity::Critical => {
                penalty += share * 2.0;
                critical += 1;
            }
        }
    }
    (passed, total, (100.0 - penalty).clamp(0.0, 100.0), critical)
}

/// Read-only validator over the federation.
pub struct ConsistencyValidator {
    pools: Arc<PoolManager>,
    audit: Arc<AuditLog>,
    alert_threshold: f64,
    drift_tolerance: f64,
}

impl ConsistencyValidator {
    pub fn new(
        pools: Arc<PoolManager>,
        audit: Arc<AuditLog>,
        alert_threshold: f64,
        drift_tolerance: f64,
    ) -> Self {
        Self {
            pools,
            audit,
            alert_threshold,
            drift_tolerance,
        }
    }

    /// Runs one validation pass and records its result. Checks:
    ///
    /// - integrity (`PRAGMA quick_check`) per active store, CRITICAL
    /// - mapped table present on both sides of each mapping, CRITICAL
    /// - row count parity per mapping within the drift tolerance, WARNING
    /// - canonical table checksum parity per mapping, WARNING
    pub async fn validate(&self, mappings: &[SyncMapping]) -> EngineResult<ConsistencyCheckResult> {
        let registry = self.pools.registry();
        let active: Vec<StoreId> = registry
            .handles()
            .into_iter()
            .filter(|h| h.state != fedsync_types::StoreState::Missing)
            .map(|h| h.id)
            .collect();

        let checked_mappings: Vec<SyncMapping> = mappings
            .iter()
            .filter(|m| {
                let ok = registry.is_active(&m.source) && registry.is_active(&m.target);
                if !ok {
                    warn!(
                        "validation skipping mapping {}:{}->{}: store missing",
                        m.table, m.source, m.target
                    );
                }
                ok
            })
            .cloned()
            .collect();

        let mut conns: HashMap<StoreId, PooledConnection> = HashMap::new();
        for store in &active {
            conns.insert(store.clone(), self.pools.acquire(store).await?);
        }

        let stores = active.clone();
        let drift_tolerance = self.drift_tolerance;
        let outcomes = tokio::task::spawn_blocking(move || {
            let outcomes = run_battery(&conns, &stores, &checked_mappings, drift_tolerance);
            drop(conns);
            outcomes
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?;

        let (passed, total, score, critical) = score_outcomes(&outcomes);
        for outcome in outcomes.iter().filter(|o| !o.passed) {
            warn!("consistency check failed ({:?}): {}", outcome.severity, outcome.name);
        }

        let result = ConsistencyCheckResult {
            check_id: CheckId::new(),
            stores_involved: active,
            checks_passed: passed,
            checks_total: total,
            consistency_score: score,
            critical_issues: critical,
            timestamp: Utc::now(),
        };
        self.audit.record_check(&result)?;
        info!(
            "validation {}: {passed}/{total} passed, score {score:.1}",
            result.check_id
        );

        if score < self.alert_threshold {
            self.audit.record_alert(
                Some(result.check_id),
                Some(score),
                &format!(
                    "consistency score {score:.1} below threshold {:.1} ({critical} critical)",
                    self.alert_threshold
                ),
            )?;
        }
        Ok(result)
    }
}

fn run_battery(
    conns: &HashMap<StoreId, PooledConnection>,
    stores: &[StoreId],
    mappings: &[SyncMapping],
    drift_tolerance: f64,
) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::new();

    for store in stores {
        let Some(conn) = conns.get(store) else { continue };
        let passed = integrity_ok(conn).unwrap_or(false);
        outcomes.push(CheckOutcome::new(
            format!("integrity:{store}"),
            Severity::Critical,
            passed,
        ));
    }

    for mapping in mappings {
        let (Some(src), Some(tgt)) = (conns.get(&mapping.source), conns.get(&mapping.target))
        else {
            continue;
        };
        let Ok(table) = sanitize_identifier(&mapping.table) else {
            outcomes.push(CheckOutcome::new(
                format!("table_name:{}", mapping.table),
                Severity::Critical,
                false,
            ));
            continue;
        };
        let pair = format!("{}:{}->{}", table, mapping.source, mapping.target);

        let both_present =
            table_exists(src, table).unwrap_or(false) && table_exists(tgt, table).unwrap_or(false);
        outcomes.push(CheckOutcome::new(
            format!("presence:{pair}"),
            Severity::Critical,
            both_present,
        ));
        if !both_present {
            continue;
        }

        let counts_ok = match (row_count(src, table), row_count(tgt, table)) {
            (Ok(a), Ok(b)) => {
                let drift = (a as f64 - b as f64).abs() / (a.max(1) as f64);
                drift <= drift_tolerance
            }
            _ => false,
        };
        outcomes.push(CheckOutcome::new(
            format!("count_parity:{pair}"),
            Severity::Warning,
            counts_ok,
        ));

        let checksums_ok = match (table_checksum(src, table), table_checksum(tgt, table)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        outcomes.push(CheckOutcome::new(
            format!("checksum:{pair}"),
            Severity::Warning,
            checksums_ok,
        ));
    }
    outcomes
}

fn integrity_ok(conn: &Connection) -> EngineResult<bool> {
    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    Ok(verdict == "ok")
}

fn table_exists(conn: &Connection, table: &str) -> EngineResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        rusqlite::params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn row_count(conn: &Connection, table: &str) -> EngineResult<i64> {
    let count: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
    Ok(count)
}

/// Canonical content hash of a table, independent of column order.
fn table_checksum(conn: &Connection, table: &str) -> EngineResult<String> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\" ORDER BY id"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut hasher = Sha256::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut cells: BTreeMap<&str, String> = BTreeMap::new();
        for (i, name) in columns.iter().enumerate() {
            cells.insert(name.as_str(), canonical_value(&row.get::<_, Value>(i)?));
        }
        for (name, repr) in &cells {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(repr.as_bytes());
            hasher.update(b";");
        }
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::Null => "n".to_string(),
        Value::Integer(v) => format!("i:{v}"),
        Value::Real(v) => format!("r:{v}"),
        Value::Text(v) => format!("t:{v}"),
        Value::Blob(v) => format!("b:{}", hex::encode(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(severity: Severity, passed: bool) -> CheckOutcome {
        CheckOutcome::new("check".to_string(), severity, passed)
    }

    #[test]
    fn one_warning_failure_in_ten_scores_ninety() {
        let mut outcomes = vec![outcome(Severity::Warning, true); 9];
        outcomes.push(outcome(Severity::Warning, false));
        let (passed, total, score, critical) = score_outcomes(&outcomes);
        assert_eq!((passed, total), (9, 10));
        assert_eq!(score, 90.0);
        assert_eq!(critical, 0);
    }

    #[test]
    fn critical_failures_subtract_double() {
        let mut outcomes = vec![outcome(Severity::Warning, true); 9];
        outcomes.push(outcome(Severity::Critical, false));
        let (_, _, score, critical) = score_outcomes(&outcomes);
        assert_eq!(score, 80.0);
        assert_eq!(critical, 1);
    }

    #[test]
    fn score_never_goes_negative() {
        let outcomes = vec![outcome(Severity::Critical, false); 3];
        let (_, _, score, _) = score_outcomes(&outcomes);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn empty_battery_is_a_clean_pass() {
        let (passed, total, score, critical) = score_outcomes(&[]);
        assert_eq!((passed, total, critical), (0, 0, 0));
        assert_eq!(score, 100.0);
    }
}
