//! Audit log (spec.md §4.12): a tamper-evident, hash-chained append-only
//! record of pipeline activity, exportable as JSON or CSV with an
//! integrity summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub event_type: String,
    pub severity: Severity,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

fn compute_hash(prev_hash: &str, sequence: u64, event_type: &str, payload: &Value, created_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct AuditState {
    records: Vec<AuditRecord>,
    next_sequence: u64,
    last_hash: String,
    /// Set once the log has been pruned: verification can no longer walk
    /// the chain back past `pruned_before_sequence`.
    pruned_before_sequence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Records below this severity are not recorded at all.
    pub minimum_severity: Severity,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            minimum_severity: Severity::Info,
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    state: Arc<RwLock<AuditState>>,
    config: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub checked_count: u64,
    pub pruned: bool,
    pub verified_from: u64,
    pub first_break_at: Option<u64>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(AuditState {
                records: Vec::new(),
                next_sequence: 1,
                last_hash: GENESIS_HASH.to_string(),
                pruned_before_sequence: None,
            })),
            config,
        }
    }

    /// Append a record if its severity meets the configured floor.
    /// Returns `None` when the record was below the floor (a no-op, not
    /// an error).
    pub fn record(&self, event_type: impl Into<String>, severity: Severity, payload: Value) -> Option<AuditRecord> {
        if severity < self.config.minimum_severity {
            return None;
        }
        let mut state = self.state.write().expect("audit log lock poisoned");
        let sequence = state.next_sequence;
        let created_at = Utc::now();
        let event_type = event_type.into();
        let hash = compute_hash(&state.last_hash, sequence, &event_type, &payload, &created_at);

        let record = AuditRecord {
            sequence,
            event_type,
            severity,
            payload,
            created_at,
            prev_hash: state.last_hash.clone(),
            hash: hash.clone(),
        };

        state.records.push(record.clone());
        state.next_sequence += 1;
        state.last_hash = hash;

        Some(record)
    }

    /// Walk the hash chain and confirm every record's hash matches its
    /// recomputation from its neighbor. If the log has been pruned, only
    /// the surviving suffix is checked and the report says so.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let state = self.state.read().expect("audit log lock poisoned");
        let mut expected_prev = state
            .pruned_before_sequence
            .and_then(|_| state.records.first().map(|r| r.prev_hash.clone()))
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut checked = 0u64;
        let mut first_break = None;

        for record in &state.records {
            let recomputed = compute_hash(
                &expected_prev,
                record.sequence,
                &record.event_type,
                &record.payload,
                &record.created_at,
            );
            if recomputed != record.hash || record.prev_hash != expected_prev {
                if first_break.is_none() {
                    first_break = Some(record.sequence);
                }
            }
            expected_prev = record.hash.clone();
            checked += 1;
        }

        IntegrityReport {
            valid: first_break.is_none(),
            checked_count: checked,
            pruned: state.pruned_before_sequence.is_some(),
            verified_from: state.records.first().map(|r| r.sequence).unwrap_or(0),
            first_break_at: first_break,
        }
    }

    /// Drop all records with sequence number below `before_sequence`,
    /// marking the log as pruned so [`verify_integrity`] reports the
    /// chain can only be checked from the surviving suffix.
    pub fn prune_before(&self, before_sequence: u64) {
        let mut state = self.state.write().expect("audit log lock poisoned");
        state.records.retain(|r| r.sequence >= before_sequence);
        state.pruned_before_sequence = Some(before_sequence);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.state.read().expect("audit log lock poisoned").records.clone()
    }

    pub fn export_json(&self) -> Value {
        let report = self.verify_integrity();
        let records = self.records();
        serde_json::json!({
            "integrity": report,
            "records": records,
        })
    }

    pub fn export_csv(&self) -> String {
        let mut out = String::from("sequence,event_type,severity,created_at,hash\n");
        for record in self.records() {
            out.push_str(&format!(
                "{},{},{:?},{},{}\n",
                record.sequence,
                csv_escape(&record.event_type),
                record.severity,
                record.created_at.to_rfc3339(),
                record.hash,
            ));
        }
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_log_verifies_as_valid() {
        let log = AuditLog::new(AuditConfig::default());
        log.record("request:allowed", Severity::Info, json!({"id": 1}));
        log.record("ledger:entry", Severity::Info, json!({"cost": 0.01}));
        let report = log.verify_integrity();
        assert!(report.valid);
        assert_eq!(report.checked_count, 2);
    }

    #[test]
    fn below_threshold_records_are_dropped() {
        let log = AuditLog::new(AuditConfig {
            minimum_severity: Severity::Warning,
        });
        let result = log.record("request:allowed", Severity::Info, json!({}));
        assert!(result.is_none());
        assert_eq!(log.records().len(), 0);
    }

    #[test]
    fn pruning_marks_log_and_keeps_suffix_verifiable() {
        let log = AuditLog::new(AuditConfig::default());
        for i in 0..5 {
            log.record("ledger:entry", Severity::Info, json!({"i": i}));
        }
        log.prune_before(3);
        assert_eq!(log.records().len(), 3);
        let report = log.verify_integrity();
        assert!(report.pruned);
        assert!(report.valid);
    }

    #[test]
    fn csv_export_escapes_embedded_commas() {
        let log = AuditLog::new(AuditConfig::default());
        log.record("custom,event", Severity::Info, json!({}));
        let csv = log.export_csv();
        assert!(csv.contains("\"custom,event\""));
    }

    #[test]
    fn json_export_includes_integrity_summary() {
        let log = AuditLog::new(AuditConfig::default());
        log.record("request:allowed", Severity::Info, json!({}));
        let exported = log.export_json();
        assert!(exported["integrity"]["valid"].as_bool().unwrap());
        assert_eq!(exported["records"].as_array().unwrap().len(), 1);
    }
}
