//! Cost ledger (spec.md §3/§4, the "Cost ledger" component): an
//! append-only record of actual spend per call, with rollup summaries by
//! user and model. Write-through to [`crate::persistence::Persistence`]
//! is best-effort — a storage failure degrades the entry to in-memory
//! only and the caller is expected to emit `storage:error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::persistence::{LedgerRow, Persistence};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub entry_count: u64,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl LedgerSummary {
    fn accumulate(&mut self, entry: &LedgerEntry) {
        self.entry_count += 1;
        self.total_cost += entry.cost;
        self.total_input_tokens += entry.input_tokens;
        self.total_output_tokens += entry.output_tokens;
    }
}

struct LedgerState {
    entries: Vec<LedgerEntry>,
}

/// Append-only cost ledger. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
    persistence: Option<Persistence>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState { entries: Vec::new() })),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Persistence) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState { entries: Vec::new() })),
            persistence: Some(persistence),
        }
    }

    /// Record a completed call's actual cost. Returns whether the
    /// write-through to durable storage degraded to in-memory-only.
    pub async fn record(
        &self,
        user_id: Option<&str>,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> (LedgerEntry, bool) {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user_id.map(str::to_string),
            model_id: model_id.to_string(),
            input_tokens,
            output_tokens,
            cost,
            created_at: Utc::now(),
        };

        let mut degraded = false;
        if let Some(persistence) = &self.persistence {
            let row = LedgerRow {
                id: entry.id.to_string(),
                user_id: entry.user_id.clone(),
                model_id: entry.model_id.clone(),
                input_tokens: entry.input_tokens,
                output_tokens: entry.output_tokens,
                cost: entry.cost,
                created_at: entry.created_at,
            };
            if persistence.insert_ledger_row(&row).is_err() {
                degraded = true;
            }
        }

        self.state.write().await.entries.push(entry.clone());
        (entry, degraded)
    }

    pub async fn summary(&self) -> LedgerSummary {
        let state = self.state.read().await;
        let mut summary = LedgerSummary::default();
        for entry in &state.entries {
            summary.accumulate(entry);
        }
        summary
    }

    pub async fn summary_for_user(&self, user_id: &str) -> LedgerSummary {
        let state = self.state.read().await;
        let mut summary = LedgerSummary::default();
        for entry in state.entries.iter().filter(|e| e.user_id.as_deref() == Some(user_id)) {
            summary.accumulate(entry);
        }
        summary
    }

    pub async fn summary_by_model(&self) -> HashMap<String, LedgerSummary> {
        let state = self.state.read().await;
        let mut by_model: HashMap<String, LedgerSummary> = HashMap::new();
        for entry in &state.entries {
            by_model.entry(entry.model_id.clone()).or_default().accumulate(entry);
        }
        by_model
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.read().await.entries.clone()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_accumulate_into_summary() {
        let ledger = Ledger::new();
        ledger.record(Some("alice"), "gpt-4o", 100, 50, 0.01).await;
        ledger.record(Some("alice"), "gpt-4o", 200, 100, 0.02).await;
        let summary = ledger.summary().await;
        assert_eq!(summary.entry_count, 2);
        assert!((summary.total_cost - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn per_user_summary_filters_correctly() {
        let ledger = Ledger::new();
        ledger.record(Some("alice"), "gpt-4o", 100, 50, 0.01).await;
        ledger.record(Some("bob"), "gpt-4o", 100, 50, 0.05).await;
        let alice_summary = ledger.summary_for_user("alice").await;
        assert_eq!(alice_summary.entry_count, 1);
        assert!((alice_summary.total_cost - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn per_model_rollup_groups_by_model() {
        let ledger = Ledger::new();
        ledger.record(Some("alice"), "gpt-4o", 100, 50, 0.01).await;
        ledger.record(Some("alice"), "claude-haiku-4", 100, 50, 0.005).await;
        let by_model = ledger.summary_by_model().await;
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model["gpt-4o"].entry_count, 1);
    }

    #[tokio::test]
    async fn write_through_to_persistence_succeeds() {
        let persistence = Persistence::in_memory();
        let ledger = Ledger::with_persistence(persistence);
        let (_, degraded) = ledger.record(Some("alice"), "gpt-4o", 10, 10, 0.001).await;
        assert!(!degraded);
    }
}
