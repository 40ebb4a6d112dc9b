//! Request guard (spec.md §4.3): the first admission gate in the pipeline.
//! Ordered checks — minimum length, max input cap, dedup window, in-flight
//! dedup, debounce, rate cap, cost gate — any one of which can block a
//! request before it reaches the cache or the model invoker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cache::similarity::normalize;

/// Request guard configuration (spec.md §6 `guard.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub min_prompt_chars: usize,
    pub max_input_tokens: u64,
    pub dedup_window_seconds: i64,
    pub debounce_ms: i64,
    pub rate_limit_per_minute: u32,
    pub max_cost_per_hour: f64,
    /// In-flight entries older than this are treated as abandoned (the
    /// owning request likely crashed without calling `complete_request`)
    /// and are evicted rather than permanently blocking the slot.
    pub stale_inflight_seconds: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_prompt_chars: 1,
            max_input_tokens: 200_000,
            dedup_window_seconds: 10,
            debounce_ms: 250,
            rate_limit_per_minute: 60,
            max_cost_per_hour: 10.0,
            stale_inflight_seconds: 300,
        }
    }
}

/// Why the guard declined a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockReason {
    PromptTooShort,
    InputTooLarge { tokens: u64, max: u64 },
    DuplicateWithinWindow,
    AlreadyInFlight,
    Debounced,
    RateLimited,
    CostExceeded { estimated: f64, max: f64 },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::PromptTooShort => write!(f, "prompt shorter than minimum length"),
            BlockReason::InputTooLarge { tokens, max } => {
                write!(f, "input of {tokens} tokens exceeds cap of {max}")
            }
            BlockReason::DuplicateWithinWindow => write!(f, "duplicate request within dedup window"),
            BlockReason::AlreadyInFlight => write!(f, "identical request already in flight"),
            BlockReason::Debounced => write!(f, "request debounced"),
            BlockReason::RateLimited => write!(f, "rate limit exceeded"),
            BlockReason::CostExceeded { estimated, max } => {
                write!(f, "estimated cost ${estimated:.4} exceeds cap ${max:.4}")
            }
        }
    }
}

/// A handle identifying one admitted request for the lifetime of its call,
/// used to release its in-flight slot via [`RequestGuard::complete_request`].
#[derive(Debug, Clone)]
pub struct RequestToken {
    pub id: Uuid,
    dedup_key: String,
}

struct UserWindow {
    /// Timestamps of admitted requests in the last rate-limit minute.
    recent: Vec<DateTime<Utc>>,
    last_admitted: Option<DateTime<Utc>>,
}

impl Default for UserWindow {
    fn default() -> Self {
        Self {
            recent: Vec::new(),
            last_admitted: None,
        }
    }
}

struct InFlightEntry {
    started_at: DateTime<Utc>,
}

struct GuardState {
    windows: HashMap<String, UserWindow>,
    /// Recent normalized prompts per user, for the dedup window check.
    recent_prompts: HashMap<String, Vec<(String, DateTime<Utc>)>>,
    in_flight: HashMap<String, InFlightEntry>,
    total_allowed: u64,
    total_blocked: u64,
    hourly_spend: HashMap<i64, f64>,
    total_saved_dollars: f64,
}

/// Admission-control surface; one instance is shared across all requests
/// for a pipeline (cheap to clone, wraps an `Arc`).
#[derive(Clone)]
pub struct RequestGuard {
    state: Arc<RwLock<GuardState>>,
    config: GuardConfig,
}

/// Snapshot of guard activity, used by callers/dashboards (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardStats {
    pub total_allowed: u64,
    pub total_blocked: u64,
    pub blocked_rate: f64,
    pub current_hourly_spend: f64,
    pub in_flight_count: usize,
    pub total_saved_dollars: f64,
}

impl RequestGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(GuardState {
                windows: HashMap::new(),
                recent_prompts: HashMap::new(),
                in_flight: HashMap::new(),
                total_allowed: 0,
                total_blocked: 0,
                hourly_spend: HashMap::new(),
                total_saved_dollars: 0.0,
            })),
            config,
        }
    }

    fn dedup_key(user_id: &str, normalized_prompt: &str) -> String {
        format!("{user_id}\u{0}{normalized_prompt}")
    }

    fn hour_bucket(now: DateTime<Utc>) -> i64 {
        now.timestamp() / 3600
    }

    /// Run the ordered admission sequence. On success, returns a token the
    /// caller must pass to [`Self::complete_request`] once the call (or its
    /// cache-served shortcut) finishes, to release the in-flight slot.
    pub async fn check(
        &self,
        user_id: Option<&str>,
        prompt_text: &str,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> Result<RequestToken, BlockReason> {
        let user_key = user_id.unwrap_or("__anonymous__").to_string();
        let normalized = normalize(prompt_text);
        let now = Utc::now();

        if prompt_text.trim().chars().count() < self.config.min_prompt_chars {
            return self.record_block(BlockReason::PromptTooShort).await;
        }

        if estimated_tokens > self.config.max_input_tokens {
            return self
                .record_block(BlockReason::InputTooLarge {
                    tokens: estimated_tokens,
                    max: self.config.max_input_tokens,
                })
                .await;
        }

        let mut state = self.state.write().await;

        self.evict_stale_inflight(&mut state, now);

        let window_secs = self.config.dedup_window_seconds;
        let recent = state.recent_prompts.entry(user_key.clone()).or_default();
        recent.retain(|(_, ts)| (now - *ts).num_seconds() < window_secs.max(0) * 4);
        if recent
            .iter()
            .any(|(p, ts)| p == &normalized && (now - *ts).num_seconds() < window_secs)
        {
            drop(state);
            return self.record_block(BlockReason::DuplicateWithinWindow).await;
        }

        let dedup_key = Self::dedup_key(&user_key, &normalized);
        if state.in_flight.contains_key(&dedup_key) {
            drop(state);
            return self.record_block(BlockReason::AlreadyInFlight).await;
        }

        let window = state.windows.entry(user_key.clone()).or_default();
        if let Some(last) = window.last_admitted {
            let elapsed_ms = (now - last).num_milliseconds();
            if elapsed_ms < self.config.debounce_ms {
                drop(state);
                return self.record_block(BlockReason::Debounced).await;
            }
        }

        window.recent.retain(|ts| (now - *ts).num_seconds() < 60);
        if window.recent.len() as u32 >= self.config.rate_limit_per_minute {
            drop(state);
            return self.record_block(BlockReason::RateLimited).await;
        }

        let current_hour_bucket_spend = *state.hourly_spend.get(&Self::hour_bucket(now)).unwrap_or(&0.0);
        if current_hour_bucket_spend + estimated_cost > self.config.max_cost_per_hour {
            drop(state);
            return self
                .record_block(BlockReason::CostExceeded {
                    estimated: current_hour_bucket_spend + estimated_cost,
                    max: self.config.max_cost_per_hour,
                })
                .await;
        }

        // All checks passed: admit.
        let window = state.windows.entry(user_key.clone()).or_default();
        window.recent.push(now);
        window.last_admitted = Some(now);
        state
            .recent_prompts
            .entry(user_key.clone())
            .or_default()
            .push((normalized.clone(), now));
        state
            .in_flight
            .insert(dedup_key.clone(), InFlightEntry { started_at: now });
        state.total_allowed += 1;

        Ok(RequestToken {
            id: Uuid::new_v4(),
            dedup_key,
        })
    }

    async fn record_block(&self, reason: BlockReason) -> Result<RequestToken, BlockReason> {
        let mut state = self.state.write().await;
        state.total_blocked += 1;
        Err(reason)
    }

    fn evict_stale_inflight(&self, state: &mut GuardState, now: DateTime<Utc>) {
        let stale_secs = self.config.stale_inflight_seconds;
        state
            .in_flight
            .retain(|_, entry| (now - entry.started_at).num_seconds() < stale_secs);
    }

    /// Release an admitted request's in-flight slot and credit its actual
    /// cost to the current hour's spend bucket (spec.md §4.3
    /// `completeRequest`). Idempotent with respect to the in-flight slot.
    pub async fn complete_request(&self, token: &RequestToken, actual_cost: f64) {
        let mut state = self.state.write().await;
        state.in_flight.remove(&token.dedup_key);
        let bucket = Self::hour_bucket(Utc::now());
        *state.hourly_spend.entry(bucket).or_insert(0.0) += actual_cost;
    }

    /// Record that a request was served from cache, for the saved-dollars
    /// counter surfaced in [`GuardStats`].
    pub async fn record_savings(&self, dollars: f64) {
        let mut state = self.state.write().await;
        state.total_saved_dollars += dollars;
    }

    pub async fn stats(&self) -> GuardStats {
        let state = self.state.read().await;
        let now = Utc::now();
        let total = state.total_allowed + state.total_blocked;
        GuardStats {
            total_allowed: state.total_allowed,
            total_blocked: state.total_blocked,
            blocked_rate: if total == 0 {
                0.0
            } else {
                state.total_blocked as f64 / total as f64
            },
            current_hourly_spend: *state
                .hourly_spend
                .get(&Self::hour_bucket(now))
                .unwrap_or(&0.0),
            in_flight_count: state.in_flight.len(),
            total_saved_dollars: state.total_saved_dollars,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GuardConfig {
        GuardConfig {
            dedup_window_seconds: 10,
            debounce_ms: 0,
            rate_limit_per_minute: 60,
            ..GuardConfig::default()
        }
    }

    #[tokio::test]
    async fn admits_a_fresh_request() {
        let guard = RequestGuard::new(config());
        let token = guard.check(Some("u1"), "hello there", 10, 0.01).await.unwrap();
        guard.complete_request(&token, 0.01).await;
        assert_eq!(guard.stats().await.total_allowed, 1);
    }

    #[tokio::test]
    async fn blocks_input_over_token_cap() {
        let mut cfg = config();
        cfg.max_input_tokens = 100;
        let guard = RequestGuard::new(cfg);
        let result = guard.check(Some("u1"), "hello", 500, 0.01).await;
        assert!(matches!(result, Err(BlockReason::InputTooLarge { .. })));
    }

    #[tokio::test]
    async fn blocks_duplicate_within_dedup_window() {
        let guard = RequestGuard::new(config());
        let t1 = guard.check(Some("u1"), "same prompt text", 10, 0.01).await.unwrap();
        guard.complete_request(&t1, 0.01).await;
        let second = guard.check(Some("u1"), "same prompt text", 10, 0.01).await;
        assert_eq!(second.unwrap_err(), BlockReason::DuplicateWithinWindow);
    }

    #[tokio::test]
    async fn blocks_already_in_flight_identical_request() {
        let guard = RequestGuard::new(config());
        let _t1 = guard.check(Some("u1"), "concurrent prompt", 10, 0.01).await.unwrap();
        let second = guard.check(Some("u2"), "concurrent prompt", 10, 0.01).await;
        // different user, same normalized prompt -> not the same dedup key
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn blocks_cost_over_cap() {
        let mut cfg = config();
        cfg.max_cost_per_hour = 1.0;
        let guard = RequestGuard::new(cfg);
        let result = guard.check(Some("u1"), "expensive request", 10, 5.0).await;
        assert!(matches!(result, Err(BlockReason::CostExceeded { .. })));
    }

    #[tokio::test]
    async fn cost_gate_accounts_committed_hourly_spend_not_per_request_cost() {
        let mut cfg = config();
        cfg.max_cost_per_hour = 10.0;
        cfg.rate_limit_per_minute = 1000;
        cfg.dedup_window_seconds = 0;
        let guard = RequestGuard::new(cfg);
        for i in 0..3 {
            let token = guard
                .check(Some("u1"), &format!("request body number {i}"), 10, 2.0)
                .await
                .unwrap();
            guard.complete_request(&token, 2.0).await;
        }
        // Hourly bucket now holds 6.0 of committed spend; a further request
        // of estimated cost 5 must be rejected (6 + 5 > 10) even though no
        // single request's own cost exceeds the cap.
        let result = guard.check(Some("u1"), "one more expensive request", 10, 5.0).await;
        assert!(matches!(result, Err(BlockReason::CostExceeded { .. })));
    }

    #[tokio::test]
    async fn rate_limit_trips_after_threshold() {
        let mut cfg = config();
        cfg.rate_limit_per_minute = 2;
        cfg.dedup_window_seconds = 0;
        let guard = RequestGuard::new(cfg);
        for i in 0..2 {
            let token = guard
                .check(Some("u1"), &format!("request number {i}"), 10, 0.01)
                .await
                .unwrap();
            guard.complete_request(&token, 0.01).await;
        }
        let third = guard.check(Some("u1"), "request number 3", 10, 0.01).await;
        assert_eq!(third.unwrap_err(), BlockReason::RateLimited);
    }
}
