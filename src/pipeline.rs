//! Pipeline controller (spec.md §4.13): the orchestration core that runs
//! every other module in a fixed order twice per request — a pre-call
//! `transform` and a post-call `record` — and exposes `wrap` as the
//! convenience entry point that drives both around a caller-supplied
//! model invocation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::anomaly::AnomalyDetector;
use crate::audit::{AuditConfig, AuditLog, Severity as AuditSeverity};
use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::budget::{BudgetDenied, Reservation, UserBudgetManager};
use crate::cache::{CacheHit, HitKind, SemanticCache};
use crate::compressor;
use crate::complexity::ComplexityScorer;
use crate::config::Config;
use crate::delta::{self, DeltaHistory};
use crate::estimator::{self, EncodingFamily};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::guard::{RequestGuard, RequestToken};
use crate::ledger::Ledger;
use crate::persistence::Persistence;
use crate::pricing::PricingTable;
use crate::router::{self, RoutingDecision, RoutingOutcome, RoutingRequirements};
use crate::trimmer;
use crate::types::{InvokerResult, Prompt, Role, RequestParams};

/// Predicted output tokens used for pre-call cost estimation, before the
/// model's actual usage is known (spec.md §4.13.1 step 1).
const DEFAULT_PREDICTED_OUTPUT_TOKENS: u64 = 500;

/// What a pipeline step would have done, reported through `onDryRun`
/// instead of being applied (spec.md §4.13.1 "Dry-run mode" + SPEC_FULL's
/// typed supplement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DryRunNote {
    BreakerWouldAllow,
    BreakerWouldDeny { reason: String },
    BudgetWouldReserve { amount: f64 },
    BudgetWouldDeny { reason: String },
    GuardWouldAdmit,
    GuardWouldBlock { reason: String },
    CacheWouldHit { similarity: f64 },
    CacheWouldMiss,
    ContextWouldTrim { evicted_tokens: u64 },
    CompressorWouldSave { tokens: u64 },
    DeltaWouldSave { tokens: u64 },
    RouterWouldRoute { model_id: String },
}

/// Per-request metadata accumulated across the pre-call transform,
/// carried into the post-call record (spec.md §4.13.1 "sidecar").
#[derive(Debug, Clone)]
pub struct Sidecar {
    pub original_model_id: String,
    pub original_token_count: u64,
    pub cache_hit: Option<CacheHit>,
    pub context_saved_tokens: u64,
    pub compressor_saved_tokens: u64,
    pub delta_saved_tokens: u64,
    pub router_decision: Option<RoutingDecision>,
    pub ab_test_holdout: bool,
    pub estimated_cost: f64,
    pub user_id: String,
    reservation: Option<Reservation>,
    guard_token: Option<RequestToken>,
    dry_run_notes: Vec<DryRunNote>,
}

impl Sidecar {
    fn total_saved_tokens(&self) -> u64 {
        self.context_saved_tokens + self.compressor_saved_tokens + self.delta_saved_tokens
    }
}

/// Snapshot returned by [`Pipeline::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub modules: Vec<String>,
    pub cache_hit_rate: f64,
    pub guard_blocked_rate: f64,
    pub breaker_tripped: bool,
    pub total_spent: f64,
    pub total_saved: f64,
}

/// The pipeline orchestrator. Holds every module and the shared registries
/// (pricing, persistence, events) they're built from. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    config: Config,
    pricing: PricingTable,
    guard: RequestGuard,
    breaker: CircuitBreaker,
    budget: UserBudgetManager,
    cache: SemanticCache,
    events: Arc<EventBus>,
    audit: AuditLog,
    ledger: Ledger,
    persistence: Persistence,
    complexity: Arc<Mutex<ComplexityScorer>>,
    anomaly: Arc<Mutex<AnomalyDetector>>,
    delta_histories: Arc<RwLock<HashMap<String, DeltaHistory>>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_pricing(config, PricingTable::with_defaults())
    }

    pub fn with_pricing(config: Config, pricing: PricingTable) -> Result<Self> {
        config.validate()?;

        let persistence = match &config.persistence.path {
            Some(path) => Persistence::open(path),
            None => Persistence::in_memory(),
        };

        let cache = if config.cache.persist {
            SemanticCache::with_persistence(config.cache.clone(), persistence.clone())
        } else {
            SemanticCache::new(config.cache.clone())
        };

        Ok(Self {
            guard: RequestGuard::new(config.guard.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            budget: UserBudgetManager::new(config.user_budget.clone()),
            cache,
            events: Arc::new(EventBus::new()),
            audit: AuditLog::new(AuditConfig::default()),
            ledger: Ledger::with_persistence(persistence.clone()),
            complexity: Arc::new(Mutex::new(ComplexityScorer::new())),
            anomaly: Arc::new(Mutex::new(AnomalyDetector::new(config.anomaly.clone()))),
            delta_histories: Arc::new(RwLock::new(HashMap::new())),
            persistence,
            pricing,
            config,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.events.emit(kind, payload);
    }

    fn audit(&self, event_type: &str, severity: AuditSeverity, payload: serde_json::Value) {
        self.audit.record(event_type, severity, payload);
    }

    fn encoding_family(model_id: &str) -> EncodingFamily {
        EncodingFamily::for_model(model_id)
    }

    fn estimate_prompt_tokens(prompt: &Prompt, family: EncodingFamily) -> u64 {
        let texts: Vec<String> = prompt.as_messages().iter().map(|m| m.text()).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        estimator::estimate_messages(&refs, family)
    }

    fn resolve_user_id(params: &RequestParams) -> String {
        params.user_id.clone().unwrap_or_else(|| "__anonymous__".to_string())
    }

    /// Run the pre-call transform (spec.md §4.13.1). Returns the
    /// (possibly modified) request params plus the sidecar the post-call
    /// record needs. On a block, any reservation already taken is released
    /// before the error is returned.
    pub async fn transform(&self, params: RequestParams) -> Result<(RequestParams, Sidecar)> {
        let dry_run = self.config.dry_run.enabled;
        let user_id = Self::resolve_user_id(&params);
        let family = Self::encoding_family(&params.model_id);
        let original_token_count = Self::estimate_prompt_tokens(&params.prompt, family);

        let mut sidecar = Sidecar {
            original_model_id: params.model_id.clone(),
            original_token_count,
            cache_hit: None,
            context_saved_tokens: 0,
            compressor_saved_tokens: 0,
            delta_saved_tokens: 0,
            router_decision: None,
            ab_test_holdout: false,
            estimated_cost: 0.0,
            user_id: user_id.clone(),
            reservation: None,
            guard_token: None,
            dry_run_notes: Vec::new(),
        };

        let pricing = self.pricing.price(&params.model_id);
        if matches!(pricing.matched, crate::pricing::PricingMatch::Fallback) {
            self.emit(EventKind::CostFallback, json!({"model_id": params.model_id}));
        }
        let estimated_cost = pricing
            .entry
            .calculate_cost(original_token_count, DEFAULT_PREDICTED_OUTPUT_TOKENS);
        sidecar.estimated_cost = estimated_cost;

        // 1. Breaker admission.
        if self.config.modules.breaker {
            let (decision, warnings) = self.breaker.check(estimated_cost).await;
            for warning in warnings {
                self.emit(EventKind::BreakerWarning, json!(warning));
            }
            match decision {
                BreakerDecision::Deny(tripped) => {
                    let reason = format!("breaker: {} window exhausted", tripped.window);
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::BreakerWouldDeny { reason: reason.clone() });
                        return Ok((params, sidecar));
                    }
                    self.emit(EventKind::BreakerTripped, json!(tripped));
                    self.emit(EventKind::RequestBlocked, json!({"reason": reason}));
                    return Err(Error::blocked(reason, estimated_cost));
                }
                BreakerDecision::Throttle(_) | BreakerDecision::Allow => {
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::BreakerWouldAllow);
                    }
                }
            }
        }

        // 2. User-budget reserve.
        if self.config.modules.user_budget && !dry_run {
            match self.budget.reserve(&user_id, estimated_cost).await {
                Ok((reservation, warning)) => {
                    if let Some(warning) = warning {
                        self.emit(EventKind::UserBudgetWarning, json!(warning));
                    }
                    sidecar.reservation = Some(reservation);
                }
                Err(denied) => {
                    let reason = budget_denied_reason(&denied);
                    self.emit(EventKind::UserBudgetExceeded, json!({"user_id": user_id, "reason": reason}));
                    return Err(Error::blocked(reason, estimated_cost));
                }
            }
        } else if self.config.modules.user_budget && dry_run {
            sidecar.dry_run_notes.push(DryRunNote::BudgetWouldReserve { amount: estimated_cost });
        }

        // 3. Guard check.
        let flat_text = params.prompt.flat_text();
        if self.config.modules.guard {
            let outcome = self.guard.check(Some(&user_id), &flat_text, original_token_count, estimated_cost).await;
            match outcome {
                Ok(token) => {
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::GuardWouldAdmit);
                    } else {
                        sidecar.guard_token = Some(token);
                        self.emit(EventKind::RequestAllowed, json!({"user_id": user_id}));
                    }
                }
                Err(reason) => {
                    let reason_str = reason.to_string();
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::GuardWouldBlock { reason: reason_str });
                        return Ok((params, sidecar));
                    }
                    if let Some(reservation) = sidecar.reservation.take() {
                        self.budget.release(reservation).await;
                    }
                    self.emit(EventKind::RequestBlocked, json!({"reason": reason_str}));
                    return Err(Error::blocked(reason_str, estimated_cost));
                }
            }
        }

        // 4. Cache lookup.
        if self.config.modules.cache {
            let lookup_result = self.cache.lookup(&params.model_id, &flat_text).await;
            if self.cache.take_storage_error() {
                self.emit(EventKind::StorageError, json!({"component": "cache"}));
            }
            match lookup_result {
                Some(hit) => {
                    let similarity = hit.similarity;
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::CacheWouldHit { similarity });
                        return Ok((params, sidecar));
                    }
                    self.emit(EventKind::CacheHit, json!({"kind": hit.kind, "similarity": similarity}));
                    sidecar.cache_hit = Some(hit);
                    return Ok((params, sidecar));
                }
                None => {
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::CacheWouldMiss);
                    } else {
                        self.emit(EventKind::CacheMiss, json!({}));
                    }
                }
            }
        }

        let mut params = params;

        // 5. Context trim.
        if self.config.modules.trimmer {
            let messages = params.prompt.as_messages();
            let result = trimmer::trim(&messages, &params.tools, &self.config.trimmer, |t| estimator::estimate(t, family));
            if result.evicted_count > 0 {
                if dry_run {
                    sidecar.dry_run_notes.push(DryRunNote::ContextWouldTrim { evicted_tokens: result.evicted_tokens });
                } else {
                    self.emit(EventKind::ContextTrimmed, json!({"evicted_count": result.evicted_count, "evicted_tokens": result.evicted_tokens}));
                    sidecar.context_saved_tokens = result.evicted_tokens;
                    params.prompt = Prompt::Messages(result.messages);
                }
            }
        }

        // 6. Compressor: applied to the last user message.
        if self.config.modules.compressor {
            let mut messages = params.prompt.as_messages();
            if let Some(idx) = messages.iter().rposition(|m| m.role == Role::User) {
                let original_text = messages[idx].text();
                let result = compressor::compress(&original_text, &self.config.compressor, |t| estimator::estimate(t, family));
                if result.applied {
                    let saved = result.original_tokens_estimate.saturating_sub(result.compressed_tokens_estimate);
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::CompressorWouldSave { tokens: saved });
                    } else {
                        self.emit(EventKind::CompressorApplied, json!({"saved_tokens": saved}));
                        sidecar.compressor_saved_tokens = saved;
                        messages[idx] = messages[idx].with_text(result.text);
                        params.prompt = Prompt::Messages(messages);
                    }
                }
            }
        }

        // 7. Delta encoder: applied against the running per-user history.
        if self.config.modules.delta {
            let messages = params.prompt.as_messages();
            let system_text = messages.iter().find(|m| m.role == Role::System).map(|m| m.text());
            if let Some(idx) = messages.iter().rposition(|m| m.role == Role::User) {
                let turn_text = messages[idx].text();
                let mut histories = self.delta_histories.write().await;
                let history = histories.entry(user_id.clone()).or_default();
                let result = delta::encode(&turn_text, system_text.as_deref(), history, |t| estimator::estimate(t, family));
                drop(histories);
                if result.applied {
                    let saved = result.original_tokens_estimate.saturating_sub(result.encoded_tokens_estimate);
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::DeltaWouldSave { tokens: saved });
                    } else {
                        self.emit(EventKind::DeltaApplied, json!({"saved_tokens": saved}));
                        sidecar.delta_saved_tokens = saved;
                        let mut messages = params.prompt.as_messages();
                        messages[idx] = messages[idx].with_text(result.text);
                        params.prompt = Prompt::Messages(messages);
                    }
                }
            }
        }

        // 8. Router.
        if self.config.modules.router {
            let override_model = params
                .passthrough
                .get("route_override_model_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let decision = if let Some(model_id) = override_model {
                let changed = model_id != params.model_id;
                let entry = self.pricing.price(&model_id).entry;
                let cost = entry.calculate_cost(original_token_count, DEFAULT_PREDICTED_OUTPUT_TOKENS);
                RoutingDecision {
                    model_id,
                    outcome: RoutingOutcome::Routed,
                    estimated_cost: cost,
                    default_cost: estimated_cost,
                    savings_vs_default: (estimated_cost - cost).max(0.0),
                    crossed_provider: changed,
                }
            } else {
                let flat_text_now = params.prompt.flat_text();
                let score = self.complexity.lock().await.score(&flat_text_now, |t| estimator::estimate(t, family));
                let requirements = RoutingRequirements {
                    min_tier: score.tier.recommended_pricing_tier(),
                    min_context_window: 0,
                    required_capabilities: Vec::new(),
                };
                let mut router_config = self.config.router.clone();
                router_config.default_model_id = params.model_id.clone();
                let holdback_roll = deterministic_roll(&flat_text_now);
                router::route(&self.pricing, &router_config, &requirements, original_token_count, DEFAULT_PREDICTED_OUTPUT_TOKENS, holdback_roll)
            };

            match decision.outcome {
                RoutingOutcome::Holdback => {
                    sidecar.ab_test_holdout = true;
                    if !dry_run {
                        self.emit(EventKind::RouterHoldback, json!({"model_id": decision.model_id}));
                    }
                }
                RoutingOutcome::Routed if decision.model_id != params.model_id => {
                    if dry_run {
                        sidecar.dry_run_notes.push(DryRunNote::RouterWouldRoute { model_id: decision.model_id.clone() });
                    } else {
                        self.emit(EventKind::RouterDowngraded, json!({"from": params.model_id, "to": decision.model_id}));
                        params.model_id = decision.model_id.clone();
                    }
                }
                _ => {}
            }
            sidecar.router_decision = Some(decision);
        }

        // 9. Prefix optimizer: stable-sort messages so system content leads,
        // maximizing the odds a provider's own prefix cache hits.
        let messages = params.prompt.as_messages();
        if self.config.modules.prefix
            && !dry_run
            && messages.iter().enumerate().any(|(i, m)| m.role == Role::System && i != 0)
        {
            let mut reordered = messages.clone();
            reordered.sort_by_key(|m| if m.role == Role::System { 0 } else { 1 });
            params.prompt = Prompt::Messages(reordered);
        }

        Ok((params, sidecar))
    }

    /// Run the post-call record (spec.md §4.13.2) given the sidecar from
    /// `transform` and the model invocation's outcome.
    async fn record_success(&self, params: &RequestParams, sidecar: Sidecar, result: InvokerResult) -> Result<InvokerResult> {
        let pricing = self.pricing.price(&params.model_id);
        let actual_cost = pricing.entry.calculate_cost(result.usage.prompt_tokens, result.usage.completion_tokens);

        if let Some(reservation) = sidecar.reservation {
            self.budget.commit(reservation, actual_cost).await;
            self.emit(EventKind::UserBudgetSpend, json!({"user_id": sidecar.user_id, "cost": actual_cost}));
        }
        self.breaker.record_spend(actual_cost).await;

        if self.config.modules.ledger {
            let (entry, degraded) = self
                .ledger
                .record(Some(&sidecar.user_id), &params.model_id, result.usage.prompt_tokens, result.usage.completion_tokens, actual_cost)
                .await;
            if degraded {
                self.emit(EventKind::StorageError, json!({"component": "ledger"}));
            }
            self.emit(
                EventKind::LedgerEntry,
                json!({"entry_id": entry.id, "cost": actual_cost, "saved_tokens": sidecar.total_saved_tokens()}),
            );
            self.audit(
                "ledger:entry",
                AuditSeverity::Info,
                json!({"user_id": sidecar.user_id, "model_id": params.model_id, "cost": actual_cost}),
            );
        }

        if let Some(report) = self.anomaly.lock().await.observe(actual_cost) {
            self.emit(EventKind::AnomalyDetected, json!(report));
        }

        if let Some(token) = &sidecar.guard_token {
            self.guard.complete_request(token, actual_cost).await;
        }

        if self.config.modules.cache {
            self.cache
                .store(&params.model_id, &params.prompt.flat_text(), result.text.clone(), result.usage.prompt_tokens, result.usage.completion_tokens)
                .await;
            if self.cache.take_storage_error() {
                self.emit(EventKind::StorageError, json!({"component": "cache"}));
            }
            self.emit(EventKind::CacheStore, json!({"model_id": params.model_id}));
        }

        Ok(result)
    }

    async fn record_cache_hit(&self, sidecar: Sidecar, hit: CacheHit) -> Result<InvokerResult> {
        if let Some(reservation) = sidecar.reservation {
            self.budget.commit(reservation, 0.0).await;
        }
        self.breaker.record_spend(0.0).await;

        let saved_cost = self.pricing.price(&hit.entry.model_id).entry.calculate_cost(hit.entry.input_tokens, hit.entry.output_tokens);
        if self.config.modules.ledger {
            let (entry, degraded) = self.ledger.record(Some(&sidecar.user_id), &hit.entry.model_id, 0, 0, 0.0).await;
            if degraded {
                self.emit(EventKind::StorageError, json!({"component": "ledger"}));
            }
            self.emit(EventKind::LedgerEntry, json!({"entry_id": entry.id, "cost": 0.0, "saved": saved_cost}));
        }

        if let Some(token) = &sidecar.guard_token {
            self.guard.complete_request(token, 0.0).await;
            self.guard.record_savings(saved_cost).await;
        }

        Ok(InvokerResult {
            text: hit.entry.response_text.clone(),
            usage: crate::types::Usage::default(),
            finish_reason: match hit.kind {
                HitKind::Exact | HitKind::Fuzzy => crate::types::FinishReason::Stop,
            },
        })
    }

    async fn release_on_failure(&self, sidecar: Sidecar) {
        if let Some(reservation) = sidecar.reservation {
            self.budget.release(reservation).await;
        }
        if let Some(token) = &sidecar.guard_token {
            self.guard.complete_request(token, 0.0).await;
        }
    }

    /// Run `transform`, then either serve a cache hit or invoke the
    /// caller-supplied model function and run `record`. Reservations and
    /// in-flight slots are always released, whichever path is taken.
    pub async fn wrap<F, Fut>(&self, params: RequestParams, invoke: F) -> Result<InvokerResult>
    where
        F: FnOnce(RequestParams) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<InvokerResult, Box<dyn std::error::Error + Send + Sync>>>,
    {
        let (transformed, sidecar) = self.transform(params).await?;

        if let Some(hit) = sidecar.cache_hit.clone() {
            return self.record_cache_hit(sidecar, hit).await;
        }

        match invoke(transformed.clone()).await {
            Ok(result) => self.record_success(&transformed, sidecar, result).await,
            Err(source) => {
                self.release_on_failure(sidecar).await;
                Err(Error::invoker(InvokerError(source)))
            }
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let cache_stats = self.cache.stats().await;
        let guard_stats = self.guard.stats().await;
        let breaker_spend = self.breaker.spend_snapshot().await;
        let ledger_summary = self.ledger.summary().await;

        let breaker_tripped = breaker_spend.values().any(|v| *v > 0.0)
            && matches!(self.breaker.check(0.0).await.0, BreakerDecision::Deny(_));

        HealthReport {
            healthy: !self.persistence.is_degraded(),
            modules: enabled_module_names(&self.config.modules),
            cache_hit_rate: cache_stats.hit_rate(),
            guard_blocked_rate: guard_stats.blocked_rate,
            breaker_tripped,
            total_spent: ledger_summary.total_cost,
            total_saved: guard_stats.total_saved_dollars,
        }
    }
}

fn enabled_module_names(modules: &crate::config::ModuleToggles) -> Vec<String> {
    let mut names = Vec::new();
    if modules.guard { names.push("guard".to_string()); }
    if modules.cache { names.push("cache".to_string()); }
    if modules.compressor { names.push("compressor".to_string()); }
    if modules.delta { names.push("delta".to_string()); }
    if modules.trimmer { names.push("trimmer".to_string()); }
    if modules.router { names.push("router".to_string()); }
    if modules.prefix { names.push("prefix".to_string()); }
    if modules.breaker { names.push("breaker".to_string()); }
    if modules.user_budget { names.push("user_budget".to_string()); }
    if modules.anomaly_detector { names.push("anomaly_detector".to_string()); }
    if modules.audit_log { names.push("audit_log".to_string()); }
    if modules.ledger { names.push("ledger".to_string()); }
    names
}

fn budget_denied_reason(denied: &BudgetDenied) -> String {
    match denied {
        BudgetDenied::DailyLimitExceeded { projected, limit } => {
            format!("daily budget exceeded: projected ${projected:.4} > limit ${limit:.4}")
        }
        BudgetDenied::MonthlyLimitExceeded { projected, limit } => {
            format!("monthly budget exceeded: projected ${projected:.4} > limit ${limit:.4}")
        }
    }
}

/// A stable pseudo-random draw in `[0, 1)` derived from the prompt text,
/// used for A/B holdback when the caller hasn't supplied an explicit roll.
/// Deterministic per prompt so repeated identical requests land on the
/// same side of the split within a process lifetime.
fn deterministic_roll(text: &str) -> f64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    Utc::now().date_naive().hash(&mut hasher);
    (hasher.finish() % 1_000_000) as f64 / 1_000_000.0
}

#[derive(Debug)]
struct InvokerError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for InvokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, Usage};

    fn test_pipeline() -> Pipeline {
        let mut config = Config::default();
        config.guard.dedup_window_seconds = 0;
        config.guard.debounce_ms = 0;
        Pipeline::new(config).unwrap()
    }

    async fn ok_invoker(_params: RequestParams) -> std::result::Result<InvokerResult, Box<dyn std::error::Error + Send + Sync>> {
        Ok(InvokerResult {
            text: "a response".to_string(),
            usage: Usage { prompt_tokens: 20, completion_tokens: 10 },
            finish_reason: FinishReason::Stop,
        })
    }

    #[tokio::test]
    async fn wrap_runs_end_to_end_on_a_fresh_prompt() {
        let pipeline = test_pipeline();
        let params = RequestParams::new("gpt-4o-mini", "What is the capital of France?");
        let result = pipeline.wrap(params, ok_invoker).await.unwrap();
        assert_eq!(result.text, "a response");
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let pipeline = test_pipeline();
        let params1 = RequestParams::new("gpt-4o-mini", "Explain photosynthesis in detail please.");
        pipeline.wrap(params1, ok_invoker).await.unwrap();

        let params2 = RequestParams::new("gpt-4o-mini", "Explain photosynthesis in detail please.");
        let result = pipeline.wrap(params2, ok_invoker).await.unwrap();
        assert_eq!(result.text, "a response");
        assert_eq!(result.usage.total(), 0);
    }

    #[tokio::test]
    async fn budget_blocks_expensive_request_after_spend() {
        let mut config = Config::default();
        config.user_budget.default_policy.daily_limit = 0.0001;
        config.user_budget.default_policy.monthly_limit = 0.0001;
        let pipeline = Pipeline::new(config).unwrap();

        let mut params = RequestParams::new("gpt-4o", "Write a long essay about distributed systems reliability.");
        params.user_id = Some("u1".to_string());
        let result = pipeline.wrap(params, ok_invoker).await;
        assert!(matches!(result, Err(Error::Blocked { .. })));
    }

    #[tokio::test]
    async fn invoker_failure_releases_reservation() {
        let pipeline = test_pipeline();
        let mut params = RequestParams::new("gpt-4o-mini", "Trigger an invoker failure path please.");
        params.user_id = Some("u2".to_string());

        async fn failing_invoker(_params: RequestParams) -> std::result::Result<InvokerResult, Box<dyn std::error::Error + Send + Sync>> {
            Err("invocation failed".into())
        }

        let result = pipeline.wrap(params, failing_invoker).await;
        assert!(matches!(result, Err(Error::Invoker(_))));

        let (daily, _) = pipeline.budget.spend_for("u2").await;
        assert_eq!(daily, 0.0);
    }

    #[tokio::test]
    async fn health_check_reports_module_list() {
        let pipeline = test_pipeline();
        let report = pipeline.health_check().await;
        assert!(report.modules.contains(&"cache".to_string()));
        assert!(report.healthy);
    }
}
