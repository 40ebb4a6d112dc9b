//! # shieldcore
//!
//! Request-interception middleware that sits between an application and
//! large-language-model backends. For every outbound model invocation it
//! decides whether the call may proceed under spending and rate policies,
//! attempts to satisfy it from a local semantic-response cache, shrinks the
//! prompt losslessly where safe, optionally downgrades the model to a
//! cheaper one the task doesn't need, and accounts actual spend against
//! both instance-wide and per-user budgets once the call completes.
//!
//! ## Core components
//!
//! - **Pipeline** ([`pipeline::Pipeline`]): orchestrates the pre-call
//!   transform and post-call record around a caller-supplied model
//!   invocation function.
//! - **Guard / Breaker / Budget**: admission control at three different
//!   granularities — per-prompt rate limiting, instance-wide spend caps,
//!   and per-user day/month budgets with in-flight reservations.
//! - **Cache**: a model-scoped semantic response cache with exact and
//!   fuzzy (bigram or MinHash/LSH) lookup.
//! - **Compressor / Delta / Trimmer**: lossless-where-safe prompt shrinking.
//! - **Router**: picks the cheapest model meeting a prompt's complexity
//!   requirements.
//! - **Ledger / Audit / Events**: append-only spend accounting, a
//!   tamper-evident hash-chained audit trail, and a typed pub/sub bus.
//!
//! ## Example
//!
//! ```rust,ignore
//! use shieldcore::{Config, Pipeline, RequestParams, InvokerResult, Usage, FinishReason};
//!
//! # async fn run() -> shieldcore::Result<()> {
//! let pipeline = Pipeline::new(Config::default())?;
//! let params = RequestParams::new("gpt-4o", "What is the capital of France?");
//!
//! let result = pipeline.wrap(params, |p| async move {
//!     Ok(InvokerResult {
//!         text: "Paris.".to_string(),
//!         usage: Usage { prompt_tokens: 12, completion_tokens: 3 },
//!         finish_reason: FinishReason::Stop,
//!     })
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod anomaly;
pub mod audit;
pub mod breaker;
pub mod budget;
pub mod cache;
pub mod complexity;
pub mod compressor;
pub mod config;
pub mod delta;
pub mod error;
pub mod estimator;
pub mod events;
pub mod guard;
pub mod ledger;
pub mod persistence;
pub mod pricing;
#[cfg(feature = "pricing-fetch")]
pub mod pricing_fetch;
pub mod router;
pub mod trimmer;
pub mod types;

pub mod pipeline;

// Re-exports for convenience — the surface a typical caller needs without
// reaching into submodules.
pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyReport, Severity as AnomalySeverity};
pub use audit::{AuditConfig, AuditLog, AuditRecord, IntegrityReport, Severity as AuditSeverity};
pub use breaker::{BreakerAction, BreakerConfig, BreakerDecision, CircuitBreaker};
pub use budget::{BudgetDenied, Reservation, UserBudgetConfig, UserBudgetManager};
pub use cache::{
    CacheConfig, CacheEntry, CacheHit, CacheKey, HitKind, SemanticCache, SimilarityStrategy,
};
pub use complexity::{ComplexityScore, ComplexityScorer, ComplexitySignals, ComplexityTier};
pub use compressor::{compress, CompressionResult, CompressorConfig};
pub use config::{Config, ModuleToggles, OnBlockedPolicy};
pub use delta::{DeltaHistory, DeltaResult};
pub use error::{Error, Result};
pub use estimator::{estimate, estimate_messages, EncodingFamily};
pub use events::{Event, EventBus, EventKind};
pub use guard::{GuardConfig, GuardStats, RequestGuard, RequestToken};
pub use ledger::{Ledger, LedgerEntry, LedgerSummary};
pub use persistence::Persistence;
pub use pipeline::{HealthReport, Pipeline, Sidecar};
pub use pricing::{
    Capability, PricingEntry, PricingMatch, PricingResult, PricingTable, Provider, Tier,
};
pub use router::{RouterConfig, RoutingDecision, RoutingOutcome, RoutingRequirements};
pub use trimmer::{TrimConfig, TrimResult};
pub use types::{
    ChatMessage, ContentPart, FinishReason, InvokerResult, Prompt, RequestParams, Role,
    ToolSchema, Usage,
};
