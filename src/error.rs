//! Error taxonomy for shieldcore.
//!
//! Only [`Error::Blocked`] and [`Error::Cancelled`] are meant to escape
//! `Pipeline::transform`/`Pipeline::wrap` to the caller (spec.md §7's
//! propagation rule). Every other variant is either raised at construction
//! time ([`Error::Config`]) or caught internally and converted into an
//! event (`storage:error`, `cost:fallback`) — they exist as variants mainly
//! so internal plumbing and tests have a uniform `Result` to work with.

use thiserror::Error;

/// Result type alias using shieldcore's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Static configuration violation, raised at construction. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request was denied by the guard, breaker, or budget manager.
    #[error("blocked: {reason} (estimated cost ${estimated_cost:.6})")]
    Blocked {
        reason: String,
        estimated_cost: f64,
    },

    /// A caller-supplied cancellation signal reached the pipeline.
    #[error("request cancelled")]
    Cancelled,

    /// The persistence backend is missing or failing. Never returned from
    /// a public entry point — callers observe this only via `storage:error`
    /// events; kept as a variant for internal control flow.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A model id has no pricing entry and no registered prefix fallback
    /// matched either. Never fatal; downstream falls back to the
    /// conservative low-tier rate and emits `cost:fallback`.
    #[error("no pricing entry for model {0}")]
    PricingUnknown(String),

    /// The caller-supplied model invocation function returned an error.
    /// Reservations are released, no ledger entry is recorded, and this
    /// is rethrown to the caller of `wrap`.
    #[error("model invocation failed: {0}")]
    Invoker(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An invariant was violated internally (should not happen in
    /// practice; surfaced rather than silently swallowed).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn blocked(reason: impl Into<String>, estimated_cost: f64) -> Self {
        Self::Blocked {
            reason: reason.into(),
            estimated_cost,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    pub fn pricing_unknown(model_id: impl Into<String>) -> Self {
        Self::PricingUnknown(model_id.into())
    }

    pub fn invoker(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Invoker(Box::new(source))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this is one of the two variants the pipeline propagates to
    /// its caller (spec.md §7).
    pub fn is_propagated(&self) -> bool {
        matches!(self, Error::Blocked { .. } | Error::Cancelled)
    }
}
