//! Root configuration (spec.md §6 config schema + ambient stack). All
//! sub-configs derive `Default` so a caller can opt into only the
//! modules they need; `Config::from_toml_str`/`from_file` let the whole
//! tree be loaded from a TOML document.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::anomaly::AnomalyConfig;
use crate::breaker::BreakerConfig;
use crate::budget::UserBudgetConfig;
use crate::cache::CacheConfig;
use crate::compressor::CompressorConfig;
use crate::error::{Error, Result};
use crate::guard::GuardConfig;
use crate::router::RouterConfig;
use crate::trimmer::TrimConfig;

/// Per-module enable flags (spec.md §6 `modules.*`). Every module can be
/// switched off independently; the pipeline controller skips a disabled
/// step entirely rather than running it in a no-op mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleToggles {
    pub guard: bool,
    pub cache: bool,
    pub compressor: bool,
    pub delta: bool,
    pub trimmer: bool,
    pub router: bool,
    pub prefix: bool,
    pub breaker: bool,
    pub user_budget: bool,
    pub anomaly_detector: bool,
    pub audit_log: bool,
    pub ledger: bool,
}

impl Default for ModuleToggles {
    fn default() -> Self {
        Self {
            guard: true,
            cache: true,
            compressor: true,
            delta: true,
            trimmer: true,
            router: false,
            prefix: true,
            breaker: true,
            user_budget: true,
            anomaly_detector: true,
            audit_log: true,
            ledger: true,
        }
    }
}

/// What the pipeline does when a call is blocked (spec.md §6 `onBlocked`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnBlockedPolicy {
    /// Propagate `Error::Blocked` to the caller (default, spec.md §7).
    Propagate,
    /// Swallow the block and return the cached response if one exists,
    /// otherwise still propagate.
    PreferCache,
}

impl Default for OnBlockedPolicy {
    fn default() -> Self {
        OnBlockedPolicy::Propagate
    }
}

/// Logging configuration. Uses `tracing`, matching the ambient logging
/// stack the rest of the crate's async components already depend on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter`-compatible directive string, e.g.
    /// `"shieldcore=debug,warn"`. Left to the caller to install — the
    /// crate itself never installs a global subscriber, since doing so
    /// from a library would fight the embedding application's own setup.
    pub filter_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directive: "shieldcore=info".to_string(),
        }
    }
}

/// Dry-run mode (spec.md §6 `dryRun`): exercise every lookup/decision
/// step without mutating observable state (no cache writes, no ledger
/// entries, no reservation commits) and report what *would* have
/// happened via [`crate::pipeline::DryRunNote`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunConfig {
    pub enabled: bool,
}

/// Persistence configuration (ambient addition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database file. `None` uses an in-memory store.
    pub path: Option<String>,
    pub timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout_ms: 5_000,
        }
    }
}

/// The full configuration tree for a [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modules: ModuleToggles,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    pub trimmer: TrimConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub user_budget: UserBudgetConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub on_blocked: OnBlockedPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("could not read config file: {e}")))?;
        Self::from_toml_str(&contents)
    }

    /// Validate cross-field invariants that serde's per-field defaults
    /// can't express (spec.md §7: configuration errors are fatal and
    /// raised at construction, never mid-pipeline).
    pub fn validate(&self) -> Result<()> {
        if self.breaker.warning_threshold <= 0.0 || self.breaker.warning_threshold > 1.0 {
            return Err(Error::config("breaker.warning_threshold must be in (0, 1]"));
        }
        if self.user_budget.warning_threshold <= 0.0 || self.user_budget.warning_threshold > 1.0 {
            return Err(Error::config("user_budget.warning_threshold must be in (0, 1]"));
        }
        if self.cache.similarity_threshold < 0.0 || self.cache.similarity_threshold > 1.0 {
            return Err(Error::config("cache.similarity_threshold must be in [0, 1]"));
        }
        if self.router.holdback_fraction < 0.0 || self.router.holdback_fraction > 1.0 {
            return Err(Error::config("router.holdback_fraction must be in [0, 1]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let mut config = Config::default();
        config.breaker.warning_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [modules]
            guard = true
            cache = false
            compressor = true
            delta = true
            trimmer = true
            router = true
            breaker = true
            user_budget = true
            anomaly_detector = true
            audit_log = true
        "#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert!(!config.modules.cache);
        assert!(config.modules.guard);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let result = Config::from_toml_str("not valid toml {{{");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
