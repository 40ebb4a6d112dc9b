//! Live pricing-registry fetch (spec.md §6 `fetchLatestPricing`).
//!
//! Loading pricing data itself is an out-of-scope external collaborator
//! (spec.md §1) — the core only assumes a [`crate::pricing::PricingTable`]
//! exists. This module is the thin, optional fetcher an embedding
//! application can use to keep that table current from a remote registry,
//! gated behind the `pricing-fetch` feature so the default build never
//! pulls in an HTTP client.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pricing::{Capability, PricingEntry, PricingTable, Provider, Tier};

/// Minimum time between two non-forced fetches (spec.md §6: "minimum
/// inter-fetch interval 1 h unless forced").
const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(3_600);

/// Built-in allow-listed registry hosts. Callers may extend this via
/// [`FetchConfig::allowed_hosts`].
fn builtin_allowed_hosts() -> HashSet<String> {
    ["pricing.shieldcore.dev", "openrouter.ai"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub force: bool,
    pub allowed_hosts: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            force: false,
            allowed_hosts: Vec::new(),
        }
    }
}

/// Outcome of a `fetch_latest_pricing` call (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub updated: usize,
    pub added: usize,
    pub errors: Vec<String>,
    pub from_cache: bool,
}

/// Wire shape of one remote registry entry. Every field is validated
/// before it's turned into a [`PricingEntry`] — spec.md §6: "reject
/// invalid entries per-field; never overwrite the registry on a bad
/// response."
#[derive(Debug, Deserialize)]
struct RemoteEntry {
    model_id: String,
    provider: String,
    input_per_million: f64,
    output_per_million: f64,
    context_window: u64,
    tier: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn parse_tier(s: &str) -> Option<Tier> {
    match s {
        "budget" => Some(Tier::Budget),
        "standard" => Some(Tier::Standard),
        "premium" => Some(Tier::Premium),
        "flagship" => Some(Tier::Flagship),
        _ => None,
    }
}

fn parse_capability(s: &str) -> Option<Capability> {
    match s {
        "vision" => Some(Capability::Vision),
        "tool_use" => Some(Capability::ToolUse),
        "caching" => Some(Capability::Caching),
        "structured_output" => Some(Capability::StructuredOutput),
        _ => None,
    }
}

fn validate(entry: RemoteEntry) -> std::result::Result<PricingEntry, String> {
    if entry.model_id.trim().is_empty() {
        return Err("model_id must not be empty".to_string());
    }
    if !(entry.input_per_million.is_finite() && entry.input_per_million >= 0.0) {
        return Err(format!("{}: input_per_million must be a finite non-negative number", entry.model_id));
    }
    if !(entry.output_per_million.is_finite() && entry.output_per_million >= 0.0) {
        return Err(format!("{}: output_per_million must be a finite non-negative number", entry.model_id));
    }
    if entry.context_window == 0 {
        return Err(format!("{}: context_window must be positive", entry.model_id));
    }
    let tier = parse_tier(&entry.tier)
        .ok_or_else(|| format!("{}: unrecognized tier {:?}", entry.model_id, entry.tier))?;

    let mut capabilities = Vec::new();
    for cap in &entry.capabilities {
        match parse_capability(cap) {
            Some(c) => capabilities.push(c),
            None => return Err(format!("{}: unrecognized capability {:?}", entry.model_id, cap)),
        }
    }

    Ok(PricingEntry {
        model_id: entry.model_id,
        provider: Provider::new(entry.provider),
        input_per_million: entry.input_per_million,
        output_per_million: entry.output_per_million,
        context_window: entry.context_window,
        tier,
        capabilities,
    })
}

/// Fetches pricing updates from a remote registry and merges valid
/// entries into a [`PricingTable`]. Rate-limited to one fetch per hour
/// per instance unless `force` is set.
pub struct PricingFetcher {
    client: reqwest::Client,
    last_fetch: Mutex<Option<Instant>>,
}

impl PricingFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            last_fetch: Mutex::new(None),
        }
    }

    /// Fetch `url` and merge any valid entries into `table`. `url` must be
    /// HTTPS and its host must appear in the built-in or caller-supplied
    /// allow-list. Returns without making a network call (`from_cache:
    /// true`) if the minimum fetch interval hasn't elapsed and `force` is
    /// false.
    pub async fn fetch_latest_pricing(
        &self,
        url: &str,
        config: &FetchConfig,
        table: &mut PricingTable,
    ) -> Result<FetchOutcome> {
        let parsed = url::Url::parse(url).map_err(|e| Error::config(format!("invalid pricing URL: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(Error::config("pricing URL must use https"));
        }
        let host = parsed.host_str().ok_or_else(|| Error::config("pricing URL has no host"))?;
        let mut allowed = builtin_allowed_hosts();
        allowed.extend(config.allowed_hosts.iter().cloned());
        if !allowed.contains(host) {
            return Err(Error::config(format!("host {host} is not in the pricing fetch allow-list")));
        }

        {
            let mut last = self.last_fetch.lock().unwrap();
            if !config.force {
                if let Some(prev) = *last {
                    if prev.elapsed() < MIN_FETCH_INTERVAL {
                        return Ok(FetchOutcome { from_cache: true, ..Default::default() });
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_millis(config.timeout_ms))
            .send()
            .await
            .map_err(|e| Error::storage_unavailable(format!("pricing fetch failed: {e}")))?;

        let remote: Vec<RemoteEntry> = response
            .json()
            .await
            .map_err(|e| Error::storage_unavailable(format!("pricing response malformed: {e}")))?;

        let mut outcome = FetchOutcome::default();
        for entry in remote {
            match validate(entry) {
                Ok(parsed_entry) => {
                    let existed = table.price(&parsed_entry.model_id).matched == crate::pricing::PricingMatch::Exact;
                    table.register(parsed_entry);
                    if existed {
                        outcome.updated += 1;
                    } else {
                        outcome.added += 1;
                    }
                }
                Err(reason) => outcome.errors.push(reason),
            }
        }

        Ok(outcome)
    }
}

impl Default for PricingFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_url() {
        let fetcher = PricingFetcher::new();
        let mut table = PricingTable::new();
        let config = FetchConfig::default();
        let result = tokio_test_block_on(fetcher.fetch_latest_pricing("http://pricing.shieldcore.dev/v1", &config, &mut table));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_host_outside_allow_list() {
        let fetcher = PricingFetcher::new();
        let mut table = PricingTable::new();
        let config = FetchConfig::default();
        let result = tokio_test_block_on(fetcher.fetch_latest_pricing("https://evil.example.com/pricing", &config, &mut table));
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_bad_tier() {
        let entry = RemoteEntry {
            model_id: "m".to_string(),
            provider: "p".to_string(),
            input_per_million: 1.0,
            output_per_million: 2.0,
            context_window: 1000,
            tier: "legendary".to_string(),
            capabilities: vec![],
        };
        assert!(validate(entry).is_err());
    }

    #[test]
    fn validate_rejects_negative_rate() {
        let entry = RemoteEntry {
            model_id: "m".to_string(),
            provider: "p".to_string(),
            input_per_million: -1.0,
            output_per_million: 2.0,
            context_window: 1000,
            tier: "budget".to_string(),
            capabilities: vec![],
        };
        assert!(validate(entry).is_err());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
