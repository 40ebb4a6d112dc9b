//! Pricing table (spec.md §4.1, §6 `fetchLatestPricing`).
//!
//! Lookup is exact-match first, then longest registered prefix of the
//! model id (e.g. `"gpt-4o-2024-08-06"` falls back to a registered
//! `"gpt-4o"` entry). An unknown model never returns a zero-cost entry —
//! it falls back to a conservative low-tier rate so budget checks
//! downstream stay meaningful, and the fallback is reported via
//! [`PricingTable::price`]'s return so the caller can emit `cost:fallback`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse model-capability rank (spec.md GLOSSARY: `budget < standard <
/// premium < flagship`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Budget,
    Standard,
    Premium,
    Flagship,
}

/// A model capability flag used by router filtering (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vision,
    ToolUse,
    Caching,
    StructuredOutput,
}

/// Provider a model belongs to, used for cross-provider routing decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provider(pub String);

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single pricing-table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model_id: String,
    pub provider: Provider,
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub context_window: u64,
    pub tier: Tier,
    pub capabilities: Vec<Capability>,
}

impl PricingEntry {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

/// Conservative low-tier fallback rates used for unknown models, so a
/// missing pricing entry never silently computes a zero cost (spec.md
/// §4.1).
const FALLBACK_INPUT_PER_M: f64 = 3.0;
const FALLBACK_OUTPUT_PER_M: f64 = 15.0;
const FALLBACK_CONTEXT_WINDOW: u64 = 128_000;

/// The outcome of a pricing lookup: whether it matched exactly, via
/// prefix, or fell back to the conservative default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingMatch {
    Exact,
    Prefix(String),
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PricingResult {
    pub entry: PricingEntry,
    pub matched: PricingMatch,
}

/// Registry mapping model ids to pricing entries.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: PricingEntry) {
        self.entries.insert(entry.model_id.clone(), entry);
    }

    /// Seed a small set of well-known models across providers, matching
    /// the pricing publicly documented at the time of writing.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for entry in default_entries() {
            table.register(entry);
        }
        table
    }

    /// Exact match, then longest registered prefix, then fallback.
    pub fn price(&self, model_id: &str) -> PricingResult {
        if let Some(entry) = self.entries.get(model_id) {
            return PricingResult {
                entry: entry.clone(),
                matched: PricingMatch::Exact,
            };
        }

        let mut best: Option<&str> = None;
        for key in self.entries.keys() {
            if model_id.starts_with(key.as_str()) {
                if best.map_or(true, |b| key.len() > b.len()) {
                    best = Some(key.as_str());
                }
            }
        }

        if let Some(key) = best {
            return PricingResult {
                entry: self.entries[key].clone(),
                matched: PricingMatch::Prefix(key.to_string()),
            };
        }

        PricingResult {
            entry: PricingEntry {
                model_id: model_id.to_string(),
                provider: Provider::new("unknown"),
                input_per_million: FALLBACK_INPUT_PER_M,
                output_per_million: FALLBACK_OUTPUT_PER_M,
                context_window: FALLBACK_CONTEXT_WINDOW,
                tier: Tier::Budget,
                capabilities: Vec::new(),
            },
            matched: PricingMatch::Fallback,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &PricingEntry> {
        self.entries.values()
    }
}

fn default_entries() -> Vec<PricingEntry> {
    use Capability::*;
    vec![
        PricingEntry {
            model_id: "claude-opus-4".to_string(),
            provider: Provider::new("anthropic"),
            input_per_million: 15.0,
            output_per_million: 75.0,
            context_window: 200_000,
            tier: Tier::Flagship,
            capabilities: vec![Vision, ToolUse, Caching, StructuredOutput],
        },
        PricingEntry {
            model_id: "claude-sonnet-4".to_string(),
            provider: Provider::new("anthropic"),
            input_per_million: 3.0,
            output_per_million: 15.0,
            context_window: 200_000,
            tier: Tier::Premium,
            capabilities: vec![Vision, ToolUse, Caching, StructuredOutput],
        },
        PricingEntry {
            model_id: "claude-haiku-4".to_string(),
            provider: Provider::new("anthropic"),
            input_per_million: 0.8,
            output_per_million: 4.0,
            context_window: 200_000,
            tier: Tier::Standard,
            capabilities: vec![Vision, ToolUse, Caching],
        },
        PricingEntry {
            model_id: "gpt-4o".to_string(),
            provider: Provider::new("openai"),
            input_per_million: 2.5,
            output_per_million: 10.0,
            context_window: 128_000,
            tier: Tier::Premium,
            capabilities: vec![Vision, ToolUse, StructuredOutput],
        },
        PricingEntry {
            model_id: "gpt-4o-mini".to_string(),
            provider: Provider::new("openai"),
            input_per_million: 0.15,
            output_per_million: 0.60,
            context_window: 128_000,
            tier: Tier::Budget,
            capabilities: vec![Vision, ToolUse],
        },
        PricingEntry {
            model_id: "gemini-1.5-pro".to_string(),
            provider: Provider::new("google"),
            input_per_million: 1.25,
            output_per_million: 5.0,
            context_window: 2_000_000,
            tier: Tier::Premium,
            capabilities: vec![Vision, ToolUse, Caching],
        },
        PricingEntry {
            model_id: "gemini-1.5-flash".to_string(),
            provider: Provider::new("google"),
            input_per_million: 0.075,
            output_per_million: 0.30,
            context_window: 1_000_000,
            tier: Tier::Budget,
            capabilities: vec![Vision, ToolUse, Caching],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_takes_priority() {
        let table = PricingTable::with_defaults();
        let result = table.price("gpt-4o-mini");
        assert_eq!(result.matched, PricingMatch::Exact);
    }

    #[test]
    fn longest_prefix_fallback() {
        let mut table = PricingTable::new();
        table.register(PricingEntry {
            model_id: "gpt-4o".to_string(),
            provider: Provider::new("openai"),
            input_per_million: 2.5,
            output_per_million: 10.0,
            context_window: 128_000,
            tier: Tier::Premium,
            capabilities: vec![],
        });

        let a = table.price("gpt-4o-2024-08-06");
        let b = table.price("gpt-4o");
        assert_eq!(a.entry.input_per_million, b.entry.input_per_million);
        assert!(matches!(a.matched, PricingMatch::Prefix(_)));
    }

    #[test]
    fn unknown_model_never_returns_zero_cost() {
        let table = PricingTable::with_defaults();
        let result = table.price("some-totally-unregistered-model-xyz");
        assert_eq!(result.matched, PricingMatch::Fallback);
        assert!(result.entry.input_per_million > 0.0);
        assert!(result.entry.output_per_million > 0.0);
    }

    #[test]
    fn tier_ordering_matches_glossary() {
        assert!(Tier::Budget < Tier::Standard);
        assert!(Tier::Standard < Tier::Premium);
        assert!(Tier::Premium < Tier::Flagship);
    }
}
