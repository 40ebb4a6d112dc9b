//! Model router (spec.md §4.9): given a complexity tier and a set of
//! requirements, pick the cheapest model in the pricing table that
//! satisfies them, falling back to the caller's default model whenever no
//! candidate qualifies or an A/B holdback draw opts the request out.

use serde::{Deserialize, Serialize};

use crate::pricing::{Capability, PricingTable, Provider, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Model the caller would have used with routing disabled.
    pub default_model_id: String,
    /// Restrict candidates to these providers. `None` means no restriction
    /// beyond `cross_provider`.
    pub allowed_providers: Option<Vec<Provider>>,
    /// Allow routing to a different provider than the default model's.
    /// When `false`, candidates are additionally filtered to the default
    /// model's own provider.
    pub cross_provider: bool,
    /// Fraction of requests (`[0, 1]`) held back from routing entirely,
    /// for A/B comparison against the unrouted baseline.
    pub holdback_fraction: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model_id: "claude-sonnet-4".to_string(),
            allowed_providers: None,
            cross_provider: false,
            holdback_fraction: 0.0,
        }
    }
}

/// Requirements a candidate model must satisfy (spec.md §4.9).
#[derive(Debug, Clone, Default)]
pub struct RoutingRequirements {
    pub min_tier: Tier,
    pub min_context_window: u64,
    pub required_capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingOutcome {
    /// Routed to a cheaper (or equal-cost) candidate than the default.
    Routed,
    /// No qualifying candidate existed; fell back to the default model.
    FellBackToDefault,
    /// Held back from routing by the A/B split.
    Holdback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model_id: String,
    pub outcome: RoutingOutcome,
    pub estimated_cost: f64,
    pub default_cost: f64,
    pub savings_vs_default: f64,
    pub crossed_provider: bool,
}

/// Route a request, given its token estimates and requirements.
///
/// `holdback_roll` is a caller-supplied draw in `[0, 1)` used against
/// `config.holdback_fraction` — the router itself never generates
/// randomness, so routing decisions stay reproducible in tests.
pub fn route(
    table: &PricingTable,
    config: &RouterConfig,
    requirements: &RoutingRequirements,
    input_tokens: u64,
    estimated_output_tokens: u64,
    holdback_roll: f64,
) -> RoutingDecision {
    let default_entry = table.price(&config.default_model_id).entry;
    let default_cost = default_entry.calculate_cost(input_tokens, estimated_output_tokens);

    if holdback_roll < config.holdback_fraction {
        return RoutingDecision {
            model_id: config.default_model_id.clone(),
            outcome: RoutingOutcome::Holdback,
            estimated_cost: default_cost,
            default_cost,
            savings_vs_default: 0.0,
            crossed_provider: false,
        };
    }

    let mut candidates: Vec<_> = table
        .all()
        .filter(|entry| entry.tier >= requirements.min_tier)
        .filter(|entry| entry.context_window >= requirements.min_context_window)
        .filter(|entry| {
            requirements
                .required_capabilities
                .iter()
                .all(|cap| entry.has_capability(*cap))
        })
        .filter(|entry| {
            config
                .allowed_providers
                .as_ref()
                .map_or(true, |providers| providers.contains(&entry.provider))
        })
        .filter(|entry| config.cross_provider || entry.provider == default_entry.provider)
        .collect();

    candidates.sort_by(|a, b| {
        let cost_a = a.calculate_cost(input_tokens, estimated_output_tokens);
        let cost_b = b.calculate_cost(input_tokens, estimated_output_tokens);
        cost_a.partial_cmp(&cost_b).unwrap_or(std::cmp::Ordering::Equal)
    });

    match candidates.first() {
        Some(best) => {
            let cost = best.calculate_cost(input_tokens, estimated_output_tokens);
            RoutingDecision {
                model_id: best.model_id.clone(),
                outcome: RoutingOutcome::Routed,
                estimated_cost: cost,
                default_cost,
                savings_vs_default: (default_cost - cost).max(0.0),
                crossed_provider: best.provider != default_entry.provider,
            }
        }
        None => RoutingDecision {
            model_id: config.default_model_id.clone(),
            outcome: RoutingOutcome::FellBackToDefault,
            estimated_cost: default_cost,
            default_cost,
            savings_vs_default: 0.0,
            crossed_provider: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_cheapest_qualifying_candidate() {
        let table = PricingTable::with_defaults();
        let config = RouterConfig {
            default_model_id: "claude-opus-4".to_string(),
            cross_provider: false,
            ..RouterConfig::default()
        };
        let requirements = RoutingRequirements {
            min_tier: Tier::Budget,
            min_context_window: 1000,
            required_capabilities: vec![],
        };
        let decision = route(&table, &config, &requirements, 1000, 500, 1.0);
        assert_eq!(decision.outcome, RoutingOutcome::Routed);
        assert!(decision.estimated_cost <= decision.default_cost);
    }

    #[test]
    fn falls_back_to_default_when_no_candidate_qualifies() {
        let table = PricingTable::with_defaults();
        let config = RouterConfig::default();
        let requirements = RoutingRequirements {
            min_tier: Tier::Flagship,
            min_context_window: 10_000_000,
            required_capabilities: vec![],
        };
        let decision = route(&table, &config, &requirements, 100, 100, 1.0);
        assert_eq!(decision.outcome, RoutingOutcome::FellBackToDefault);
        assert_eq!(decision.model_id, config.default_model_id);
    }

    #[test]
    fn holdback_roll_below_fraction_skips_routing() {
        let table = PricingTable::with_defaults();
        let config = RouterConfig {
            holdback_fraction: 0.5,
            ..RouterConfig::default()
        };
        let requirements = RoutingRequirements::default();
        let decision = route(&table, &config, &requirements, 100, 100, 0.1);
        assert_eq!(decision.outcome, RoutingOutcome::Holdback);
    }

    #[test]
    fn cross_provider_disabled_stays_within_default_provider() {
        let table = PricingTable::with_defaults();
        let config = RouterConfig {
            default_model_id: "claude-opus-4".to_string(),
            cross_provider: false,
            ..RouterConfig::default()
        };
        let requirements = RoutingRequirements::default();
        let decision = route(&table, &config, &requirements, 100, 100, 1.0);
        assert!(!decision.crossed_provider);
    }
}
