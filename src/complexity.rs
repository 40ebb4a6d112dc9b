//! Complexity scorer (spec.md §4.9): nine weighted signals over prompt
//! text combine into a 0-100 composite score, which buckets into a tier
//! the model router uses to pick a minimum acceptable model class.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;

use crate::pricing::Tier;

static REASONING_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(because|therefore|thus|step[- ]by[- ]step|reasoning|analyze|explain\s+why|trade-?off|consider|evaluate|compare)\b")
        .expect("invalid regex")
});

static CONSTRAINT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(must|should\s+not|exactly|only|never|always|strictly|require[sd]?|within\s+\d|no\s+more\s+than|at\s+least)\b")
        .expect("invalid regex")
});

static STRUCTURED_OUTPUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(json|yaml|table|csv|schema|markdown\s+table|bullet\s+list|xml)\b")
        .expect("invalid regex")
});

static SUBTASK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]|\d+[.)])\s+\S").expect("invalid regex")
});

static CODE_TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|`[^`\n]+`|\b(fn|def|class|function|impl|struct|const|let|var)\b")
        .expect("invalid regex")
});

static CONTEXT_DEPENDENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(above|previous(?:ly)?|that\s+file|this\s+file|earlier|as\s+(?:I|we)\s+(?:said|mentioned)|the\s+same\s+(?:one|thing))\b")
        .expect("invalid regex")
});

/// The nine raw signals extracted from a prompt (spec.md §4.9).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexitySignals {
    pub token_count: u64,
    pub avg_word_length: f64,
    pub sentence_count: u64,
    pub lexical_diversity: f64,
    pub code_token_count: u64,
    pub reasoning_keyword_count: u64,
    pub constraint_keyword_count: u64,
    pub structured_output_requested: bool,
    pub sub_task_count: u64,
    pub context_dependency: bool,
}

fn sentence_count(text: &str) -> u64 {
    text.chars().filter(|c| matches!(c, '.' | '!' | '?')).count().max(1) as u64
}

impl ComplexitySignals {
    /// Extract signals from raw prompt text.
    pub fn extract(text: &str, estimate: impl Fn(&str) -> u64) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();
        let word_count = words.len().max(1);
        let total_word_len: usize = words.iter().map(|w| w.chars().count()).sum();
        let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();

        Self {
            token_count: estimate(text),
            avg_word_length: total_word_len as f64 / word_count as f64,
            sentence_count: sentence_count(text),
            lexical_diversity: unique.len() as f64 / word_count as f64,
            code_token_count: CODE_TOKEN_PATTERN.find_iter(text).count() as u64,
            reasoning_keyword_count: REASONING_KEYWORDS.find_iter(text).count() as u64,
            constraint_keyword_count: CONSTRAINT_KEYWORDS.find_iter(text).count() as u64,
            structured_output_requested: STRUCTURED_OUTPUT_PATTERN.is_match(text),
            sub_task_count: SUBTASK_PATTERN.find_iter(text).count() as u64,
            context_dependency: CONTEXT_DEPENDENCY_PATTERN.is_match(text),
        }
    }

    /// Weighted composite score in `[0, 100]` (spec.md §4.9): tokens up to
    /// 25, reasoning keywords up to 20 at 5/each, constraints up to 10 at
    /// 2.5/each, code up to 15 at 1.5/each, diversity ×10, structured +5,
    /// sub-tasks up to 10 at 3/each, context-dependency +5.
    pub fn score(&self) -> f64 {
        let token_component = (self.token_count as f64 / 2000.0 * 25.0).min(25.0);
        let reasoning_component = (self.reasoning_keyword_count as f64 * 5.0).min(20.0);
        let constraint_component = (self.constraint_keyword_count as f64 * 2.5).min(10.0);
        let code_component = (self.code_token_count as f64 * 1.5).min(15.0);
        let diversity_component = (self.lexical_diversity * 10.0).clamp(0.0, 10.0);
        let structured_component = if self.structured_output_requested { 5.0 } else { 0.0 };
        let subtask_component = (self.sub_task_count as f64 * 3.0).min(10.0);
        let context_component = if self.context_dependency { 5.0 } else { 0.0 };

        (token_component
            + reasoning_component
            + constraint_component
            + code_component
            + diversity_component
            + structured_component
            + subtask_component
            + context_component)
            .clamp(0.0, 100.0)
    }
}

/// Complexity tier a prompt falls into, from the composite score
/// (thresholds 15/35/55/75, spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplexityTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl ComplexityTier {
    pub fn from_score(score: f64) -> Self {
        if score < 15.0 {
            ComplexityTier::Trivial
        } else if score < 35.0 {
            ComplexityTier::Simple
        } else if score < 55.0 {
            ComplexityTier::Moderate
        } else if score < 75.0 {
            ComplexityTier::Complex
        } else {
            ComplexityTier::Expert
        }
    }

    /// The minimum model-pricing tier this complexity tier should route to.
    pub fn recommended_pricing_tier(self) -> Tier {
        match self {
            ComplexityTier::Trivial | ComplexityTier::Simple => Tier::Budget,
            ComplexityTier::Moderate => Tier::Standard,
            ComplexityTier::Complex => Tier::Premium,
            ComplexityTier::Expert => Tier::Flagship,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub signals: ComplexitySignals,
    pub score: f64,
    pub tier: ComplexityTier,
}

/// Prompts longer than this are never cached: they're unlikely to recur
/// verbatim and hashing/storing them isn't worth the memory.
const CACHE_SKIP_CHAR_THRESHOLD: usize = 10_000;
const CACHE_CAPACITY: usize = 100;

struct CacheEntry {
    key: String,
    score: ComplexityScore,
}

/// FIFO-evicting memo of recent complexity scores, keyed by exact prompt
/// text (spec.md §4.9: repeated identical prompts shouldn't be rescored).
pub struct ComplexityScorer {
    cache: VecDeque<CacheEntry>,
}

impl Default for ComplexityScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplexityScorer {
    pub fn new() -> Self {
        Self {
            cache: VecDeque::with_capacity(CACHE_CAPACITY),
        }
    }

    /// Score `text`, using (and populating) the FIFO memo unless it's too
    /// long to be worth caching.
    pub fn score(&mut self, text: &str, estimate: impl Fn(&str) -> u64) -> ComplexityScore {
        if text.chars().count() > CACHE_SKIP_CHAR_THRESHOLD {
            let signals = ComplexitySignals::extract(text, estimate);
            let score = signals.score();
            return ComplexityScore {
                tier: ComplexityTier::from_score(score),
                signals,
                score,
            };
        }

        if let Some(entry) = self.cache.iter().find(|e| e.key == text) {
            return entry.score.clone();
        }

        let signals = ComplexitySignals::extract(text, estimate);
        let score = signals.score();
        let result = ComplexityScore {
            tier: ComplexityTier::from_score(score),
            signals,
            score,
        };

        if self.cache.len() >= CACHE_CAPACITY {
            self.cache.pop_front();
        }
        self.cache.push_back(CacheEntry {
            key: text.to_string(),
            score: result.clone(),
        });

        result
    }
}

fn rough_tokens(text: &str) -> u64 {
    crate::estimator::estimate(text, crate::estimator::EncodingFamily::O200k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_prompt_scores_low() {
        let signals = ComplexitySignals::extract("What is 2+2?", rough_tokens);
        let score = signals.score();
        assert_eq!(ComplexityTier::from_score(score), ComplexityTier::Trivial);
    }

    #[test]
    fn complex_prompt_with_code_and_reasoning_scores_higher() {
        let text = "Analyze why this fails because of a race condition, considering the tradeoffs. \
                    Must handle exactly three retries. Provide output as JSON.\n```rust\nfn run() {}\n```\n\
                    Steps:\n1. reproduce\n2. isolate\n3. fix";
        let signals = ComplexitySignals::extract(text, rough_tokens);
        assert!(signals.reasoning_keyword_count > 0);
        assert!(signals.constraint_keyword_count > 0);
        assert!(signals.structured_output_requested);
        assert!(signals.sub_task_count >= 3);
        let score = signals.score();
        assert!(score > 35.0);
    }

    #[test]
    fn tier_maps_to_pricing_tier_monotonically() {
        assert_eq!(ComplexityTier::Trivial.recommended_pricing_tier(), Tier::Budget);
        assert_eq!(ComplexityTier::Moderate.recommended_pricing_tier(), Tier::Standard);
        assert_eq!(ComplexityTier::Complex.recommended_pricing_tier(), Tier::Premium);
        assert_eq!(ComplexityTier::Expert.recommended_pricing_tier(), Tier::Flagship);
    }

    #[test]
    fn scorer_caches_identical_prompts() {
        let mut scorer = ComplexityScorer::new();
        let a = scorer.score("repeat this exact prompt", rough_tokens);
        let b = scorer.score("repeat this exact prompt", rough_tokens);
        assert_eq!(a.score, b.score);
        assert_eq!(scorer.cache.len(), 1);
    }

    #[test]
    fn scorer_skips_cache_for_very_long_prompts() {
        let mut scorer = ComplexityScorer::new();
        let long_text = "word ".repeat(3000);
        scorer.score(&long_text, rough_tokens);
        assert_eq!(scorer.cache.len(), 0);
    }

    #[test]
    fn cache_evicts_oldest_entry_at_capacity() {
        let mut scorer = ComplexityScorer::new();
        for i in 0..(CACHE_CAPACITY + 5) {
            scorer.score(&format!("unique prompt number {i}"), rough_tokens);
        }
        assert_eq!(scorer.cache.len(), CACHE_CAPACITY);
    }

    #[test]
    fn context_dependency_detected() {
        let signals = ComplexitySignals::extract("As I mentioned earlier, fix that file.", rough_tokens);
        assert!(signals.context_dependency);
    }
}
