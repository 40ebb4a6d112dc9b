//! Token estimation (spec.md §4.1).
//!
//! `estimate` approximates BPE tokenization without pulling in a real
//! tokenizer — spec.md §1 explicitly scopes the exact BPE library out of
//! the core and assumes only a `countTokens(text) -> int` contract. The
//! approximation here is char-based (close enough to o200k-style English
//! text at ~4 chars/token) and is scaled per provider family.

use serde::{Deserialize, Serialize};

/// Provider tokenizer family, used to pick a correction factor when the
/// exact encoding isn't available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingFamily {
    /// o200k-style BPE (OpenAI-class models). Baseline, factor 1.0.
    O200k,
    /// Anthropic-style tokenizer, runs ~35% higher than o200k on the same text.
    Anthropic,
    /// SentencePiece-style tokenizer, runs ~12% higher than o200k.
    SentencePiece,
}

impl EncodingFamily {
    fn correction_factor(self) -> f64 {
        match self {
            EncodingFamily::O200k => 1.0,
            EncodingFamily::Anthropic => 1.35,
            EncodingFamily::SentencePiece => 1.12,
        }
    }

    /// Guess the encoding family from a model id.
    pub fn for_model(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("claude") {
            EncodingFamily::Anthropic
        } else if lower.contains("gemini") || lower.contains("llama") || lower.contains("mistral")
        {
            EncodingFamily::SentencePiece
        } else {
            EncodingFamily::O200k
        }
    }
}

/// Fixed per-message chat overhead, independent of content length.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 5; // 4 structural + ~1 role
/// Fixed priming constant added once for the assistant's reply slot.
pub const ASSISTANT_PRIMING_TOKENS: u64 = 3;

/// Estimate the token count of a raw string under a given encoding family.
///
/// This is a heuristic (chars/4, word-boundary adjusted) rather than an
/// exact BPE count; callers needing exact counts should use their own
/// tokenizer and can ignore this estimator entirely — every pipeline step
/// that consumes a token count takes a plain `u64`.
pub fn estimate(text: &str, family: EncodingFamily) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f64;
    let words = text.split_whitespace().count().max(1) as f64;
    // Blend a char-based and word-based estimate: short, punctuation-heavy
    // text tokenizes closer to 1 token per 3.5 chars, natural-language text
    // closer to 0.75 tokens per word. Average the two heuristics.
    let char_estimate = chars / 3.5;
    let word_estimate = words * 1.3;
    let base = (char_estimate + word_estimate) / 2.0;
    (base * family.correction_factor()).ceil() as u64
}

/// Estimate the token count of a full chat exchange: per-message overhead
/// plus content, plus the assistant priming constant.
pub fn estimate_messages(texts: &[&str], family: EncodingFamily) -> u64 {
    let content: u64 = texts.iter().map(|t| estimate(t, family)).sum();
    let overhead = MESSAGE_OVERHEAD_TOKENS * texts.len() as u64;
    content + overhead + ASSISTANT_PRIMING_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate("", EncodingFamily::O200k), 0);
    }

    #[test]
    fn anthropic_factor_inflates_estimate() {
        let text = "the quick brown fox jumps over the lazy dog";
        let base = estimate(text, EncodingFamily::O200k);
        let anthropic = estimate(text, EncodingFamily::Anthropic);
        assert!(anthropic > base);
    }

    #[test]
    fn encoding_family_inferred_from_model_id() {
        assert_eq!(
            EncodingFamily::for_model("claude-3-5-sonnet-20241022"),
            EncodingFamily::Anthropic
        );
        assert_eq!(
            EncodingFamily::for_model("gpt-4o-mini"),
            EncodingFamily::O200k
        );
        assert_eq!(
            EncodingFamily::for_model("gemini-1.5-pro"),
            EncodingFamily::SentencePiece
        );
    }

    #[test]
    fn message_overhead_and_priming_are_additive() {
        let texts = ["hello", "world"];
        let total = estimate_messages(&texts, EncodingFamily::O200k);
        let content: u64 = texts.iter().map(|t| estimate(t, EncodingFamily::O200k)).sum();
        assert_eq!(
            total,
            content + MESSAGE_OVERHEAD_TOKENS * 2 + ASSISTANT_PRIMING_TOKENS
        );
    }
}
