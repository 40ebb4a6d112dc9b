//! Delta encoder (spec.md §4.7): cross-turn deduplication of a multi-turn
//! conversation's repeated paragraphs — either against the system prompt
//! (near-duplicate becomes a back-reference) or against an earlier turn
//! (near-duplicate is dropped outright), matched by normalized Jaccard
//! word-set similarity rather than exact equality.

use std::collections::HashSet;

fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn shingle_set(p: &str) -> HashSet<String> {
    p.split_whitespace().map(str::to_string).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Similarity above which a paragraph is treated as a near-duplicate,
/// whether the comparison is against the system prompt, a prior turn, or a
/// block-quoted excerpt (spec.md §4.7).
const DUPLICATE_THRESHOLD: f64 = 0.95;

/// Paragraphs shorter than this are never candidates for dropping or
/// back-referencing (spec.md §4.7 "paragraphs of ≥ 50 characters").
const MIN_PARAGRAPH_CHARS: usize = 50;

/// Minimum net token savings required for the encoding to be applied at
/// all (spec.md §4.7 "Apply only when net savings ≥ minSavingsTokens").
const MIN_SAVINGS_TOKENS: u64 = 5;

#[derive(Debug, Clone)]
pub enum ParagraphAction {
    Kept,
    /// Replaced with a short back-reference to a near-duplicate system
    /// prompt paragraph.
    SystemReference { similarity: f64 },
    /// Dropped entirely: a near-duplicate of an earlier turn's paragraph.
    DroppedAsRepeat,
    /// A block-quote whose unquoted text matches prior content, replaced
    /// with a reference to the earlier response.
    BlockQuoteReference { similarity: f64 },
}

#[derive(Debug, Clone)]
pub struct DeltaResult {
    pub text: String,
    pub actions: Vec<ParagraphAction>,
    pub original_tokens_estimate: u64,
    pub encoded_tokens_estimate: u64,
    pub applied: bool,
}

/// Tracks paragraph fingerprints seen in earlier turns of the same
/// conversation, so later turns can dedup against them. One instance per
/// conversation; cheap value type, not shared state.
#[derive(Debug, Clone, Default)]
pub struct DeltaHistory {
    seen_paragraph_shingles: Vec<HashSet<String>>,
}

impl DeltaHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, text: &str) {
        for p in paragraphs(text) {
            self.seen_paragraph_shingles.push(shingle_set(p));
        }
    }

    /// Best Jaccard similarity between `shingles` and any fingerprint seen
    /// in a prior turn.
    fn best_match(&self, shingles: &HashSet<String>) -> f64 {
        self.seen_paragraph_shingles
            .iter()
            .map(|seen| jaccard(shingles, seen))
            .fold(0.0_f64, f64::max)
    }
}

/// Encode `turn_text` against `system_prompt` and the running `history`,
/// dropping near-duplicate paragraphs, back-referencing near-duplicate
/// system content, and replacing block-quotes that match prior content.
/// Only applies if net token savings meet the minimum threshold;
/// otherwise returns the original text unchanged.
pub fn encode(
    turn_text: &str,
    system_prompt: Option<&str>,
    history: &mut DeltaHistory,
    estimate: impl Fn(&str) -> u64,
) -> DeltaResult {
    let original_tokens = estimate(turn_text);
    let system_paragraphs: Vec<HashSet<String>> = system_prompt
        .map(paragraphs)
        .unwrap_or_default()
        .iter()
        .map(|p| shingle_set(p))
        .collect();

    let mut actions = Vec::new();
    let mut kept_paragraphs = Vec::new();

    for paragraph in paragraphs(turn_text) {
        // Block-quoted content: if the unquoted text matches prior content
        // (system or an earlier turn), it's replaced with a reference
        // rather than kept verbatim or dropped.
        if paragraph.lines().all(|l| l.trim_start().starts_with('>')) {
            let unquoted = paragraph
                .lines()
                .map(|l| l.trim_start().trim_start_matches('>').trim_start())
                .collect::<Vec<_>>()
                .join("\n");
            let shingles = shingle_set(&unquoted);
            let best = history.best_match(&shingles).max(
                system_paragraphs
                    .iter()
                    .map(|sp| jaccard(&shingles, sp))
                    .fold(0.0_f64, f64::max),
            );
            if best >= DUPLICATE_THRESHOLD {
                kept_paragraphs.push("[Referring to previous response]".to_string());
                actions.push(ParagraphAction::BlockQuoteReference { similarity: best });
            } else {
                kept_paragraphs.push(paragraph.to_string());
                actions.push(ParagraphAction::Kept);
            }
            continue;
        }

        if paragraph.chars().count() < MIN_PARAGRAPH_CHARS {
            kept_paragraphs.push(paragraph.to_string());
            actions.push(ParagraphAction::Kept);
            continue;
        }

        let shingles = shingle_set(paragraph);

        let best_prior_match = history.best_match(&shingles);
        if best_prior_match >= DUPLICATE_THRESHOLD {
            actions.push(ParagraphAction::DroppedAsRepeat);
            continue;
        }

        let best_system_match = system_paragraphs
            .iter()
            .map(|sp| jaccard(&shingles, sp))
            .fold(0.0_f64, f64::max);

        if best_system_match >= DUPLICATE_THRESHOLD {
            kept_paragraphs.push("[See system instructions above]".to_string());
            actions.push(ParagraphAction::SystemReference {
                similarity: best_system_match,
            });
            continue;
        }

        kept_paragraphs.push(paragraph.to_string());
        actions.push(ParagraphAction::Kept);
    }

    let encoded_text = kept_paragraphs.join("\n\n");
    let encoded_tokens = estimate(&encoded_text);

    history.record(turn_text);

    let savings = original_tokens.saturating_sub(encoded_tokens);
    if savings >= MIN_SAVINGS_TOKENS {
        DeltaResult {
            text: encoded_text,
            actions,
            original_tokens_estimate: original_tokens,
            encoded_tokens_estimate: encoded_tokens,
            applied: true,
        }
    } else {
        DeltaResult {
            text: turn_text.to_string(),
            actions: vec![ParagraphAction::Kept; paragraphs(turn_text).len()],
            original_tokens_estimate: original_tokens,
            encoded_tokens_estimate: original_tokens,
            applied: false,
        }
    }
}

fn rough_tokens(text: &str) -> u64 {
    crate::estimator::estimate(text, crate::estimator::EncodingFamily::O200k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_near_duplicate_paragraph_from_earlier_turn() {
        let mut history = DeltaHistory::new();
        let shared = "This is the shared context paragraph that was already established earlier in the conversation.";
        let _ = encode(shared, None, &mut history, rough_tokens);
        let result = encode(
            &format!("{shared}\n\nWhat about now?"),
            None,
            &mut history,
            rough_tokens,
        );
        assert!(result.applied);
        assert!(!result.text.contains("shared context paragraph"));
        assert!(result.text.contains("What about now?"));
    }

    #[test]
    fn short_paragraphs_are_never_dropped() {
        let mut history = DeltaHistory::new();
        let short = "Yes, exactly.";
        let _ = encode(short, None, &mut history, rough_tokens);
        let result = encode(short, None, &mut history, rough_tokens);
        // Below the 50-character floor, never a dedup candidate.
        assert!(result.text.contains("Yes, exactly."));
    }

    #[test]
    fn backreferences_near_duplicate_system_paragraph() {
        let system = "You are a careful assistant that answers concisely and verifies every claim before responding.";
        let mut history = DeltaHistory::new();
        let turn = "You are a careful assistant that answers concisely and verifies every claim before responding!\n\nNew question here.";
        let result = encode(turn, Some(system), &mut history, rough_tokens);
        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, ParagraphAction::SystemReference { .. })));
    }

    #[test]
    fn block_quote_matching_prior_content_is_replaced() {
        let mut history = DeltaHistory::new();
        let excerpt = "an important excerpt worth keeping around across every single turn of this conversation";
        let _ = encode(excerpt, None, &mut history, rough_tokens);
        let quote = format!("> {excerpt}");
        let result = encode(&quote, None, &mut history, rough_tokens);
        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, ParagraphAction::BlockQuoteReference { .. })));
        assert!(result.text.contains("[Referring to previous response]"));
    }

    #[test]
    fn block_quote_with_no_prior_match_is_kept_verbatim() {
        let mut history = DeltaHistory::new();
        let quote = "> a brand new excerpt that has never appeared before in this conversation";
        let result = encode(quote, None, &mut history, rough_tokens);
        assert!(result.text.contains("a brand new excerpt"));
    }

    #[test]
    fn no_savings_means_not_applied() {
        let mut history = DeltaHistory::new();
        let result = encode("Brand new unique content here.", None, &mut history, rough_tokens);
        assert!(!result.applied);
        assert_eq!(result.text, "Brand new unique content here.");
    }
}
