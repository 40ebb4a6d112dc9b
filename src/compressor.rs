//! Prompt compressor (spec.md §4.6): a lossless-intent shrink pass applied
//! to the prompt text before it reaches the model invoker. Ordered steps —
//! placeholder-extract, whitespace collapse, verbose-phrase contraction,
//! filler stripping, sentence dedup, proper-noun abbreviation, placeholder
//! restore — each skippable and each guarded by the abort-safety floor.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static CODE_BLOCK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```|`[^`\n]+`").unwrap());
static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]{2,}").unwrap());
static BLANK_LINE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Verbose phrase -> terse replacement table, applied case-insensitively.
/// Kept small and literal (no attempt at general paraphrase) since the
/// compressor's job is to shrink, not to rewrite meaning.
const VERBOSE_PHRASES: &[(&str, &str)] = &[
    ("in order to", "to"),
    ("due to the fact that", "because"),
    ("at this point in time", "now"),
    ("in the event that", "if"),
    ("for the purpose of", "for"),
    ("with regard to", "regarding"),
    ("a large number of", "many"),
    ("in spite of the fact that", "although"),
    ("is able to", "can"),
    ("it is important to note that", ""),
    ("please be aware that", ""),
];

/// Stopword-ish filler words stripped when they don't change meaning.
/// Deliberately conservative: this list only contains hedges/intensifiers,
/// never content words.
const FILLER_WORDS: &[&str] = &[
    "basically", "actually", "literally", "just", "really", "very", "quite",
    "simply", "essentially", "kind of", "sort of",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressorConfig {
    pub min_savings_tokens: u64,
    pub strip_fillers: bool,
    pub dedup_sentences: bool,
    pub abbreviate_proper_nouns: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            min_savings_tokens: 5,
            strip_fillers: true,
            dedup_sentences: true,
            abbreviate_proper_nouns: true,
        }
    }
}

impl CompressorConfig {
    pub fn defaults() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub text: String,
    pub applied: bool,
    pub original_tokens_estimate: u64,
    pub compressed_tokens_estimate: u64,
}

struct Placeholders {
    map: HashMap<String, String>,
    counter: usize,
}

impl Placeholders {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            counter: 0,
        }
    }

    fn stash(&mut self, text: &str, matched: &str) -> String {
        let token = format!("\u{0}PH{}\u{0}", self.counter);
        self.counter += 1;
        self.map.insert(token.clone(), matched.to_string());
        text.replacen(matched, &token, 1)
    }

    fn restore(&self, mut text: String) -> String {
        for (token, original) in &self.map {
            text = text.replace(token, original);
        }
        text
    }
}

fn extract_placeholders(text: &str) -> (String, Placeholders) {
    let mut placeholders = Placeholders::new();
    let mut working = text.to_string();

    loop {
        let Some(m) = CODE_BLOCK_PATTERN.find(&working) else { break };
        let matched = m.as_str().to_string();
        working = placeholders.stash(&working, &matched);
    }
    loop {
        let Some(m) = URL_PATTERN.find(&working) else { break };
        let matched = m.as_str().to_string();
        working = placeholders.stash(&working, &matched);
    }

    (working, placeholders)
}

fn collapse_whitespace(text: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(text, " ");
    BLANK_LINE_RUN.replace_all(&collapsed, "\n\n").trim().to_string()
}

fn contract_verbose_phrases(text: &str) -> String {
    let mut out = text.to_string();
    for (verbose, terse) in VERBOSE_PHRASES {
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(verbose))).unwrap();
        out = pattern.replace_all(&out, *terse).to_string();
    }
    out
}

/// Strip filler words from non-sentence-initial positions (spec.md §4.6
/// step 4): the first word of each sentence is exempt even if it's on the
/// filler list, since a sentence-leading filler still carries some of the
/// sentence's emphasis/register.
fn strip_fillers(text: &str) -> String {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return text.to_string();
    }
    sentences
        .into_iter()
        .map(strip_fillers_in_sentence)
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_fillers_in_sentence(sentence: &str) -> String {
    let first_word_len = sentence.find(char::is_whitespace).unwrap_or(sentence.len());
    let (first_word, rest) = sentence.split_at(first_word_len);
    let mut stripped_rest = rest.to_string();
    for filler in FILLER_WORDS {
        let pattern = Regex::new(&format!(r"(?i)\b{}\b,?\s*", regex::escape(filler))).unwrap();
        stripped_rest = pattern.replace_all(&stripped_rest, "").to_string();
    }
    format!("{first_word}{stripped_rest}")
}

/// Drop sentences that are exact duplicates (case/whitespace-insensitive)
/// of an earlier sentence in the same text, keeping the first occurrence
/// and original order.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            sentences.push(text[start..i + 1].trim());
            start = end;
            i = end;
            continue;
        }
        i += 1;
    }
    if start < bytes.len() {
        sentences.push(text[start..].trim());
    }
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

fn dedup_sentences(text: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::new();
    for sentence in split_sentences(text) {
        let key = sentence.trim().to_lowercase();
        if seen.insert(key) {
            kept.push(sentence);
        }
    }
    kept.join(" ")
}

/// Abbreviate a proper noun to its initials after its first full mention,
/// for any capitalized multi-word phrase (2+ words, each capitalized)
/// repeated three or more times.
fn abbreviate_repeated_proper_nouns(text: &str) -> String {
    let phrase_pattern = Regex::new(r"\b([A-Z][a-zA-Z]+(?:\s[A-Z][a-zA-Z]+){1,3})\b").unwrap();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for m in phrase_pattern.find_iter(text) {
        *counts.entry(m.as_str().to_string()).or_insert(0) += 1;
    }

    let mut out = text.to_string();
    for (phrase, count) in counts {
        if count < 3 {
            continue;
        }
        let initials: String = phrase
            .split_whitespace()
            .filter_map(|w| w.chars().next())
            .collect();
        if initials.len() < 2 {
            continue;
        }
        let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(&phrase))).unwrap();
        let mut first = true;
        out = pattern
            .replace_all(&out, |_: &regex::Captures| {
                if first {
                    first = false;
                    format!("{phrase} ({initials})")
                } else {
                    initials.clone()
                }
            })
            .to_string();
    }
    out
}

/// Apply the ordered compression pipeline to `text`, estimating token
/// counts with `estimate` (injected so the compressor stays tokenizer
/// agnostic). Falls back to the original text if the result would shrink
/// below the abort-safety floor, or if savings are below the configured
/// minimum.
pub fn compress(text: &str, config: &CompressorConfig, estimate: impl Fn(&str) -> u64) -> CompressionResult {
    let original_tokens = estimate(text);

    let (stashed, placeholders) = extract_placeholders(text);
    let mut working = collapse_whitespace(&stashed);
    working = contract_verbose_phrases(&working);
    if config.strip_fillers {
        working = strip_fillers(&working);
    }
    if config.dedup_sentences {
        working = dedup_sentences(&working);
    }
    if config.abbreviate_proper_nouns {
        working = abbreviate_repeated_proper_nouns(&working);
    }
    working = collapse_whitespace(&working);
    let restored = placeholders.restore(working);

    let compressed_tokens = estimate(&restored);

    let floor = if original_tokens < 50 {
        (original_tokens as f64 * 0.3).ceil() as u64
    } else {
        (original_tokens as f64 * 0.6).ceil() as u64
    };

    let savings = original_tokens.saturating_sub(compressed_tokens);
    if compressed_tokens < floor || savings < config.min_savings_tokens {
        return CompressionResult {
            text: text.to_string(),
            applied: false,
            original_tokens_estimate: original_tokens,
            compressed_tokens_estimate: original_tokens,
        };
    }

    CompressionResult {
        text: restored,
        applied: true,
        original_tokens_estimate: original_tokens,
        compressed_tokens_estimate: compressed_tokens,
    }
}

fn rough_tokens(text: &str) -> u64 {
    crate::estimator::estimate(text, crate::estimator::EncodingFamily::O200k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contracts_verbose_phrases() {
        let out = contract_verbose_phrases("I did this in order to test it.");
        assert_eq!(out, "I did this to test it.");
    }

    #[test]
    fn code_blocks_survive_compression_untouched() {
        let text = "Please review this:\n```rust\nfn in_order_to() {}\n```\nin order to merge it.";
        let result = compress(text, &CompressorConfig::defaults(), rough_tokens);
        assert!(result.text.contains("fn in_order_to() {}"));
    }

    #[test]
    fn dedups_identical_sentences() {
        let out = dedup_sentences("The sky is blue. The sky is blue. It is also big.");
        assert_eq!(out, "The sky is blue. It is also big.");
    }

    #[test]
    fn abbreviates_repeated_proper_noun_after_third_mention() {
        let text = "Apache Kafka handles streaming. Apache Kafka scales well. We rely on Apache Kafka heavily. Apache Kafka is solid.";
        let out = abbreviate_repeated_proper_nouns(text);
        assert!(out.contains("Apache Kafka (AK)"));
        assert!(out.contains(" AK "));
    }

    #[test]
    fn abort_safety_floor_rejects_over_aggressive_short_prompts() {
        let tiny = "Hi.";
        let result = compress(tiny, &CompressorConfig::defaults(), rough_tokens);
        assert!(!result.applied);
        assert_eq!(result.text, tiny);
    }

    #[test]
    fn sentence_initial_filler_is_preserved() {
        let out = strip_fillers("Just do it. Really, it works well.");
        assert!(out.starts_with("Just do it."));
        assert!(out.contains("Really,"));
    }

    #[test]
    fn non_initial_filler_is_stripped() {
        let out = strip_fillers("Let's just do it quickly.");
        assert!(!out.contains("just"));
        assert!(out.starts_with("Let's"));
    }

    #[test]
    fn urls_survive_compression_untouched() {
        let text = "See in order to understand: https://example.com/docs/in-order-to-configure";
        let result = compress(text, &CompressorConfig::defaults(), rough_tokens);
        assert!(result.text.contains("https://example.com/docs/in-order-to-configure"));
    }
}
