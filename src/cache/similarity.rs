//! Similarity scoring for the semantic cache's fuzzy lookup mode
//! (spec.md §4.2, GLOSSARY "Dice coefficient" / "MinHash / LSH banding").

use std::collections::HashSet;

/// Lower-case, whitespace-collapse, punctuation-strip a prompt so that
/// cosmetic differences don't defeat cache hits or dedup checks. Used for
/// both the cache key's prompt fingerprint (GLOSSARY) and similarity input.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
                last_was_space = true;
            }
        }
        // all other punctuation is simply dropped
    }
    out.trim_end().to_string()
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 2 {
        return chars
            .first()
            .map(|&c| HashSet::from([(c, '\0')]))
            .unwrap_or_default();
    }
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Bigram Dice coefficient: `2*|A∩B| / (|A|+|B|)`, over normalized text.
pub fn bigram_dice(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    let sa = bigrams(&na);
    let sb = bigrams(&nb);
    if sa.is_empty() || sb.is_empty() {
        return if na == nb { 1.0 } else { 0.0 };
    }
    let intersection = sa.intersection(&sb).count() as f64;
    2.0 * intersection / (sa.len() as f64 + sb.len() as f64)
}

/// Word shingles of a fixed width, used as MinHash's input sets.
fn shingles(text: &str, width: usize) -> HashSet<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < width {
        return HashSet::from([words.join(" ")]);
    }
    words
        .windows(width)
        .map(|w| w.join(" "))
        .collect()
}

const MINHASH_COUNT: usize = 128;
const LSH_BANDS: usize = 16;
const LSH_ROWS: usize = 8; // 16 * 8 = 128

/// Deterministic per-slot multipliers for the MinHash permutation family.
/// Generated with a fixed linear-congruential formula rather than pulled
/// from an RNG crate, since the only requirement is that the 128 hash
/// functions be pairwise distinct and stable across runs.
fn minhash_seeds() -> [u64; MINHASH_COUNT] {
    let mut seeds = [0u64; MINHASH_COUNT];
    let mut x: u64 = 0x9E3779B97F4A7C15;
    for seed in seeds.iter_mut() {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *seed = x | 1; // keep odd so the multiplier family stays well-distributed
    }
    seeds
}

fn hash_shingle(shingle: &str, seed: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    shingle.hash(&mut hasher);
    hasher.finish()
}

/// A MinHash signature: 128 per-permutation minimum hash values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinHashSignature(pub Vec<u64>);

impl MinHashSignature {
    /// Compute the signature of a prompt's 3-word shingle set.
    pub fn compute(text: &str) -> Self {
        let normalized = normalize(text);
        let shingle_set = shingles(&normalized, 3);
        let seeds = minhash_seeds();
        let mut sig = vec![u64::MAX; MINHASH_COUNT];
        for shingle in &shingle_set {
            for (i, &seed) in seeds.iter().enumerate() {
                let h = hash_shingle(shingle, seed);
                if h < sig[i] {
                    sig[i] = h;
                }
            }
        }
        MinHashSignature(sig)
    }

    /// Unbiased Jaccard estimator: the fraction of matching permutation slots.
    pub fn estimated_jaccard(&self, other: &MinHashSignature) -> f64 {
        let matches = self
            .0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a == b)
            .count();
        matches as f64 / MINHASH_COUNT as f64
    }

    /// LSH band keys: one bucket id per band, used to find candidates in
    /// expected O(bands) time instead of scanning every stored signature.
    pub fn band_keys(&self) -> Vec<u64> {
        self.0
            .chunks(LSH_ROWS)
            .map(|rows| {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                rows.hash(&mut hasher);
                hasher.finish()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_strips_punctuation() {
        assert_eq!(normalize("What  is,  TypeScript?!"), "what is typescript");
    }

    #[test]
    fn identical_text_has_similarity_one() {
        assert_eq!(bigram_dice("hello world", "hello world"), 1.0);
    }

    #[test]
    fn disjoint_text_has_low_similarity() {
        let score = bigram_dice("completely different topic here", "xyz qrs tuv");
        assert!(score < 0.1);
    }

    #[test]
    fn minhash_identical_text_estimates_jaccard_one() {
        let a = MinHashSignature::compute("the quick brown fox jumps over the lazy dog");
        let b = MinHashSignature::compute("the quick brown fox jumps over the lazy dog");
        assert_eq!(a.estimated_jaccard(&b), 1.0);
    }

    #[test]
    fn minhash_shares_lsh_bands_for_near_duplicates() {
        let a = MinHashSignature::compute("explain how the scheduler balances load across workers");
        let b = MinHashSignature::compute("explain how the scheduler balances load across the workers");
        let shared = a
            .band_keys()
            .iter()
            .zip(b.band_keys().iter())
            .filter(|(x, y)| x == y)
            .count();
        assert!(shared > 0);
    }
}
