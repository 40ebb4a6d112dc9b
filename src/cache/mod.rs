//! Semantic cache (spec.md §4.2): a model-scoped `(modelID, normalizedPrompt)
//! -> CacheEntry` store with both exact and fuzzy lookup, grounded on the
//! exact/TTL/stats shape of `PromptCache` but extended with the fuzzy
//! matching spec.md requires.

pub mod similarity;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::persistence::{CacheRow, Persistence};
use similarity::{bigram_dice, normalize, MinHashSignature};

/// Cache key: `sha256(modelID ++ ":" ++ normalizedPrompt)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn generate(model_id: &str, normalized_prompt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(b":");
        hasher.update(normalized_prompt.as_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

/// A stored response and the accounting needed to serve, evict, and expire it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub model_id: String,
    pub normalized_prompt: String,
    pub original_prompt: String,
    pub response_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

/// Which matching strategy produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitKind {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub kind: HitKind,
    pub similarity: f64,
}

/// Which similarity scorer the fuzzy path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityStrategy {
    /// Character-bigram Dice coefficient. O(n) per comparison, no index.
    Bigram,
    /// MinHash signatures with LSH banding for candidate generation.
    MinHash,
}

/// Semantic cache configuration (spec.md §4.2, §6 `cache.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_seconds: i64,
    pub fuzzy_enabled: bool,
    pub similarity_threshold: f64,
    pub strategy: SimilarityStrategy,
    /// Persist entries to the configured [`crate::persistence::Persistence`]
    /// backend so the cache survives process restarts (spec.md §6
    /// `cache.persist`). Off by default — most callers run an in-memory
    /// cache scoped to one process.
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl_seconds: 3600,
            fuzzy_enabled: true,
            similarity_threshold: 0.85,
            strategy: SimilarityStrategy::Bigram,
            persist: false,
        }
    }
}

/// Lookup/hit/token-saved counters (spec.md §4.2 stats surface).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub exact_hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
    pub saved_tokens: u64,
    pub entry_count: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.exact_hits + self.fuzzy_hits
    }

    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits() as f64 / self.lookups as f64
        }
    }
}

fn entry_to_row(entry: &CacheEntry) -> CacheRow {
    CacheRow {
        cache_key: entry.key.0.clone(),
        model_id: entry.model_id.clone(),
        normalized_prompt: entry.normalized_prompt.clone(),
        original_prompt: entry.original_prompt.clone(),
        response_text: entry.response_text.clone(),
        input_tokens: entry.input_tokens,
        output_tokens: entry.output_tokens,
        created_at: entry.created_at,
        last_accessed: entry.last_accessed,
        access_count: entry.access_count,
    }
}

struct FuzzyIndexEntry {
    key: CacheKey,
    signature: MinHashSignature,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order per model, used for LRU-ish FIFO eviction once
    /// `max_entries` is exceeded (oldest `last_accessed` loses).
    by_model: HashMap<String, Vec<CacheKey>>,
    fuzzy_index: HashMap<String, Vec<FuzzyIndexEntry>>,
    stats: CacheStats,
}

/// The semantic cache itself. Cheap to clone (wraps an `Arc`); every method
/// is async to match the crate's `tokio::sync::RwLock` concurrency model.
#[derive(Clone)]
pub struct SemanticCache {
    state: Arc<RwLock<CacheState>>,
    config: CacheConfig,
    persistence: Option<Persistence>,
    /// Set when a persistence write/delete fails; cleared (and reported)
    /// by [`SemanticCache::take_storage_error`] (spec.md §4.2: "a lookup
    /// failure ... must degrade to miss and emit a `storage:error` event,
    /// never propagate").
    storage_error: Arc<AtomicBool>,
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState {
                entries: HashMap::new(),
                by_model: HashMap::new(),
                fuzzy_index: HashMap::new(),
                stats: CacheStats::default(),
            })),
            config,
            persistence: None,
            storage_error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a cache backed by `persistence` when `config.persist` is set.
    /// Existing rows are loaded eagerly so a restarted process resumes
    /// with a warm cache.
    pub fn with_persistence(config: CacheConfig, persistence: Persistence) -> Self {
        let mut cache = Self::new(config);
        if !cache.config.persist {
            return cache;
        }

        let mut state = CacheState {
            entries: HashMap::new(),
            by_model: HashMap::new(),
            fuzzy_index: HashMap::new(),
            stats: CacheStats::default(),
        };
        match persistence.all_cache_rows() {
            Ok(rows) => {
                for row in rows {
                    let key = CacheKey(row.cache_key.clone());
                    let entry = CacheEntry {
                        key: key.clone(),
                        model_id: row.model_id.clone(),
                        normalized_prompt: row.normalized_prompt.clone(),
                        original_prompt: row.original_prompt,
                        response_text: row.response_text,
                        input_tokens: row.input_tokens,
                        output_tokens: row.output_tokens,
                        created_at: row.created_at,
                        last_accessed: row.last_accessed,
                        access_count: row.access_count,
                    };
                    if cache.config.strategy == SimilarityStrategy::MinHash {
                        state
                            .fuzzy_index
                            .entry(row.model_id.clone())
                            .or_default()
                            .push(FuzzyIndexEntry {
                                key: key.clone(),
                                signature: MinHashSignature::compute(&row.normalized_prompt),
                            });
                    }
                    state.by_model.entry(row.model_id).or_default().push(key.clone());
                    state.entries.insert(key, entry);
                }
                state.stats.entry_count = state.entries.len() as u64;
            }
            Err(_) => cache.storage_error.store(true, Ordering::SeqCst),
        }

        cache.state = Arc::new(RwLock::new(state));
        cache.persistence = Some(persistence);
        cache
    }

    /// Returns and clears the sticky persistence-failure flag. The pipeline
    /// checks this after lookup/store and emits `storage:error` at most
    /// once per occurrence, per spec.md §4.2.
    pub fn take_storage_error(&self) -> bool {
        self.storage_error.swap(false, Ordering::SeqCst)
    }

    /// Dynamic threshold: very short prompts get a stricter bar, since a
    /// single differing word moves similarity much further than it would
    /// in a long prompt (spec.md §4.2).
    fn effective_threshold(&self, prompt: &str) -> f64 {
        if prompt.chars().count() < 10 {
            (self.config.similarity_threshold + 0.05).min(1.0)
        } else {
            self.config.similarity_threshold
        }
    }

    /// Look up a prompt for a model: exact match first, then (if enabled)
    /// fuzzy match above the effective threshold. Lazily evicts the entry
    /// in hand if it has expired rather than returning a stale hit.
    pub async fn lookup(&self, model_id: &str, prompt: &str) -> Option<CacheHit> {
        let normalized = normalize(prompt);
        let ttl = Duration::seconds(self.config.ttl_seconds);

        // Persistence side effects are deferred until after the write
        // guard drops, per spec.md §5: never hold a lock across an
        // external call.
        let mut deleted_key: Option<String> = None;
        let mut touched_entry: Option<CacheEntry> = None;

        let result = {
            let mut state = self.state.write().await;
            state.stats.lookups += 1;

            let exact_key = CacheKey::generate(model_id, &normalized);
            if let Some(entry) = state.entries.get(&exact_key).cloned() {
                if entry.is_expired(ttl) {
                    Self::remove_entry(&mut state, &exact_key);
                    deleted_key = Some(exact_key.0.clone());
                    None
                } else {
                    Self::touch(&mut state, &exact_key);
                    state.stats.exact_hits += 1;
                    state.stats.saved_tokens += entry.input_tokens + entry.output_tokens;
                    touched_entry = state.entries.get(&exact_key).cloned();
                    Some(CacheHit { entry, kind: HitKind::Exact, similarity: 1.0 })
                }
            } else {
                None
            }
        };

        let result = if result.is_some() {
            result
        } else if !self.config.fuzzy_enabled {
            let mut state = self.state.write().await;
            state.stats.misses += 1;
            None
        } else {
            let threshold = self.effective_threshold(prompt);
            let mut state = self.state.write().await;
            let candidate_keys: Vec<CacheKey> = state.by_model.get(model_id).cloned().unwrap_or_default();

            let mut best: Option<(CacheKey, f64)> = None;
            match self.config.strategy {
                SimilarityStrategy::Bigram => {
                    for key in &candidate_keys {
                        let Some(entry) = state.entries.get(key) else { continue };
                        if entry.is_expired(ttl) {
                            continue;
                        }
                        let score = bigram_dice(&normalized, &entry.normalized_prompt);
                        if score >= threshold && best.as_ref().map_or(true, |(_, b)| score > *b) {
                            best = Some((key.clone(), score));
                        }
                    }
                }
                SimilarityStrategy::MinHash => {
                    let query_sig = MinHashSignature::compute(&normalized);
                    if let Some(index) = state.fuzzy_index.get(model_id) {
                        for candidate in index {
                            let Some(entry) = state.entries.get(&candidate.key) else { continue };
                            if entry.is_expired(ttl) {
                                continue;
                            }
                            let score = query_sig.estimated_jaccard(&candidate.signature);
                            if score >= threshold && best.as_ref().map_or(true, |(_, b)| score > *b) {
                                best = Some((candidate.key.clone(), score));
                            }
                        }
                    }
                }
            }

            match best {
                Some((key, score)) => {
                    Self::touch(&mut state, &key);
                    let entry = state.entries.get(&key).cloned().unwrap();
                    state.stats.fuzzy_hits += 1;
                    state.stats.saved_tokens += entry.input_tokens + entry.output_tokens;
                    touched_entry = Some(entry.clone());
                    Some(CacheHit { entry, kind: HitKind::Fuzzy, similarity: score })
                }
                None => {
                    state.stats.misses += 1;
                    None
                }
            }
        };

        if let Some(persistence) = &self.persistence {
            if let Some(key) = deleted_key {
                if persistence.delete_cache_row(&key).is_err() {
                    self.storage_error.store(true, Ordering::SeqCst);
                }
            }
            if let Some(entry) = touched_entry {
                if persistence.upsert_cache_row(&entry_to_row(&entry)).is_err() {
                    self.storage_error.store(true, Ordering::SeqCst);
                }
            }
        }

        result
    }

    /// Store a response for future lookups, evicting the least-recently
    /// accessed entry for this model if `max_entries` would be exceeded.
    pub async fn store(
        &self,
        model_id: &str,
        prompt: &str,
        response_text: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let normalized = normalize(prompt);
        let key = CacheKey::generate(model_id, &normalized);
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            model_id: model_id.to_string(),
            normalized_prompt: normalized.clone(),
            original_prompt: prompt.to_string(),
            response_text: response_text.into(),
            input_tokens,
            output_tokens,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        };

        let evicted = {
            let mut state = self.state.write().await;

            let bucket = state.by_model.entry(model_id.to_string()).or_default();
            if !bucket.contains(&key) {
                bucket.push(key.clone());
            }

            if self.config.strategy == SimilarityStrategy::MinHash {
                let signature = MinHashSignature::compute(&normalized);
                state
                    .fuzzy_index
                    .entry(model_id.to_string())
                    .or_default()
                    .push(FuzzyIndexEntry {
                        key: key.clone(),
                        signature,
                    });
            }

            state.entries.insert(key, entry.clone());
            state.stats.entry_count = state.entries.len() as u64;

            Self::evict_over_capacity(&mut state, model_id, self.config.max_entries)
        };

        if let Some(persistence) = &self.persistence {
            if persistence.upsert_cache_row(&entry_to_row(&entry)).is_err() {
                self.storage_error.store(true, Ordering::SeqCst);
            }
            for evicted_key in evicted {
                if persistence.delete_cache_row(&evicted_key.0).is_err() {
                    self.storage_error.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn touch(state: &mut CacheState, key: &CacheKey) {
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed = Utc::now();
            entry.access_count += 1;
        }
    }

    fn remove_entry(state: &mut CacheState, key: &CacheKey) {
        if let Some(entry) = state.entries.remove(key) {
            if let Some(bucket) = state.by_model.get_mut(&entry.model_id) {
                bucket.retain(|k| k != key);
            }
            if let Some(index) = state.fuzzy_index.get_mut(&entry.model_id) {
                index.retain(|c| &c.key != key);
            }
        }
        state.stats.entry_count = state.entries.len() as u64;
    }

    fn evict_over_capacity(state: &mut CacheState, model_id: &str, max_entries: usize) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        loop {
            let bucket_len = state.by_model.get(model_id).map(Vec::len).unwrap_or(0);
            if bucket_len <= max_entries {
                break;
            }
            let oldest = state
                .by_model
                .get(model_id)
                .and_then(|bucket| {
                    bucket
                        .iter()
                        .filter_map(|k| state.entries.get(k).map(|e| (k.clone(), e.last_accessed)))
                        .min_by_key(|(_, accessed)| *accessed)
                })
                .map(|(k, _)| k);
            match oldest {
                Some(key) => {
                    Self::remove_entry(state, &key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.read().await.stats.clone()
    }

    pub async fn clear(&self) {
        {
            let mut state = self.state.write().await;
            state.entries.clear();
            state.by_model.clear();
            state.fuzzy_index.clear();
            state.stats = CacheStats::default();
        }
        if let Some(persistence) = &self.persistence {
            if persistence.clear_cache_rows().is_err() {
                self.storage_error.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persisted_cache_survives_reconstruction() {
        let store = crate::persistence::Persistence::in_memory();
        let config = CacheConfig { persist: true, ..CacheConfig::default() };
        let cache = SemanticCache::with_persistence(config.clone(), store.clone());
        cache.store("gpt-4o", "What is Rust?", "A systems language.", 10, 20).await;

        let reloaded = SemanticCache::with_persistence(config, store);
        let hit = reloaded.lookup("gpt-4o", "What is Rust?").await.unwrap();
        assert_eq!(hit.kind, HitKind::Exact);
        assert!(!reloaded.take_storage_error());
    }

    #[tokio::test]
    async fn exact_hit_after_store() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("gpt-4o", "What is Rust?", "A systems language.", 10, 20).await;
        let hit = cache.lookup("gpt-4o", "What is Rust?").await.unwrap();
        assert_eq!(hit.kind, HitKind::Exact);
        assert_eq!(hit.similarity, 1.0);
    }

    #[tokio::test]
    async fn cache_is_scoped_per_model() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("gpt-4o", "hello", "hi there", 5, 5).await;
        assert!(cache.lookup("claude-sonnet-4", "hello").await.is_none());
    }

    #[tokio::test]
    async fn fuzzy_hit_above_threshold() {
        let mut config = CacheConfig::default();
        config.similarity_threshold = 0.7;
        let cache = SemanticCache::new(config);
        cache
            .store("gpt-4o", "What is the capital of France?", "Paris.", 8, 4)
            .await;
        let hit = cache
            .lookup("gpt-4o", "What is the capital city of France?")
            .await
            .unwrap();
        assert_eq!(hit.kind, HitKind::Fuzzy);
        assert!(hit.similarity >= 0.7);
    }

    #[tokio::test]
    async fn miss_when_fuzzy_disabled_and_no_exact_match() {
        let mut config = CacheConfig::default();
        config.fuzzy_enabled = false;
        let cache = SemanticCache::new(config);
        cache.store("gpt-4o", "alpha request", "alpha response", 1, 1).await;
        assert!(cache.lookup("gpt-4o", "alpha requests").await.is_none());
    }

    #[tokio::test]
    async fn eviction_respects_max_entries() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = SemanticCache::new(config);
        cache.store("gpt-4o", "one", "r1", 1, 1).await;
        cache.store("gpt-4o", "two", "r2", 1, 1).await;
        cache.store("gpt-4o", "three", "r3", 1, 1).await;
        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 2);
        assert!(cache.lookup("gpt-4o", "one").await.is_none());
    }

    #[tokio::test]
    async fn minhash_strategy_finds_near_duplicates() {
        let config = CacheConfig {
            strategy: SimilarityStrategy::MinHash,
            similarity_threshold: 0.5,
            ..CacheConfig::default()
        };
        let cache = SemanticCache::new(config);
        cache
            .store(
                "gpt-4o",
                "summarize the quarterly earnings report for investors",
                "summary text",
                20,
                10,
            )
            .await;
        let hit = cache
            .lookup(
                "gpt-4o",
                "summarize the quarterly earnings report for our investors",
            )
            .await;
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("gpt-4o", "hi", "hello", 1, 1).await;
        cache.clear().await;
        assert_eq!(cache.stats().await.entry_count, 0);
        assert!(cache.lookup("gpt-4o", "hi").await.is_none());
    }
}
