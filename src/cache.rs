//! Forward-pass activations and the content-addressed activation cache
//!
//! [`ForwardActivations`] is the bundle of hook-point tensors from one forward
//! pass. [`ActivationCache`] keeps a few of them keyed by a digest of the
//! token sequence plus the target layer and truncation depth. Each entry also
//! memoizes per-decoder encoded features, so repeated queries against the
//! same prompt skip both the forward pass and the encode.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use candle_core::Tensor;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::decoder::DecoderId;
use crate::lru::RecencyList;

/// Hex characters of the SHA-256 digest kept in a cache key.
const DIGEST_HEX_LEN: usize = 16;

/// Hook-point tensors recorded during one forward pass
///
/// Stream-like hook points have shape `(seq_len, width)`; attention
/// internals keep their head axis.
#[derive(Debug, Clone, Default)]
pub struct ForwardActivations {
    tensors: HashMap<String, Tensor>,
}

impl ForwardActivations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hook_name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(hook_name.into(), tensor);
    }

    pub fn get(&self, hook_name: &str) -> Option<&Tensor> {
        self.tensors.get(hook_name)
    }

    /// Like [`get`][Self::get], but missing hook points are an error.
    pub fn require(&self, hook_name: &str) -> Result<&Tensor> {
        self.tensors
            .get(hook_name)
            .ok_or_else(|| anyhow::anyhow!("Hook point {hook_name} not recorded in this forward pass"))
    }

    /// Recorded hook names, sorted.
    pub fn hook_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Truncated SHA-256 of a token sequence.
pub fn token_digest(tokens: &[u32]) -> String {
    let mut hasher = Sha256::new();
    for token in tokens {
        hasher.update(token.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(DIGEST_HEX_LEN);
    for byte in digest.iter().take(DIGEST_HEX_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Key of one cached forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub digest: String,
    pub layer: usize,
    pub stop_depth: Option<usize>,
}

impl CacheKey {
    pub fn new(tokens: &[u32], layer: usize, stop_depth: Option<usize>) -> Self {
        Self {
            digest: token_digest(tokens),
            layer,
            stop_depth,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stop_depth {
            Some(stop) => write!(f, "{}_L{}_stop{stop}", self.digest, self.layer),
            None => write!(f, "{}_L{}_full", self.digest, self.layer),
        }
    }
}

struct CacheEntry {
    activations: Arc<ForwardActivations>,
    derived: HashMap<DecoderId, Tensor>,
    created: Instant,
    last_access: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn new(activations: Arc<ForwardActivations>) -> Self {
        let now = Instant::now();
        Self {
            activations,
            derived: HashMap::new(),
            created: now,
            last_access: now,
            access_count: 0,
        }
    }

    fn record_access(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }
}

/// Per-entry bookkeeping reported by [`ActivationCache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    pub key: String,
    pub access_count: u64,
    pub age_secs: f64,
    pub idle_secs: f64,
    pub derived_entries: usize,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    /// Least recently used first
    pub entries: Vec<CacheEntryStats>,
}

/// LRU cache of forward-pass results with a nested derived-feature cache.
///
/// No internal locking; mutate only while holding the concurrency gate.
pub struct ActivationCache {
    entries: HashMap<CacheKey, CacheEntry>,
    order: RecencyList<CacheKey>,
    max_entries: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ActivationCache {
    pub fn new(max_entries: usize) -> Self {
        info!("Activation cache capacity: {max_entries} entries");
        Self {
            entries: HashMap::new(),
            order: RecencyList::new(),
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Shared handle to the cached activations, bumping recency on a hit.
    pub fn get(&mut self, tokens: &[u32], layer: usize, stop_depth: Option<usize>) -> Option<Arc<ForwardActivations>> {
        let key = CacheKey::new(tokens, layer, stop_depth);
        self.lookup(&key).map(|entry| Arc::clone(&entry.activations))
    }

    fn lookup(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.record_access();
                self.order.touch(key);
                self.hits += 1;
                debug!("Activation cache hit: {key}");
                Some(entry)
            }
            None => {
                self.misses += 1;
                debug!("Activation cache miss: {key}");
                None
            }
        }
    }

    /// Store a forward pass, evicting the least recently used entry when full.
    ///
    /// Re-inserting an existing key replaces its activations and drops its
    /// derived values.
    pub fn put(
        &mut self,
        tokens: &[u32],
        layer: usize,
        stop_depth: Option<usize>,
        activations: ForwardActivations,
    ) -> Arc<ForwardActivations> {
        let key = CacheKey::new(tokens, layer, stop_depth);
        let activations = Arc::new(activations);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            if let Some(lru) = self.order.pop_lru() {
                self.entries.remove(&lru);
                self.evictions += 1;
                debug!("Activation cache evicted: {lru}");
            }
        }

        self.entries.insert(key.clone(), CacheEntry::new(Arc::clone(&activations)));
        self.order.push(key);
        activations
    }

    /// Memoized derived tensor for `decoder`. Counts as a top-level access.
    pub fn get_derived(
        &mut self,
        tokens: &[u32],
        layer: usize,
        decoder: &DecoderId,
        stop_depth: Option<usize>,
    ) -> Option<Tensor> {
        let key = CacheKey::new(tokens, layer, stop_depth);
        self.lookup(&key)?.derived.get(decoder).cloned()
    }

    /// Memoize a derived tensor inside an existing entry.
    ///
    /// Returns false (and stores nothing) if the entry is no longer cached.
    pub fn put_derived(
        &mut self,
        tokens: &[u32],
        layer: usize,
        decoder: &DecoderId,
        derived: Tensor,
        stop_depth: Option<usize>,
    ) -> bool {
        let key = CacheKey::new(tokens, layer, stop_depth);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.derived.insert(decoder.clone(), derived);
                true
            }
            None => {
                debug!("Dropping derived value for {decoder}: {key} was evicted");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&mut self) {
        let dropped = self.entries.len();
        self.entries.clear();
        self.order.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        info!("Activation cache cleared ({dropped} entries)");
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        let now = Instant::now();
        let entries = self
            .order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|e| (key, e)))
            .map(|(key, entry)| CacheEntryStats {
                key: key.to_string(),
                access_count: entry.access_count,
                age_secs: now.duration_since(entry.created).as_secs_f64(),
                idle_secs: now.duration_since(entry.last_access).as_secs_f64(),
                derived_entries: entry.derived.len(),
            })
            .collect();

        CacheStats {
            size: self.entries.len(),
            max_size: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 { self.hits as f64 / total as f64 } else { 0.0 },
            evictions: self.evictions,
            entries,
        }
    }
}
