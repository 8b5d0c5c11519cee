//! Bounded memoization for ancestor closures and compiled checks
//!
//! Entries are never invalidated implicitly; owners call [`MemoCache::clear`]
//! whenever the underlying data changes.

use crate::config::CacheConfig;
use crate::error::Result;
use blake3::Hasher;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::Hash;

/// Cache key derived from a canonical serialization (BLAKE3 hash)
pub type CanonicalKey = [u8; 32];

/// Compute the canonical key of a serializable value
pub fn canonical_key<T: Serialize>(value: &T) -> Result<CanonicalKey> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

/// Least-recently-used memo table with batch eviction
pub struct MemoCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
    max_length: usize,
    evict_batch: usize,
}

impl<K: Hash + Eq, V: Clone> MemoCache<K, V> {
    /// Create a cache sized by `config`
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            max_length: config.max_length,
            evict_batch: config.evict_batch.max(1),
        }
    }

    /// Create a cache only if `config` enables memoization
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config))
    }

    /// Look up a value, marking it as recently used
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Store a value, evicting a batch of stale entries when over capacity
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.put(key, value);

        if self.max_length > 0 && entries.len() > self.max_length {
            for _ in 0..self.evict_batch {
                if entries.pop_lru().is_none() {
                    break;
                }
            }
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
