//! Result cache with TTL namespaces. The teacher's `DocCache` in
//! `storage.rs` evicted by byte budget; this cache is organized by
//! namespace/TTL instead (spec.md §4.8), since what needs invalidating is
//! "everything for this dataset" rather than "the coldest N bytes." TTLs
//! and the size budget come from `CacheConfig`, not hardcoded constants.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    DatasetMeta,
    SearchResult,
    VectorRecord,
    Embedding,
}

impl Namespace {
    fn prefix(&self) -> &'static str {
        match self {
            Namespace::DatasetMeta => "meta",
            Namespace::SearchResult => "search",
            Namespace::VectorRecord => "vector",
            Namespace::Embedding => "embedding",
        }
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
    dataset_id: String,
}

/// Assumed average entry size, used to turn `max_cache_size_mb` into an
/// entry-count eviction threshold without tracking exact JSON byte sizes.
const APPROX_ENTRY_BYTES: u64 = 2048;

/// Process-wide cache keyed by `(namespace, key)`. Dataset-scoped
/// invalidation walks all namespaces for a given dataset id, which is why
/// every entry records its owning dataset even when the namespace is
/// not `SearchResult`.
pub struct Cache {
    entries: DashMap<(Namespace, String), Mutex<Entry>>,
    dataset_ttl: Duration,
    search_ttl: Duration,
    metadata_ttl: Duration,
    embedding_ttl: Duration,
    max_entries: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// Built from `CacheConfig::from_env`'s fallback values; tests and
    /// anything that doesn't care about specific TTLs can use this.
    pub fn new() -> Self {
        Self::with_config(&CacheConfig {
            default_ttl_secs: 3600,
            search_ttl_secs: 300,
            metadata_ttl_secs: 1800,
            dataset_ttl_secs: 900,
            embedding_ttl_secs: 3600,
            max_cache_size_mb: 512,
        })
    }

    pub fn with_config(cfg: &CacheConfig) -> Self {
        let max_entries = ((cfg.max_cache_size_mb.max(1) * 1024 * 1024) / APPROX_ENTRY_BYTES).max(1) as usize;
        Self {
            entries: DashMap::new(),
            dataset_ttl: Duration::from_secs(cfg.dataset_ttl_secs),
            search_ttl: Duration::from_secs(cfg.search_ttl_secs),
            metadata_ttl: Duration::from_secs(cfg.metadata_ttl_secs),
            embedding_ttl: Duration::from_secs(cfg.embedding_ttl_secs),
            max_entries,
        }
    }

    fn ttl_for(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::DatasetMeta => self.dataset_ttl,
            Namespace::SearchResult => self.search_ttl,
            Namespace::VectorRecord => self.metadata_ttl,
            Namespace::Embedding => self.embedding_ttl,
        }
    }

    pub fn get(&self, namespace: Namespace, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(&(namespace, key.to_string()))?;
        let guard = entry.lock().expect("cache mutex poisoned");
        if Instant::now() >= guard.expires_at {
            drop(guard);
            drop(entry);
            self.entries.remove(&(namespace, key.to_string()));
            return None;
        }
        Some(guard.value.clone())
    }

    pub fn put(&self, namespace: Namespace, key: &str, dataset_id: &str, value: serde_json::Value) {
        if self.entries.len() >= self.max_entries {
            self.evict_one();
        }
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl_for(namespace),
            dataset_id: dataset_id.to_string(),
        };
        self.entries.insert((namespace, key.to_string()), Mutex::new(entry));
    }

    /// Drops the entry closest to expiring. Crude compared to a real LRU,
    /// but the cache is a speed-up, not a correctness boundary, so evicting
    /// something close to stale anyway is good enough.
    fn evict_one(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().lock().expect("cache mutex poisoned").expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }

    /// Drops every cached entry (in any namespace) belonging to a dataset.
    /// Called after any write against that dataset (ingest, delete,
    /// backup restore, index rebuild) per spec.md §4.8's invalidation rule.
    pub fn invalidate_dataset(&self, dataset_id: &str) {
        self.entries.retain(|_, entry| {
            let guard = entry.lock().expect("cache mutex poisoned");
            guard.dataset_id != dataset_id
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deterministic search-result cache key: `(dataset, sha256(query), sha256(options))`.
pub fn search_cache_key(dataset_id: &str, query: &[f32], options_json: &str) -> String {
    let query_hash = hash_floats(query);
    let options_hash = hash_bytes(options_json.as_bytes());
    format!("{}:{}:{}:{}", Namespace::SearchResult.prefix(), dataset_id, query_hash, options_hash)
}

fn hash_floats(values: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = Cache::new();
        cache.put(Namespace::DatasetMeta, "ds1", "ds1", serde_json::json!({"name": "x"}));
        assert_eq!(cache.get(Namespace::DatasetMeta, "ds1"), Some(serde_json::json!({"name": "x"})));
    }

    #[test]
    fn invalidate_dataset_clears_all_namespaces_for_that_dataset() {
        let cache = Cache::new();
        cache.put(Namespace::DatasetMeta, "ds1", "ds1", serde_json::json!(1));
        cache.put(Namespace::SearchResult, "search-key", "ds1", serde_json::json!(2));
        cache.put(Namespace::DatasetMeta, "ds2", "ds2", serde_json::json!(3));
        cache.invalidate_dataset("ds1");
        assert_eq!(cache.get(Namespace::DatasetMeta, "ds1"), None);
        assert_eq!(cache.get(Namespace::SearchResult, "search-key"), None);
        assert_eq!(cache.get(Namespace::DatasetMeta, "ds2"), Some(serde_json::json!(3)));
    }

    #[test]
    fn search_cache_key_is_deterministic_and_distinguishes_queries() {
        let a = search_cache_key("ds1", &[1.0, 2.0], "{}");
        let b = search_cache_key("ds1", &[1.0, 2.0], "{}");
        let c = search_cache_key("ds1", &[1.0, 3.0], "{}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn put_evicts_when_over_capacity() {
        let cache = Cache::with_config(&CacheConfig {
            default_ttl_secs: 60,
            search_ttl_secs: 60,
            metadata_ttl_secs: 60,
            dataset_ttl_secs: 60,
            embedding_ttl_secs: 60,
            max_cache_size_mb: 1, // 1MiB / 2KiB-per-entry ~= 512 entries
        });
        for i in 0..600 {
            let key = format!("key{i}");
            cache.put(Namespace::DatasetMeta, &key, &key, serde_json::json!(i));
        }
        assert!(cache.len() <= 512);
    }
}
