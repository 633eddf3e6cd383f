//! Write-once memo for symbol traversals and join trees.
//!
//! Entries are keyed by a SHA-256 signature of the inputs and never mutated
//! once stored. Concurrent compiles that race on the same key both compute,
//! and the first writer wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::error::{CubePlanError, Result};
use crate::join_graph::JoinTree;

#[derive(Debug, Clone)]
pub enum CachedValue {
    Paths(Vec<String>),
    JoinTree(Option<JoinTree>),
}

#[derive(Debug)]
pub struct CompilerCache {
    entries: DashMap<String, Arc<CachedValue>>,
    enabled: bool,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for CompilerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerCache {
    pub fn new() -> Self {
        Self::with_config(&CacheConfig::default())
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: config.enabled,
            max_entries: config.max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Canonical key for a list of inputs.
    pub fn signature(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<Arc<CachedValue>>
    where
        F: FnOnce() -> Result<CachedValue>,
    {
        if let Some(hit) = self.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(hit.value()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(compute()?);
        if !self.enabled {
            return Ok(value);
        }
        if self.entries.len() >= self.max_entries {
            tracing::debug!(max_entries = self.max_entries, "compiler cache full, not storing");
            return Ok(value);
        }
        let stored = self.entries.entry(key.to_string()).or_insert(value);
        Ok(Arc::clone(stored.value()))
    }

    pub fn paths<F>(&self, key: &str, compute: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        match self.get_or_compute(key, || compute().map(CachedValue::Paths))?.as_ref() {
            CachedValue::Paths(paths) => Ok(paths.clone()),
            other => Err(CubePlanError::Internal(format!(
                "cache entry {key} holds {other:?}, expected paths"
            ))),
        }
    }

    pub fn join_tree<F>(&self, key: &str, compute: F) -> Result<Option<JoinTree>>
    where
        F: FnOnce() -> Result<Option<JoinTree>>,
    {
        match self.get_or_compute(key, || compute().map(CachedValue::JoinTree))?.as_ref() {
            CachedValue::JoinTree(tree) => Ok(tree.clone()),
            other => Err(CubePlanError::Internal(format!(
                "cache entry {key} holds {other:?}, expected a join tree"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signature_is_stable_and_separates_parts() {
        let a = CompilerCache::signature(&["postgres", "Orders.count"]);
        assert_eq!(a, CompilerCache::signature(&["postgres", "Orders.count"]));
        assert_ne!(a, CompilerCache::signature(&["postgresOrders", ".count"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn first_write_wins() {
        let cache = CompilerCache::new();
        let first = cache
            .paths("k", || Ok(vec!["Orders".to_string()]))
            .unwrap();
        let second = cache.paths("k", || Ok(vec!["Users".to_string()])).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = CompilerCache::new();
        assert!(cache
            .paths("k", || Err(CubePlanError::Schema("boom".into())))
            .is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_still_computes() {
        let cache = CompilerCache::with_config(&CacheConfig {
            enabled: true,
            max_entries: 1,
        });
        cache.paths("a", || Ok(vec![])).unwrap();
        let value = cache.paths("b", || Ok(vec!["x".into()])).unwrap();
        assert_eq!(value, vec!["x".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_agree() {
        let cache = Arc::new(CompilerCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache
                        .paths("shared", || Ok(vec!["Orders".to_string()]))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec!["Orders".to_string()]);
        }
        assert_eq!(cache.len(), 1);
    }
}
