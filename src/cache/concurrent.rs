//! Moka-backed cache for highly parallel access.

use moka::sync::Cache;

/// TinyLFU admission with approximate recency and frequency tracking.
///
/// Eviction runs in moka's maintenance tasks, so the size bound is only
/// approximate between calls to [`ConcurrentCache::len`].
#[derive(Debug, Clone)]
pub struct ConcurrentCache {
    cache: Cache<String, String>,
}

impl ConcurrentCache {
    /// Create a cache holding about `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    pub fn put(&self, key: String, value: String) {
        self.cache.insert(key, value);
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn purge(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }
}
