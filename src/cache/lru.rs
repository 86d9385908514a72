//! Least-recently-used eviction on top of the `lru` crate.

use ::lru::LruCache as Inner;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Evicts the entry that was read or written longest ago.
pub struct LruCache {
    inner: Mutex<Inner<String, String>>,
}

impl LruCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, value: String) {
        self.inner.lock().put(key, value);
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Does not count as a use.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn purge(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl std::fmt::Debug for LruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LruCache")
            .field("len", &inner.len())
            .field("cap", &inner.cap())
            .finish()
    }
}
