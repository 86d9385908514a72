//! Bounded key-value cache in front of disk storage.
//!
//! The eviction policy is chosen at node start from its name. Every policy is
//! internally synchronized, so the cache can be shared without an outer lock.

mod concurrent;
mod fifo;
mod lfu;
mod lru;

pub use self::concurrent::ConcurrentCache;
pub use self::fifo::FifoCache;
pub use self::lfu::LfuCache;
pub use self::lru::LruCache;

use crate::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Eviction policy names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStrategy {
    Fifo,
    Lru,
    Lfu,
    Concurrent,
}

impl FromStr for CacheStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(CacheStrategy::Fifo),
            "LRU" => Ok(CacheStrategy::Lru),
            "LFU" => Ok(CacheStrategy::Lfu),
            "CONCURRENT" => Ok(CacheStrategy::Concurrent),
            other => Err(Error::Config(format!("unknown cache strategy: {}", other))),
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheStrategy::Fifo => "FIFO",
            CacheStrategy::Lru => "LRU",
            CacheStrategy::Lfu => "LFU",
            CacheStrategy::Concurrent => "CONCURRENT",
        };
        f.write_str(s)
    }
}

/// One of the eviction policies.
#[derive(Debug)]
pub enum CachePolicy {
    Fifo(FifoCache),
    Lru(LruCache),
    Lfu(LfuCache),
    Concurrent(ConcurrentCache),
    /// Capacity of zero or less: nothing is ever cached.
    Disabled,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// The cache a node's KV manager reads through.
#[derive(Debug)]
pub struct KvCache {
    policy: CachePolicy,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KvCache {
    /// Build a cache for a policy and size. Non-positive sizes disable caching.
    pub fn new(strategy: CacheStrategy, max_size: i64) -> Self {
        let policy = match NonZeroUsize::new(max_size.max(0) as usize) {
            None => CachePolicy::Disabled,
            Some(capacity) => match strategy {
                CacheStrategy::Fifo => CachePolicy::Fifo(FifoCache::new(capacity.get())),
                CacheStrategy::Lru => CachePolicy::Lru(LruCache::new(capacity)),
                CacheStrategy::Lfu => CachePolicy::Lfu(LfuCache::new(capacity.get())),
                CacheStrategy::Concurrent => {
                    CachePolicy::Concurrent(ConcurrentCache::new(capacity.get() as u64))
                }
            },
        };
        Self {
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Get a value, counting the hit or miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let result = match &self.policy {
            CachePolicy::Fifo(c) => c.get(key),
            CachePolicy::Lru(c) => c.get(key),
            CachePolicy::Lfu(c) => c.get(key),
            CachePolicy::Concurrent(c) => c.get(key),
            CachePolicy::Disabled => None,
        };
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Insert or replace a value.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        match &self.policy {
            CachePolicy::Fifo(c) => c.put(key, value),
            CachePolicy::Lru(c) => c.put(key, value),
            CachePolicy::Lfu(c) => c.put(key, value),
            CachePolicy::Concurrent(c) => c.put(key, value),
            CachePolicy::Disabled => {}
        }
    }

    /// Remove a key.
    pub fn remove(&self, key: &str) {
        match &self.policy {
            CachePolicy::Fifo(c) => c.remove(key),
            CachePolicy::Lru(c) => c.remove(key),
            CachePolicy::Lfu(c) => c.remove(key),
            CachePolicy::Concurrent(c) => c.remove(key),
            CachePolicy::Disabled => {}
        }
    }

    /// Check for a key without affecting eviction order.
    pub fn contains_key(&self, key: &str) -> bool {
        match &self.policy {
            CachePolicy::Fifo(c) => c.contains_key(key),
            CachePolicy::Lru(c) => c.contains_key(key),
            CachePolicy::Lfu(c) => c.contains_key(key),
            CachePolicy::Concurrent(c) => c.contains_key(key),
            CachePolicy::Disabled => false,
        }
    }

    /// Drop every entry.
    pub fn purge(&self) {
        match &self.policy {
            CachePolicy::Fifo(c) => c.purge(),
            CachePolicy::Lru(c) => c.purge(),
            CachePolicy::Lfu(c) => c.purge(),
            CachePolicy::Concurrent(c) => c.purge(),
            CachePolicy::Disabled => {}
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        match &self.policy {
            CachePolicy::Fifo(c) => c.len(),
            CachePolicy::Lru(c) => c.len(),
            CachePolicy::Lfu(c) => c.len(),
            CachePolicy::Concurrent(c) => c.len(),
            CachePolicy::Disabled => 0,
        }
    }

    /// Check if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
