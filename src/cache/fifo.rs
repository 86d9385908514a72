//! First-in first-out eviction.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Evicts in insertion order; reads and updates do not change the order.
#[derive(Debug)]
pub struct FifoCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FifoCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn put(&self, key: String, value: String) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.entries.get_mut(&key) {
            *slot = value;
            return;
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, value);
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
