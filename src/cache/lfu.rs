//! Least-frequently-used eviction.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug)]
struct Entry {
    value: String,
    hits: u64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// (hits, insertion sequence, key), smallest first.
    ranking: BTreeSet<(u64, u64, String)>,
    next_seq: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.ranking.remove(&(entry.hits, entry.seq, key.to_string()));
            entry.hits += 1;
            self.ranking.insert((entry.hits, entry.seq, key.to_string()));
        }
    }
}

/// Evicts exactly one least-used entry when full; ties go to the oldest.
#[derive(Debug)]
pub struct LfuCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl LfuCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.touch(key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: String, value: String) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            inner.touch(&key);
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.value = value;
            }
            return;
        }

        if inner.entries.len() >= self.capacity {
            if let Some(victim) = inner.ranking.pop_first() {
                inner.entries.remove(&victim.2);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ranking.insert((1, seq, key.clone()));
        inner.entries.insert(
            key,
            Entry {
                value,
                hits: 1,
                seq,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.ranking.remove(&(entry.hits, entry.seq, key.to_string()));
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.ranking.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
