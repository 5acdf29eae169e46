//! Whole-response cache shared by every connection
//!
//! Bodies are keyed by the request URL with its scheme removed and are
//! evicted oldest-first once the configured capacity is reached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Bytes>,
    /// Keys in insertion order; front is the next eviction victim
    order: VecDeque<String>,
}

impl Entries {
    fn remove(&mut self, key: &str) -> Option<Bytes> {
        let value = self.map.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(value)
    }
}

/// Bounded, insertion-ordered response cache
///
/// Lookup, insert and eviction all run under a single lock, so concurrent
/// handlers never observe a half-applied eviction.
pub struct ResponseCache {
    entries: Mutex<Entries>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get the cached body for `key`
    pub fn lookup(&self, key: &str) -> Option<Bytes> {
        let found = self.entries.lock().map.get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().map.contains_key(key)
    }

    /// Store `body` under `key` unless the key is already present.
    ///
    /// Returns `true` if the body was stored. At capacity the oldest entry
    /// is evicted first.
    pub fn insert(&self, key: impl Into<String>, body: Bytes) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.map.contains_key(&key) {
            return false;
        }

        if entries.map.len() >= self.capacity {
            if let Some(oldest) = entries.order.front().cloned() {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "Evicted cache entry");
            }
        }

        entries.order.push_back(key.clone());
        entries.map.insert(key, body);
        self.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop `key` from the cache, returning its body if it was present
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
