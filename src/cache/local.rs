//! In-process cache tier.

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Bytes,
    expires_at: Instant,
}

/// A concurrent, size-bounded map of expiring values.
#[derive(Debug)]
pub struct LocalCache {
    entries: DashMap<String, LocalEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Fetch a live value. Expired entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Store `value` for the configured ttl.
    pub fn insert(&self, key: &str, value: Bytes) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn make_room(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        if self.entries.len() < self.max_entries {
            return;
        }
        // Still full of live entries: evict the one closest to expiry
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Entries physically present, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
