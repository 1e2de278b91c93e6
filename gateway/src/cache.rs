use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Process-wide TTL cache over a concurrent map.
///
/// Used for negative caches (e.g. revoked OAuth clients), the session
/// fallback cache, and stored upstream responses. Expiry is lazy: stale
/// entries are dropped on read, and [`purge_expired`](Self::purge_expired)
/// can be called from a background tick to bound memory under churn.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
}

struct Entry<V> {
    value: V,
    /// `None` means the entry never expires.
    expires: Option<Instant>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fetch a live entry. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires {
                Some(at) if Instant::now() >= at => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert with an optional TTL. `None` stores the entry permanently.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry whose deadline has passed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| match e.expires {
            Some(at) => now < at,
            None => true,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
