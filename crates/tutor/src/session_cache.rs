//! Bounded, expiring in-process cache keyed by lesson id.
//!
//! Entries expire after `ttl` without activity. When full, inserting a new
//! key evicts the least-recently-active entry. Losing an entry only costs a
//! context rebuild, so the cache is per process and never persisted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    last_active: Instant,
}

#[derive(Debug)]
pub struct SessionCache<V> {
    entries: HashMap<String, Entry<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V> SessionCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_active) > self.ttl
    }

    /// Live entry for `key`. A hit counts as activity; an expired entry is
    /// dropped and reported as a miss.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<&mut V> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_active = now;
        Some(&mut entry.value)
    }

    /// Insert or replace. Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: String, value: V, now: Instant) -> Option<String> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.last_active = now;
            return None;
        }
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            evicted = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_active)
                .map(|(k, _)| k.clone());
            if let Some(k) = &evicted {
                self.entries.remove(k);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                last_active: now,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop every expired entry; returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_active) <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn hit_refreshes_activity_and_expiry_is_a_miss() {
        let t0 = Instant::now();
        let mut cache = SessionCache::new(4, TTL);
        cache.insert("a".into(), 1, t0);

        assert_eq!(cache.get("a", t0 + Duration::from_secs(50)).copied(), Some(1));
        // Activity at +50s keeps it alive past the original deadline.
        assert_eq!(cache.get("a", t0 + Duration::from_secs(100)).copied(), Some(1));
        assert!(cache.get("a", t0 + Duration::from_secs(161)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_evicts_least_recently_active() {
        let t0 = Instant::now();
        let mut cache = SessionCache::new(2, TTL);
        cache.insert("a".into(), 1, t0);
        cache.insert("b".into(), 2, t0 + Duration::from_secs(1));
        cache.get("a", t0 + Duration::from_secs(2));

        let evicted = cache.insert("c".into(), 3, t0 + Duration::from_secs(3));
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", t0 + Duration::from_secs(4)).is_some());
        assert!(cache.get("c", t0 + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn replacing_existing_key_never_evicts() {
        let t0 = Instant::now();
        let mut cache = SessionCache::new(1, TTL);
        cache.insert("a".into(), 1, t0);
        assert_eq!(cache.insert("a".into(), 2, t0), None);
        assert_eq!(cache.get("a", t0).copied(), Some(2));
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let t0 = Instant::now();
        let mut cache = SessionCache::new(8, TTL);
        cache.insert("old".into(), 1, t0);
        cache.insert("new".into(), 2, t0 + Duration::from_secs(50));
        assert_eq!(cache.purge_expired(t0 + Duration::from_secs(70)), 1);
        assert_eq!(cache.remove("new"), Some(2));
        assert_eq!(cache.capacity(), 8);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut cache = SessionCache::new(0, TTL);
        let t0 = Instant::now();
        cache.insert("a".into(), (), t0);
        assert_eq!(cache.len(), 1);
    }
}
