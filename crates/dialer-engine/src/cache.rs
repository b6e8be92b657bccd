//! Bounded, expiring node-local caches
//!
//! The queue, attempt, resource, agent and call caches are all read-through
//! projections of the shared store. Entries expire after a fixed age and the
//! oldest entry is evicted once the cache is full.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Concurrent cache with a capacity bound and a per-entry time to live
#[derive(Debug)]
pub struct ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!("{} cache: entry {:?} expired", self.name, key);
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(key, CacheEntry::new(value));
    }

    /// Atomically return the live entry for `key` or insert the one built by
    /// `make`. The flag is `true` when `make` ran.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(self.ttl) {
                    let value = make();
                    occupied.insert(CacheEntry::new(value.clone()));
                    (value, true)
                } else {
                    (occupied.get().value.clone(), false)
                }
            }
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(CacheEntry::new(value.clone()));
                (value, true)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the live values
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_room(&self) {
        if self.entries.len() < self.capacity {
            return;
        }

        self.entries.retain(|_, entry| !entry.is_expired(self.ttl));
        if self.entries.len() < self.capacity {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.inserted_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            trace!("{} cache full, evicting {:?}", self.name, key);
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache: ExpiringCache<i64, String> =
            ExpiringCache::new("test", 10, Duration::from_secs(60));
        cache.insert(1, "one".to_string());
        assert_eq!(cache.get(&1).as_deref(), Some("one"));
        assert_eq!(cache.remove(&1).as_deref(), Some("one"));
        assert!(cache.get(&1).is_none());
        assert!(cache.remove(&1).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache: ExpiringCache<i64, i64> = ExpiringCache::new("test", 2, Duration::from_secs(60));
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache: ExpiringCache<i64, i64> =
            ExpiringCache::new("test", 10, Duration::from_millis(5));
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&1).is_none());
        assert!(cache.values().is_empty());
    }

    #[test]
    fn test_get_or_insert_with_runs_once() {
        let cache: ExpiringCache<i64, i64> =
            ExpiringCache::new("test", 10, Duration::from_secs(60));
        let (value, inserted) = cache.get_or_insert_with(5, || 50);
        assert_eq!((value, inserted), (50, true));

        let (value, inserted) = cache.get_or_insert_with(5, || 99);
        assert_eq!((value, inserted), (50, false));
    }
}
