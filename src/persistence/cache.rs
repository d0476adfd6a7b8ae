//! In-process entity cache.
//!
//! One `EntityCache` exists per entity kind. The store is always written
//! first, so dropping any cached entry is safe: the next read falls through
//! to sled and repopulates it. When a capacity is configured, inserting a new
//! key into a full cache evicts one existing entry.

use std::hash::Hash;

use dashmap::DashMap;

#[derive(Debug)]
pub struct EntityCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
    capacity: Option<usize>,
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: K, value: V) {
        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
                self.evict_one();
            }
        }
        self.entries.insert(key, value);
    }

    /// Populate `key` from a store read unless a newer value is already
    /// cached. A committed write always wins over a concurrent read-through.
    pub fn fill(&self, key: K, value: V) {
        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
                self.evict_one();
            }
        }
        self.entries.entry(key).or_insert(value);
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&self) {
        let victim = self.entries.iter().next().map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            self.entries.remove(&victim);
        }
    }
}
