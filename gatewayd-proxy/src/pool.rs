use dashmap::DashMap;
use gatewayd_core::GatewayError;
use std::hash::Hash;

/// Capacity sentinel: a pool built with capacity 0 is unbounded.
pub const EMPTY_POOL_CAPACITY: usize = 0;

/// Keyed concurrent store with an optional capacity bound.
///
/// This is the only shared mutable state between the accept path and the
/// relay path; values are cheap clones (`Arc` in practice).
pub struct Pool<K, V> {
    entries: DashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> Pool<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a value. Replaces silently when the key exists; fails with
    /// `PoolFull` when a bounded pool is at capacity.
    pub fn put(&self, key: K, value: V) -> Result<(), GatewayError> {
        if self.capacity > EMPTY_POOL_CAPACITY
            && self.entries.len() >= self.capacity
            && !self.entries.contains_key(&key)
        {
            return Err(GatewayError::PoolFull(self.capacity));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Remove and return the value under `key`.
    pub fn pop(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Non-destructive lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Return the existing value for `key`, or insert `value`.
    /// The flag is true when the value was already present.
    pub fn get_or_put(&self, key: K, value: V) -> Result<(V, bool), GatewayError> {
        if let Some(existing) = self.get(&key) {
            return Ok((existing, true));
        }
        if self.capacity > EMPTY_POOL_CAPACITY && self.entries.len() >= self.capacity {
            return Err(GatewayError::PoolFull(self.capacity));
        }
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok((entry.get().clone(), true)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(value.clone());
                Ok((value, false))
            }
        }
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the keys currently present.
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Visit each entry until the visitor returns false.
    ///
    /// Two-pass snapshot iteration: keys are collected first, then each is
    /// looked up, so no shard lock is held across the visitor and entries
    /// removed concurrently are simply skipped. The visitor must not call
    /// back into the pool with mutating operations.
    pub fn for_each(&self, mut visit: impl FnMut(&K, &V) -> bool) {
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                if !visit(&key, &value) {
                    break;
                }
            }
        }
    }
}
