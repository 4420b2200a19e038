//! In-memory caches owned by the chain store.
//!
//! The caches are written only while connecting, committing or rolling back a block,
//! under the store write lock. Lookups never populate them.

use crate::ChainTip;
use bitnode_primitives::{BlockNumber, Hash256, OutPoint, TxOut};
use indexmap::IndexMap;
use std::hash::Hash;

const HEIGHT_CACHE_SIZE: usize = 10_000;
const OUTPUT_CACHE_SIZE: usize = 100_000;

/// Map holding at most `capacity` entries, the oldest insertion is evicted first.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Caches of the chain store.
#[derive(Debug)]
pub struct StoreCache {
    pub tip: Option<ChainTip>,
    pub heights: BoundedCache<Hash256, BlockNumber>,
    pub hashes: BoundedCache<BlockNumber, Hash256>,
    /// Recently created outputs, used to resolve the addresses of spending inputs.
    ///
    /// Entries may refer to outputs spent since, the store stays authoritative.
    pub outputs: BoundedCache<OutPoint, TxOut>,
}

impl Default for StoreCache {
    fn default() -> Self {
        Self {
            tip: None,
            heights: BoundedCache::new(HEIGHT_CACHE_SIZE),
            hashes: BoundedCache::new(HEIGHT_CACHE_SIZE),
            outputs: BoundedCache::new(OUTPUT_CACHE_SIZE),
        }
    }
}

impl StoreCache {
    pub fn clear(&mut self) {
        self.tip = None;
        self.heights.clear();
        self.hashes.clear();
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entry_is_evicted() {
        let mut cache = BoundedCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(1, "c");
        assert_eq!(cache.len(), 2);

        cache.insert(3, "d");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("b"));
        assert_eq!(cache.get(&3), Some("d"));

        assert_eq!(cache.remove(&2), Some("b"));
        assert_eq!(cache.len(), 1);
    }
}
