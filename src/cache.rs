//! Bounded block body cache
//!
//! Decouples per-connection block arrival from the single UTXO consumer.
//! Bodies are shared as `Arc<Block>` so readers never copy transactions.
use crate::blockchain::{Block, Hash256};
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Thread-safe LRU keyed by `K`. Reads use `peek`, so only writes affect
/// eviction order.
pub struct ThreadSafeCache<K: Hash + Eq, V> {
    cache: Mutex<LruCache<K, V>>,
}

impl<K, V> ThreadSafeCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new_lru(capacity: usize) -> Self {
        // Zero maps to one rather than failing.
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity_nz)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.lock().contains(key)
    }

    /// Insert, returning the entry evicted to make room, if any.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        self.cache.lock().push(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache.lock().pop(key)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }
}

/// Cache for downloaded block bodies
pub type BlockCache = ThreadSafeCache<Hash256, Arc<Block>>;

impl BlockCache {
    pub const DEFAULT_CAPACITY: usize = 2048;

    pub fn new(capacity: usize) -> Self {
        Self::new_lru(capacity)
    }

    /// (entries, capacity)
    pub fn stats(&self) -> (usize, usize) {
        let cache = self.cache.lock();
        (cache.len(), cache.cap().get())
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn block(n: u32) -> Arc<Block> {
        let genesis = testing::genesis_header();
        Arc::new(testing::coinbase_block(&genesis, n, 50, vec![n as u8]))
    }

    #[test]
    fn test_block_cache() {
        let cache = BlockCache::new(10);
        let block = block(1);
        let hash = block.hash();

        cache.put(hash, block.clone());
        assert_eq!(cache.get(&hash).map(|b| b.hash()), Some(hash));
        assert!(cache.contains(&hash));
        assert_eq!(cache.len(), 1);

        let removed = cache.remove(&hash);
        assert!(removed.is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_ignores_reads() {
        let cache = BlockCache::new(3);
        let blocks: Vec<_> = (1..=4).map(block).collect();

        for b in &blocks[..3] {
            cache.put(b.hash(), b.clone());
        }
        // A peek must not save the oldest entry from eviction.
        assert!(cache.get(&blocks[0].hash()).is_some());

        let evicted = cache.put(blocks[3].hash(), blocks[3].clone());
        assert_eq!(evicted.map(|(h, _)| h), Some(blocks[0].hash()));
        assert_eq!(cache.stats(), (3, 3));
        assert!(cache.get(&blocks[0].hash()).is_none());
        assert!(cache.get(&blocks[3].hash()).is_some());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = BlockCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }
}
