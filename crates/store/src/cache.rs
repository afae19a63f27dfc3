//! Byte-budgeted sharded LRU caches
//!
//! The payload cache (decoded bodies, keyed by content hash) and the frame
//! cache (extracted RGBA frames, keyed by segment + frame number) share this
//! implementation: an LRU per shard, guarded by its own mutex, evicting by
//! total byte size rather than entry count. Sharding (16 ways by default)
//! keeps readers from contending on one lock.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default shard count
pub const DEFAULT_SHARDS: usize = 16;

/// Payload cache budget: 1 GiB
pub const PAYLOAD_CACHE_BYTES: usize = 1 << 30;

/// Frame cache budget: 256 MiB
pub const FRAME_CACHE_BYTES: usize = 256 << 20;

struct Shard<K: Hash + Eq> {
    entries: LruCache<K, Arc<Vec<u8>>>,
    bytes: usize,
}

impl<K: Hash + Eq> Shard<K> {
    fn evict_to(&mut self, budget: usize) {
        while self.bytes > budget {
            match self.entries.pop_lru() {
                Some((_, value)) => self.bytes -= value.len(),
                None => break,
            }
        }
    }
}

/// Hit/miss counters for stats reporting
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes: u64,
    pub entries: u64,
}

/// Sharded, byte-budgeted LRU cache
pub struct ShardedByteCache<K: Hash + Eq> {
    shards: Vec<Mutex<Shard<K>>>,
    per_shard_budget: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Hash + Eq> ShardedByteCache<K> {
    /// Cache with a total byte budget split across `DEFAULT_SHARDS` shards
    pub fn new(total_budget: usize) -> Self {
        Self::with_shards(total_budget, DEFAULT_SHARDS)
    }

    pub fn with_shards(total_budget: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                })
            })
            .collect();
        ShardedByteCache {
            shards,
            per_shard_budget: total_budget / shard_count,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &K) -> &Mutex<Shard<K>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: &K) -> Option<Arc<Vec<u8>>> {
        let found = self.shard_for(key).lock().entries.get(key).cloned();
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, key: K, value: Vec<u8>) {
        let size = value.len();
        // Values bigger than a whole shard would evict everything for one
        // entry that immediately gets evicted next; skip them.
        if size > self.per_shard_budget {
            return;
        }
        let mut shard = self.shard_for(&key).lock();
        if let Some(old) = shard.entries.put(key, Arc::new(value)) {
            shard.bytes -= old.len();
        }
        shard.bytes += size;
        shard.evict_to(self.per_shard_budget);
    }

    pub fn remove(&self, key: &K) {
        let mut shard = self.shard_for(key).lock();
        if let Some(old) = shard.entries.pop(key) {
            shard.bytes -= old.len();
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.bytes = 0;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut bytes = 0u64;
        let mut entries = 0u64;
        for shard in &self.shards {
            let shard = shard.lock();
            bytes += shard.bytes as u64;
            entries += shard.entries.len() as u64;
        }
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes,
            entries,
        }
    }
}
