//! Sharded LRU result cache with per-entry TTL.
//!
//! Shards are independent `Mutex<IndexMap>` maps selected by a crc32 of the
//! key, so concurrent requests on unrelated keys never serialize on one
//! lock. Expiry is lazy (checked on read); there is no background sweeper.
//! LRU order is maintained by re-inserting touched entries at the back and
//! evicting from the front when a shard exceeds its capacity.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Cache statistics snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub shards: usize,
}

/// A bounded, TTL-expiring, sharded LRU cache.
pub struct ResultCache<V> {
    shards: Vec<Mutex<IndexMap<String, Entry<V>>>>,
    capacity_per_shard: usize,
    default_ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache with a total `capacity` spread over `shards` shards.
    pub fn new(capacity: usize, shards: usize, default_ttl: Duration) -> Self {
        let shard_count = shards.max(1);
        let capacity_per_shard = (capacity / shard_count).max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(IndexMap::new())).collect(),
            capacity_per_shard,
            default_ttl,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<IndexMap<String, Entry<V>>> {
        let index = crc32fast::hash(key.as_bytes()) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Return a non-expired value, refreshing its LRU position. Expired
    /// entries are dropped on sight.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut shard = self.shard_for(key).lock();
        let expired = match shard.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            shard.shift_remove(key);
            return None;
        }
        // Move to end for LRU.
        let entry = shard.shift_remove(key)?;
        let value = entry.value.clone();
        shard.insert(key.to_string(), entry);
        Some(value)
    }

    /// Insert with the default TTL.
    pub fn put(&self, key: String, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL (used for short-lived negative entries).
    pub fn put_with_ttl(&self, key: String, value: V, ttl: Duration) {
        let mut shard = self.shard_for(&key).lock();
        shard.shift_remove(&key);
        shard.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        while shard.len() > self.capacity_per_shard {
            shard.shift_remove_index(0);
        }
    }

    /// Drop every entry (generation publish, capability refresh).
    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    /// Number of live entries across all shards (expired entries still
    /// pending lazy removal included).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity_per_shard * self.shards.len(),
            shards: self.shards.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache(capacity: usize, shards: usize) -> ResultCache<String> {
        ResultCache::new(capacity, shards, Duration::from_secs(60))
    }

    /// A get immediately following a put returns the put value.
    #[test]
    fn get_after_put() {
        let cache = cache(16, 4);
        cache.put("k1".to_string(), "v1".to_string());
        assert_eq!(cache.get("k1").as_deref(), Some("v1"));
        assert_eq!(cache.get("missing"), None);
    }

    /// The cache never exceeds its configured bound.
    #[test]
    fn capacity_is_bounded() {
        let cache = cache(8, 2);
        for i in 0..100 {
            cache.put(format!("key-{i}"), "v".to_string());
        }
        assert!(cache.len() <= cache.stats().capacity);
    }

    /// Touched entries survive eviction longer than untouched ones.
    #[test]
    fn eviction_is_least_recently_used() {
        let cache = ResultCache::new(2, 1, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c".to_string(), 3);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    /// Expired entries vanish on read.
    #[test]
    fn ttl_expires_lazily() {
        let cache: ResultCache<i32> = ResultCache::new(8, 2, Duration::from_secs(60));
        cache.put_with_ttl("gone".to_string(), 1, Duration::from_millis(10));
        cache.put("kept".to_string(), 2);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.get("kept"), Some(2));
    }

    #[test]
    fn invalidate_all_clears_every_shard() {
        let cache = cache(64, 8);
        for i in 0..32 {
            cache.put(format!("key-{i}"), "v".to_string());
        }
        assert!(!cache.is_empty());
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    /// Concurrent readers and writers on overlapping keys stay coherent.
    #[test]
    fn concurrent_access_is_safe() {
        let cache = Arc::new(ResultCache::new(256, 8, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("key-{}", i % 32);
                    cache.put(key.clone(), t * 1000 + i);
                    let _ = cache.get(&key);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= cache.stats().capacity);
    }
}
