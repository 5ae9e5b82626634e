// =============================================================================
// Generic TTL cache — backs the credential, risk-counter, and adapter caches
// =============================================================================
//
// A thin wrapper over `dashmap` so each cached key gets its own entry lock
// rather than one lock guarding the whole table. Used wherever a component
// needs "read-through with a short TTL, explicit invalidate" semantics.
// =============================================================================

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A sharded, TTL-expiring cache keyed by `K`.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return a cached value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or replace `key` with a TTL of `self.ttl`.
    pub fn put(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Insert or replace `key` with an explicit TTL override (used for the
    /// shorter negative-cache TTL on misses).
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_value() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn expired_entry_returns_none() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(1));
        cache.put("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn negative_cache_ttl_override_expires_independently() {
        let cache: TtlCache<String, Option<u32>> = TtlCache::new(Duration::from_secs(60));
        cache.put_with_ttl("miss".to_string(), None, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&"miss".to_string()), None);
    }
}
