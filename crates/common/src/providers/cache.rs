use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::types::{BlockDirection, TokenMetadata};

/// Shared read-mostly cache with an optional TTL.
///
/// Population is idempotent (the same key always maps to the same value), so
/// concurrent writers only race on identical data.
#[derive(Debug, Clone)]
pub struct Cache<K, V> {
    inner: Arc<RwLock<HashMap<K, (V, Instant)>>>,
    ttl: Option<Duration>,
}

pub type MetadataCache = Cache<String, TokenMetadata>;
pub type PriceCache = Cache<String, f64>;
pub type BlockTimeCache = Cache<(i64, BlockDirection), u64>;

impl<K, V> Cache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let guard = self.inner.read().ok()?;
        let (value, inserted_at) = guard.get(key)?;
        if self.ttl.is_some_and(|ttl| inserted_at.elapsed() > ttl) {
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        if let Ok(mut guard) = self.inner.write() {
            guard.insert(key, (value, Instant::now()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache: Cache<String, u64> = Cache::new(None);
        assert!(cache.is_empty());
        cache.insert("a".to_string(), 1);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache: Cache<u8, u8> = Cache::new(Some(Duration::ZERO));
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_clones_share_storage() {
        let a: BlockTimeCache = Cache::default();
        let b = a.clone();
        a.insert((1_760_000_000, BlockDirection::Before), 23_000_000);
        assert_eq!(b.get(&(1_760_000_000, BlockDirection::Before)), Some(23_000_000));
        assert_eq!(b.get(&(1_760_000_000, BlockDirection::After)), None);
    }
}
