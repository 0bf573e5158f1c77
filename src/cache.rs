use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Map whose entries expire a fixed time after insertion. Expired entries are
/// dropped lazily on lookup or by `purge_expired`.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, TtlEntry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.get(key)?;
        if now < entry.expires_at {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(key, TtlEntry { value, expires_at });
    }

    /// Takes the entry out; an expired entry is dropped and reported as absent.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        (Instant::now() < entry.expires_at).then_some(entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|e| now >= e.expires_at)
            .map(|e| e.key().clone())
            .collect();
        expired
            .iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
