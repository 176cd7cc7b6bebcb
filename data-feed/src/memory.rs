use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    updated_at_ms: i64,
}

/// TTL + LRU map.
///
/// A fresh read or a write restamps the entry and bumps its recency, so an
/// entry stays alive while it is in use. Every `get`/`set` sweeps stale entries.
#[derive(Debug, Clone)]
pub struct MemoryCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Most recently touched first.
    order: VecDeque<K>,
    ttl_ms: i64,
    max_entries: usize,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl_ms: i64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl_ms,
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn is_fresh(&self, updated_at_ms: i64, now_ms: i64) -> bool {
        now_ms.saturating_sub(updated_at_ms) < self.ttl_ms
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_front(k);
            }
        }
    }

    /// Fresh value for `key`; the hit restamps the entry and bumps its recency.
    pub fn get(&mut self, key: &K, now_ms: i64) -> Option<V> {
        self.sweep(now_ms);
        let entry = self.entries.get_mut(key)?;
        entry.updated_at_ms = now_ms;
        let value = entry.value.clone();
        self.touch(key);
        Some(value)
    }

    /// Fresh value without touching recency or purging.
    pub fn peek(&self, key: &K, now_ms: i64) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| self.is_fresh(e.updated_at_ms, now_ms))
            .map(|e| &e.value)
    }

    pub fn contains(&self, key: &K, now_ms: i64) -> bool {
        self.peek(key, now_ms).is_some()
    }

    /// Insert or refresh; returns the keys evicted for capacity.
    pub fn set(&mut self, key: K, value: V, now_ms: i64) -> Vec<K> {
        self.sweep(now_ms);
        let fresh = Entry {
            value,
            updated_at_ms: now_ms,
        };
        if self.entries.insert(key.clone(), fresh).is_some() {
            self.touch(&key);
        } else {
            self.order.push_front(key);
        }
        self.evict_over_capacity()
    }

    /// Re-insert a restored entry as the least recent, keeping its write time.
    /// Stale or duplicate entries are skipped.
    pub fn restore(&mut self, key: K, value: V, updated_at_ms: i64, now_ms: i64) -> bool {
        if !self.is_fresh(updated_at_ms, now_ms) || self.entries.contains_key(&key) {
            return false;
        }
        if self.entries.len() >= self.max_entries {
            return false;
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                updated_at_ms,
            },
        );
        self.order.push_back(key);
        true
    }

    fn evict_over_capacity(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries {
            let Some(oldest) = self.order.pop_back() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    /// Purge every entry older than the TTL; returns how many were removed.
    pub fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        let ttl_ms = self.ttl_ms;
        self.entries
            .retain(|_, e| now_ms.saturating_sub(e.updated_at_ms) < ttl_ms);
        if self.entries.len() != before {
            let entries = &self.entries;
            self.order.retain(|k| entries.contains_key(k));
        }
        before - self.entries.len()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// `(key, value, updated_at_ms)` from most to least recently touched.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = (&K, &V, i64)> + '_ {
        self.order.iter().filter_map(move |k| {
            self.entries
                .get(k)
                .map(|e| (k, &e.value, e.updated_at_ms))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TTL: i64 = 1_000;

    #[test]
    fn set_then_get_within_ttl() {
        let mut cache = MemoryCache::new(TTL, 4);
        cache.set("a", 1, 0);
        assert_eq!(cache.get(&"a", TTL - 1), Some(1));
    }

    #[test]
    fn get_after_ttl_purges() {
        let mut cache = MemoryCache::new(TTL, 4);
        cache.set("a", 1, 0);
        assert_eq!(cache.get(&"a", TTL), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reads_extend_freshness() {
        let mut cache = MemoryCache::new(TTL, 4);
        cache.set("a", 1, 0);
        assert_eq!(cache.get(&"a", 900), Some(1));
        assert_eq!(cache.get(&"a", 1_100), Some(1));
        assert_eq!(cache.get(&"a", 1_899), Some(1));
        assert_eq!(cache.get(&"a", 2_900), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn peek_does_not_extend_freshness() {
        let mut cache = MemoryCache::new(TTL, 4);
        cache.set("a", 1, 0);
        assert_eq!(cache.peek(&"a", 900), Some(&1));
        assert_eq!(cache.get(&"a", 1_000), None);
    }

    #[test]
    fn inserting_three_into_two_evicts_first() {
        let mut cache = MemoryCache::new(TTL, 2);
        cache.set("A", 1, 0);
        cache.set("B", 2, 1);
        let evicted = cache.set("C", 3, 2);
        assert_eq!(evicted, vec!["A"]);
        assert!(cache.contains(&"B", 3));
        assert!(cache.contains(&"C", 3));
    }

    #[test]
    fn read_protects_from_eviction() {
        let mut cache = MemoryCache::new(TTL, 2);
        cache.set("A", 1, 0);
        cache.set("B", 2, 1);
        cache.get(&"A", 2);
        let evicted = cache.set("C", 3, 3);
        assert_eq!(evicted, vec!["B"]);
    }

    #[test]
    fn newest_first_iteration_and_restore() {
        let mut cache = MemoryCache::new(TTL, 3);
        cache.set("a", 1, 0);
        cache.set("b", 2, 10);
        let keys: Vec<_> = cache.iter_newest_first().map(|(k, _, _)| *k).collect();
        assert_eq!(keys, vec!["b", "a"]);

        let mut restored = MemoryCache::new(TTL, 3);
        for (k, v, at) in cache.iter_newest_first() {
            assert!(restored.restore(*k, *v, at, 20));
        }
        assert!(!restored.restore("old", 9, -5_000, 20));
        let keys: Vec<_> = restored.iter_newest_first().map(|(k, _, _)| *k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Get(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..8).prop_map(Op::Set), (0u8..8).prop_map(Op::Get)]
    }

    proptest! {
        #[test]
        fn capacity_and_lru_hold(ops in prop::collection::vec(op(), 1..200), cap in 1usize..6) {
            let mut cache = MemoryCache::new(i64::MAX, cap);
            // reference recency list, most recent first
            let mut model: Vec<u8> = Vec::new();
            for (now, op) in ops.into_iter().enumerate() {
                let now = now as i64;
                match op {
                    Op::Set(k) => {
                        model.retain(|x| *x != k);
                        model.insert(0, k);
                        let expected: Vec<u8> = if model.len() > cap {
                            model.split_off(cap)
                        } else {
                            Vec::new()
                        };
                        let evicted = cache.set(k, now, now);
                        prop_assert_eq!(evicted, expected);
                    }
                    Op::Get(k) => {
                        let hit = cache.get(&k, now).is_some();
                        prop_assert_eq!(hit, model.contains(&k));
                        if hit {
                            model.retain(|x| *x != k);
                            model.insert(0, k);
                        }
                    }
                }
                prop_assert!(cache.len() <= cap);
            }
        }
    }
}
