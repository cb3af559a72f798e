//! Fixed-capacity map with least-recently-touched eviction.
//!
//! Every read through [`PopularityCache::get`] / [`PopularityCache::get_mut`]
//! and every insert stamps the entry with a monotonically increasing access
//! tick. A `BTreeMap` from tick to key keeps the coldest entry one lookup
//! away, so eviction is `O(log n)`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use super::CacheStats;

/// Callback invoked with each entry pushed out by capacity pressure.
pub type EvictionHook<K, V> = Box<dyn FnMut(K, V) + Send>;

struct Slot<V> {
    value: V,
    tick: u64,
}

/// Bounded associative store evicting the least-recently-touched entry.
///
/// Not internally synchronized: owners wrap it in a
/// [`parking_lot::Mutex`] and hold the lock for a single operation.
pub struct PopularityCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    /// access tick -> key, oldest first
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    on_evict: Option<EvictionHook<K, V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    peak_entries: usize,
}

impl<K, V> PopularityCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(4096)),
            recency: BTreeMap::new(),
            next_tick: 0,
            on_evict: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            peak_entries: 0,
        }
    }

    /// Create a cache that calls `hook` for every entry evicted by capacity
    /// pressure. Explicit removals never call the hook.
    pub fn with_eviction_hook<F>(capacity: usize, hook: F) -> Self
    where
        F: FnMut(K, V) + Send + 'static,
    {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(Box::new(hook));
        cache
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &K) -> bool {
        let tick = self.next_tick;
        match self.entries.get_mut(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                slot.tick = tick;
                self.recency.insert(tick, key.clone());
                self.next_tick += 1;
                true
            }
            None => false,
        }
    }

    /// Insert or replace an entry.
    ///
    /// Replacing returns the previous value and refreshes recency. Inserting
    /// a new key into a full cache first evicts the least-recently-touched
    /// entry through the eviction hook.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.touch(&key) {
            return self
                .entries
                .get_mut(&key)
                .map(|slot| std::mem::replace(&mut slot.value, value));
        }

        if self.entries.len() >= self.capacity {
            self.evict_coldest();
        }

        let tick = self.tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(key, Slot { value, tick });
        self.peak_entries = self.peak_entries.max(self.entries.len());
        None
    }

    fn evict_coldest(&mut self) {
        let Some((_, key)) = self.recency.pop_first() else {
            return;
        };
        if let Some(slot) = self.entries.remove(&key) {
            self.evictions += 1;
            if let Some(hook) = self.on_evict.as_mut() {
                hook(key, slot.value);
            }
        }
    }

    /// Look up an entry and mark it as recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.touch(key) {
            self.hits += 1;
            self.entries.get(key).map(|slot| &slot.value)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Mutable lookup that marks the entry as recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.touch(key) {
            self.hits += 1;
            self.entries.get_mut(key).map(|slot| &mut slot.value)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Look up an entry without affecting recency or statistics.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Check whether a key is present (no recency update).
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry without invoking the eviction hook.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot.value)
    }

    /// Remove every entry matching `pred`, oldest first, without invoking
    /// the eviction hook.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let matching: Vec<(u64, K)> = self
            .recency
            .iter()
            .filter(|(_, key)| {
                self.entries
                    .get(*key)
                    .is_some_and(|slot| pred(key, &slot.value))
            })
            .map(|(tick, key)| (*tick, key.clone()))
            .collect();

        let mut removed = Vec::with_capacity(matching.len());
        for (tick, key) in matching {
            self.recency.remove(&tick);
            if let Some(slot) = self.entries.remove(&key) {
                removed.push((key, slot.value));
            }
        }
        removed
    }

    /// Take every entry out of the cache, oldest first. The eviction hook is
    /// not called.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let order = std::mem::take(&mut self.recency);
        let mut drained = Vec::with_capacity(order.len());
        for (_, key) in order {
            if let Some(slot) = self.entries.remove(&key) {
                drained.push((key, slot.value));
            }
        }
        drained
    }

    /// Iterate over entries from least to most recently touched.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.recency
            .values()
            .filter_map(|key| self.entries.get_key_value(key))
            .map(|(k, slot)| (k, &slot.value))
    }

    /// Drop all entries and reset statistics. The eviction hook is not called.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.peak_entries = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            capacity: self.capacity,
            evictions: self.evictions,
            peak_entries: self.peak_entries,
        }
    }
}

impl<K, V> fmt::Debug for PopularityCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopularityCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.len())
            .field("evictions", &self.evictions)
            .field("has_hook", &self.on_evict.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording_cache(capacity: usize) -> (PopularityCache<u32, &'static str>, Arc<Mutex<Vec<(u32, &'static str)>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = PopularityCache::with_eviction_hook(capacity, move |k, v| {
            sink.lock().unwrap().push((k, v));
        });
        (cache, evicted)
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = PopularityCache::new(4);
        assert!(cache.insert(1, "one").is_none());
        assert_eq!(cache.get(&1), Some(&"one"));
        assert_eq!(cache.get(&2), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut cache = PopularityCache::new(2);
        cache.insert(1, "one");
        assert_eq!(cache.insert(1, "uno"), Some("one"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&1), Some(&"uno"));
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let (mut cache, evicted) = recording_cache(3);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(3, "c");

        // Touch 1 so that 2 becomes the coldest entry
        cache.get(&1);
        cache.insert(4, "d");

        assert_eq!(*evicted.lock().unwrap(), vec![(2, "b")]);
        assert!(!cache.contains_key(&2));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let (mut cache, evicted) = recording_cache(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.peek(&1);
        cache.insert(3, "c");

        assert_eq!(*evicted.lock().unwrap(), vec![(1, "a")]);
    }

    #[test]
    fn test_remove_skips_hook() {
        let (mut cache, evicted) = recording_cache(2);
        cache.insert(1, "a");
        assert_eq!(cache.remove(&1), Some("a"));
        assert!(cache.is_empty());
        assert!(evicted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_where() {
        let mut cache = PopularityCache::new(8);
        for i in 0..6u32 {
            cache.insert(i, i * 10);
        }
        let removed = cache.remove_where(|k, _| k % 2 == 0);
        assert_eq!(removed, vec![(0, 0), (2, 20), (4, 40)]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_drain_in_recency_order() {
        let mut cache = PopularityCache::new(4);
        cache.insert("x", 1);
        cache.insert("y", 2);
        cache.get(&"x");
        assert_eq!(cache.drain(), vec![("y", 2), ("x", 1)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = PopularityCache::new(0);
        cache.insert(1, ());
        cache.insert(2, ());
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&2));
    }

    #[test]
    fn test_peak_entries_tracking() {
        let mut cache = PopularityCache::new(10);
        for i in 0..5 {
            cache.insert(i, ());
        }
        cache.remove(&0);
        cache.remove(&1);
        assert_eq!(cache.stats().peak_entries, 5);
        assert_eq!(cache.stats().entries, 3);
    }

    #[test]
    fn test_iter_oldest_first() {
        let mut cache = PopularityCache::new(3);
        cache.insert(1, 'a');
        cache.insert(2, 'b');
        cache.insert(3, 'c');
        cache.get_mut(&1);
        let keys: Vec<_> = cache.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![2, 3, 1]);
    }
}
