use ahash::AHashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Cached values are rebuilt from immutable files, so a poisoned slot is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remembers the most recently fetched bucket of one contig. Queries touch variants in
/// key order, so consecutive lookups usually land in the same bucket.
pub struct BucketCache<B> {
    slot: Mutex<Option<(u32, Option<Arc<B>>)>>,
}

impl<B> Default for BucketCache<B> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<B> BucketCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached bucket for `bucket_id`, or runs `load` and caches its result.
    /// Absent buckets are cached as absent.
    pub fn get_or_load<E, F>(&self, bucket_id: u32, load: F) -> Result<Option<Arc<B>>, E>
    where
        F: FnOnce() -> Result<Option<B>, E>,
    {
        if let Some((cached_id, bucket)) = lock(&self.slot).as_ref() {
            if *cached_id == bucket_id {
                return Ok(bucket.clone());
            }
        }
        let loaded = load()?.map(Arc::new);
        *lock(&self.slot) = Some((bucket_id, loaded.clone()));
        Ok(loaded)
    }
}

struct Slot<V> {
    value: V,
    weight: usize,
    /// Stamp of the entry's newest place in the recency queue.
    stamp: u64,
}

/// Recency is a queue of `(stamp, key)`. A touch appends a fresh stamp instead of moving
/// the key, so queue entries whose stamp no longer matches their slot are stale and are
/// skipped on eviction.
struct WeightedEntries<K, V> {
    values: AHashMap<K, Slot<V>>,
    order: VecDeque<(u64, K)>,
    next_stamp: u64,
    total_weight: usize,
}

impl<K: Eq + Hash + Clone, V> WeightedEntries<K, V> {
    fn is_current(&self, stamp: u64, key: &K) -> bool {
        self.values.get(key).is_some_and(|slot| slot.stamp == stamp)
    }

    fn take_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Queues `key` as most recent. Its slot must already carry `stamp`.
    fn enqueue(&mut self, stamp: u64, key: K) {
        self.order.push_back((stamp, key));
        if self.order.len() > 2 * self.values.len() + 16 {
            self.compact();
        }
    }

    fn touch(&mut self, key: &K) {
        let stamp = self.take_stamp();
        let Some(slot) = self.values.get_mut(key) else {
            return;
        };
        slot.stamp = stamp;
        self.enqueue(stamp, key.clone());
    }

    /// Drops stale queue entries. Runs once the queue holds twice the live entries.
    fn compact(&mut self) {
        let mut order = std::mem::take(&mut self.order);
        order.retain(|(stamp, key)| self.is_current(*stamp, key));
        self.order = order;
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((stamp, key)) = self.order.pop_front() {
            if !self.is_current(stamp, &key) {
                continue;
            }
            if let Some(slot) = self.values.remove(&key) {
                self.total_weight -= slot.weight;
            }
            return true;
        }
        false
    }
}

/// Least-recently-used cache bounded by the summed weight of its entries rather than
/// their count. An entry heavier than the whole budget is computed but never retained.
pub struct WeightedCache<K, V> {
    capacity: usize,
    entries: Mutex<WeightedEntries<K, V>>,
}

impl<K, V> WeightedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(WeightedEntries {
                values: AHashMap::new(),
                order: VecDeque::new(),
                next_stamp: 0,
                total_weight: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = lock(&self.entries);
        let value = entries.values.get(key).map(|slot| slot.value.clone())?;
        entries.touch(key);
        Some(value)
    }

    /// Computes outside the lock; two threads racing on one key may both compute it.
    pub fn get_or_try_insert_with<E, F, W>(&self, key: K, compute: F, weigh: W) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        W: FnOnce(&V) -> usize,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert(key, value.clone(), weigh(&value));
        Ok(value)
    }

    pub fn insert(&self, key: K, value: V, weight: usize) {
        if weight > self.capacity {
            return;
        }
        let mut entries = lock(&self.entries);
        if let Some(old) = entries.values.remove(&key) {
            entries.total_weight -= old.weight;
        }
        while entries.total_weight + weight > self.capacity {
            if !entries.evict_oldest() {
                break;
            }
        }
        let stamp = entries.take_stamp();
        entries.values.insert(
            key.clone(),
            Slot {
                value,
                weight,
                stamp,
            },
        );
        entries.total_weight += weight;
        entries.enqueue(stamp, key);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_weight(&self) -> usize {
        lock(&self.entries).total_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn bucket_cache_reuses_last_bucket() {
        let cache: BucketCache<Vec<u32>> = BucketCache::new();
        let loads = Cell::new(0);
        let load = |v: Option<Vec<u32>>| {
            loads.set(loads.get() + 1);
            Ok::<_, ()>(v)
        };

        let a = cache.get_or_load(3, || load(Some(vec![1]))).unwrap();
        let b = cache.get_or_load(3, || load(Some(vec![2]))).unwrap();
        assert_eq!(a.as_deref(), Some(&vec![1]));
        assert_eq!(b.as_deref(), Some(&vec![1]));
        assert_eq!(loads.get(), 1);

        assert!(cache.get_or_load(4, || load(None)).unwrap().is_none());
        assert!(cache.get_or_load(4, || load(Some(vec![9]))).unwrap().is_none());
        assert_eq!(loads.get(), 2);
    }

    #[test]
    fn weighted_cache_evicts_least_recent_until_within_budget() {
        let cache: WeightedCache<&str, u32> = WeightedCache::new(10);
        cache.insert("a", 1, 4);
        cache.insert("b", 2, 4);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3, 4);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.total_weight(), 8);
    }

    #[test]
    fn repeated_hits_keep_the_recency_queue_bounded() {
        let cache: WeightedCache<u32, u32> = WeightedCache::new(3);
        cache.insert(1, 10, 1);
        cache.insert(2, 20, 1);
        for _ in 0..10_000 {
            assert_eq!(cache.get(&1), Some(10));
        }
        assert!(lock(&cache.entries).order.len() <= 2 * 2 + 16 + 1);

        // Key 2 is now the least recent despite key 1's older insertion.
        cache.insert(3, 30, 1);
        cache.insert(4, 40, 1);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&4), Some(40));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.total_weight(), 3);
    }

    #[test]
    fn reinserting_a_key_replaces_its_weight() {
        let cache: WeightedCache<&str, u32> = WeightedCache::new(10);
        cache.insert("a", 1, 6);
        cache.insert("a", 2, 3);
        cache.insert("b", 3, 7);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.total_weight(), 10);
        cache.insert("c", 4, 1);
        // "b" was touched less recently than "a".
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.total_weight(), 4);
    }

    #[test]
    fn oversized_entries_are_not_retained() {
        let cache: WeightedCache<u32, u32> = WeightedCache::new(5);
        let value = cache
            .get_or_try_insert_with(1, || Ok::<_, ()>(7), |_| 6)
            .unwrap();
        assert_eq!(value, 7);
        assert!(cache.is_empty());
    }

    #[test]
    fn compute_errors_are_propagated_and_not_cached() {
        let cache: WeightedCache<u32, u32> = WeightedCache::new(5);
        let err = cache.get_or_try_insert_with(1, || Err::<u32, _>("boom"), |_| 1);
        assert_eq!(err, Err("boom"));
        assert!(cache.get(&1).is_none());
    }
}
