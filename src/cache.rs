//! Fixed-capacity map with least-recently-used eviction.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Thread-safe LRU cache. Reads and writes both count as a use.
///
/// Values are cloned out on `get`; store `Arc`s for anything large.
pub struct BoundedCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Recency stamp -> key; the first entry is the least recently used.
    order: BTreeMap<u64, K>,
    clock: u64,
}

struct Slot<V> {
    value: V,
    stamp: u64,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                order: BTreeMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let stamp = inner.tick();
        let slot = inner.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut slot.stamp, stamp);
        let value = slot.value.clone();
        inner.order.remove(&previous);
        inner.order.insert(stamp, key.clone());
        Some(value)
    }

    /// Inserts or replaces `key`. Returns the entry evicted to make room, if any.
    pub fn insert(&self, key: K, value: V) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        let stamp = inner.tick();
        if let Some(old) = inner.entries.insert(key.clone(), Slot { value, stamp }) {
            inner.order.remove(&old.stamp);
        }
        inner.order.insert(stamp, key);
        if inner.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = inner.order.pop_first()?;
        let slot = inner.entries.remove(&oldest)?;
        Some((oldest, slot.value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let slot = inner.entries.remove(key)?;
        inner.order.remove(&slot.stamp);
        Some(slot.value)
    }
}
