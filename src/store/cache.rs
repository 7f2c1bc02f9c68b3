//! # LRU Cache
//!
//! A fixed-capacity least-recently-used map. Two places use it: the read
//! cache of decoded nodes (evictions are silently dropped, the node is
//! still on disk) and the upload queue (evictions are encoded and staged
//! for write, see `upload_queue`).
//!
//! Recency is tracked with a monotonic tick per entry plus an ordered
//! tick-to-key map, so every operation is O(log n) without the pointer
//! juggling of an intrusive list. Hit and miss counters are kept for the
//! store to log at commit time.

use std::collections::BTreeMap;
use std::hash::Hash;

use hashbrown::HashMap;

#[derive(Debug)]
struct Slot<V> {
    tick: u64,
    value: V,
}

#[derive(Debug)]
pub struct LruCache<K, V> {
    max_len: usize,
    next_tick: u64,
    slots: HashMap<K, Slot<V>>,
    by_age: BTreeMap<u64, K>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            next_tick: 0,
            slots: HashMap::new(),
            by_age: BTreeMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.slots.keys()
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Insert an entry at the most-recently-used end. If the cache is over
    /// capacity afterwards, the least-recently-used entry is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.take(&key);
        let tick = self.bump();
        self.by_age.insert(tick, key.clone());
        self.slots.insert(key, Slot { tick, value });
        if self.slots.len() > self.max_len {
            self.pop_oldest()
        } else {
            None
        }
    }

    /// Fetch an entry and mark it most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick;
        match self.slots.get_mut(key) {
            None => {
                self.misses += 1;
                None
            }
            Some(slot) => {
                self.hits += 1;
                self.next_tick += 1;
                self.by_age.remove(&slot.tick);
                self.by_age.insert(tick, key.clone());
                slot.tick = tick;
                Some(&slot.value)
            }
        }
    }

    /// Remove an entry without any eviction side effects.
    pub fn take(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.by_age.remove(&slot.tick);
        Some(slot.value)
    }

    /// Remove and return the least-recently-used entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.by_age.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.value))
    }
}
