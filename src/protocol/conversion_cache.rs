use std::collections::VecDeque;
use std::hash::Hash;
use rustc_hash::FxHashMap;
use crate::protocol::bits::BitBuf;
use crate::protocol::field_type::Primitive;
use crate::protocol::value::Value;

/// (wire shape, 64 bit canonical form of the value or of the raw bits)
pub type CacheKey = (Primitive, u64);

/// A map holding at most `capacity` entries, evicting the oldest insertion first. A miss only
///  costs a recomputation.
struct Bounded<K, V> {
    capacity: usize,
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Hash + Eq + Clone, V: Clone> Bounded<K, V> {
    fn new(capacity: usize) -> Bounded<K, V> {
        Bounded {
            capacity,
            map: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Memoizes primitive pack / unpack conversions. The same values (`source`, protocol, common
///  message types) recur in every packet of a burst.
pub struct ConversionCache {
    packed: Bounded<CacheKey, BitBuf>,
    unpacked: Bounded<CacheKey, Value>,
    hits: u64,
    misses: u64,
}

impl ConversionCache {
    pub fn new(capacity: usize) -> ConversionCache {
        ConversionCache {
            packed: Bounded::new(capacity),
            unpacked: Bounded::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn pack(&mut self, key: CacheKey, compute: impl FnOnce() -> BitBuf) -> BitBuf {
        if let Some(bits) = self.packed.get(&key) {
            self.hits += 1;
            return bits;
        }
        self.misses += 1;
        let bits = compute();
        self.packed.insert(key, bits.clone());
        bits
    }

    pub fn unpack(&mut self, key: CacheKey, compute: impl FnOnce() -> Value) -> Value {
        if let Some(value) = self.unpacked.get(&key) {
            self.hits += 1;
            return value;
        }
        self.misses += 1;
        let value = compute();
        self.unpacked.insert(key, value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.packed.len() + self.unpacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
