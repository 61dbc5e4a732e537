use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Size- and age-bounded map used for per-gateway lookups.
///
/// - Entries older than `ttl` are invisible to readers and dropped on insert.
/// - When full, the oldest entry is evicted before inserting.
pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .get(key)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.get(key).is_some_and(|(_, t)| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.contains_key(&key) {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
