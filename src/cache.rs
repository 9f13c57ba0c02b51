use std::{
    cmp::min,
    collections::{HashMap, LinkedList},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU8, Ordering},
};

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry<K, V> {
    key: K,
    value: V,

    freq: AtomicU8,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V) -> Self {
        Entry {
            key,
            value,
            freq: AtomicU8::new(0),
        }
    }
}

impl<K, V> Clone for Entry<K, V>
where
    K: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Entry {
            key: self.key.clone(),
            value: self.value.clone(),
            freq: AtomicU8::new(self.freq.load(Ordering::SeqCst)),
        }
    }
}

type List<K, V> = LinkedList<Entry<K, V>>;

/// A bounded cache with small/main/ghost queues. Recently written large
/// values and their decoded forms live here; eviction only costs a re-read
/// of the sidecar file, so correctness never depends on retention.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_main_size: usize,
    max_cache_size: usize,
    /// new entries are added to this queue
    small: List<K, V>,
    /// entries that have been accessed at least twice are moved to this queue
    main: List<K, V>,
    /// entries that are evicted from small before being accessed twice are moved to this queue
    ghost: LinkedList<K>,
    /// Map of all entries for quick access.
    entries: HashMap<K, Entry<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_small_size = max_cache_size / 10;
        let max_main_size = max_cache_size - max_small_size;

        Cache {
            max_main_size,
            max_cache_size,
            small: LinkedList::new(),
            main: LinkedList::new(),
            ghost: LinkedList::new(),
            entries: HashMap::new(),
        }
    }

    /// Returns a reference to the value of the given key if it exists in the cache.
    pub fn get(&self, key: &K) -> Option<&V> {
        if let Some(entry) = self.entries.get(key) {
            let freq = min(entry.freq.load(Ordering::SeqCst) + 1, MAX_FREQUENCY_LIMIT);
            entry.freq.store(freq, Ordering::SeqCst);
            Some(&entry.value)
        } else {
            None
        }
    }

    /// Inserts a new entry with the given key and value into the cache.
    pub fn insert(&mut self, key: K, value: V) {
        self.evict();

        if self.entries.contains_key(&key) {
            let entry = Entry::new(key.clone(), value);
            self.entries.insert(key, entry.clone());
            self.main.push_back(entry);
        } else {
            let entry = Entry::new(key, value);
            self.entries.insert(entry.key.clone(), entry.clone());
            self.small.push_back(entry);
        }
    }

    /// Drops the given key. Queue bookkeeping catches up lazily on eviction.
    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.small.clear();
        self.main.clear();
        self.ghost.clear();
        self.entries.clear();
    }

    fn insert_m(&mut self, tail: Entry<K, V>) {
        self.main.push_front(tail);
    }

    fn insert_g(&mut self, tail: Entry<K, V>) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(key) = self.ghost.pop_back() {
                self.entries.remove(&key);
            }
        }
        self.ghost.push_front(tail.key);
    }

    fn evict(&mut self) {
        if self.small.len() + self.main.len() >= self.max_cache_size {
            if self.main.len() >= self.max_main_size || self.small.is_empty() {
                self.evict_m();
            } else {
                self.evict_s();
            }
        }
    }

    fn evict_m(&mut self) {
        while let Some(tail) = self.main.pop_front() {
            let freq = tail.freq.load(Ordering::SeqCst);
            if freq > 0 {
                tail.freq.store(freq - 1, Ordering::SeqCst);
                self.main.push_back(tail);
            } else {
                self.insert_g(tail);
                break;
            }
        }
    }

    fn evict_s(&mut self) {
        while let Some(tail) = self.small.pop_front() {
            if tail.freq.load(Ordering::SeqCst) > 1 {
                self.insert_m(tail);
            } else {
                self.insert_g(tail);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use super::*;

    fn assert_opt_eq<V: PartialEq + Debug>(opt: Option<&V>, v: V) {
        assert!(opt.is_some());
        assert_eq!(opt.unwrap(), &v);
    }

    #[test]
    fn test_push_and_read() {
        let mut cache = Cache::new(2);

        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_opt_eq(cache.get(&"apple"), "red");
        assert_opt_eq(cache.get(&"banana"), "yellow");
    }

    #[test]
    fn test_push_removes_oldest() {
        let mut cache = Cache::new(2);

        let fruits = vec![
            ("apple", "red"),
            ("banana", "yellow"),
            ("orange", "orange"),
            ("pear", "green"),
            ("peach", "pink"),
        ];

        for (fruit, color) in fruits {
            cache.insert(fruit, color);
        }

        assert!(cache.get(&"apple").is_none());
        assert_opt_eq(cache.get(&"pear"), "green");
        assert_opt_eq(cache.get(&"peach"), "pink");

        // "apple" should have been removed from the cache.
        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_opt_eq(cache.get(&"apple"), "red");
        assert_opt_eq(cache.get(&"banana"), "yellow");
    }

    #[test]
    fn test_remove() {
        let mut cache = Cache::new(4);
        cache.insert(1, "one");
        cache.insert(2, "two");

        cache.remove(&1);
        assert!(cache.get(&1).is_none());
        assert_opt_eq(cache.get(&2), "two");

        cache.remove(&42); // absent keys are fine
    }

    #[test]
    fn test_overwrite_same_key() {
        let mut cache = Cache::new(4);
        cache.insert("k", 1);
        cache.insert("k", 2);
        assert_opt_eq(cache.get(&"k"), 2);
    }

    #[test]
    fn test_clear() {
        let mut cache = Cache::new(4);
        cache.insert("k", 1);
        cache.clear();
        assert!(cache.get(&"k").is_none());
    }
}
