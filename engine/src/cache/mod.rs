//! Bounded LRU cache for live assistants
//!
//! Entries are kept in a slab-backed doubly linked list ordered from most to
//! least recently used, with a key index for O(1) lookup. Every operation
//! takes a single mutex, so concurrent readers never observe a half-applied
//! promotion or eviction.
//!
//! Values may own side resources outside the cache (for assistants, the
//! script handlers registered under their id). `Cached::release` is invoked
//! exactly when an entry leaves the cache through eviction, `remove` or
//! `clear`, always after the lock has been dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A value that can live in a [`Cache`]
pub trait Cached: Send + Sync {
    /// Identifier the value is stored under. An empty key is never cached.
    fn cache_key(&self) -> &str;

    /// Release resources held outside the cache
    fn release(&self) {}
}

struct Node<T> {
    key: String,
    value: Arc<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<T> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<T>> {
        self.slots.get(slot).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(slot).and_then(|n| n.as_mut())
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(n) => (n.prev, n.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn insert_front(&mut self, key: String, value: Arc<T>) {
        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
    }

    fn take(&mut self, slot: usize) -> Option<Arc<T>> {
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some(node.value)
    }
}

/// Thread-safe bounded LRU cache
pub struct Cache<T: Cached> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Cached> Cache<T> {
    /// Create a new cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up `key` and mark it most recently used
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().expect("Cache lock poisoned");
        let slot = *inner.index.get(key)?;
        inner.promote(slot);
        inner.node(slot).map(|n| Arc::clone(&n.value))
    }

    /// Look up `key` without changing recency
    pub fn peek(&self, key: &str) -> Option<Arc<T>> {
        let inner = self.inner.lock().expect("Cache lock poisoned");
        let slot = *inner.index.get(key)?;
        inner.node(slot).map(|n| Arc::clone(&n.value))
    }

    /// Insert or replace a value under its own key
    ///
    /// Replacing an existing entry swaps the value and promotes it without
    /// releasing the previous value. Inserting past capacity evicts exactly
    /// the least recently used entry. Values with an empty key are ignored.
    pub fn put(&self, value: Arc<T>) {
        let key = value.cache_key().to_string();
        if key.is_empty() {
            return;
        }

        let evicted = {
            let mut inner = self.inner.lock().expect("Cache lock poisoned");

            if let Some(&slot) = inner.index.get(&key) {
                if let Some(node) = inner.node_mut(slot) {
                    node.value = value;
                }
                inner.promote(slot);
                None
            } else {
                inner.insert_front(key, value);
                if inner.index.len() > self.capacity {
                    match inner.tail {
                        Some(tail) => inner.take(tail),
                        None => None,
                    }
                } else {
                    None
                }
            }
        };

        if let Some(old) = evicted {
            tracing::debug!("Evicting '{}' from assistant cache", old.cache_key());
            old.release();
        }
    }

    /// Remove `key`, releasing its resources. Unknown keys are ignored.
    pub fn remove(&self, key: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("Cache lock poisoned");
            match inner.index.get(key).copied() {
                Some(slot) => inner.take(slot),
                None => None,
            }
        };

        if let Some(value) = removed {
            value.release();
        }
    }

    /// Remove every entry, releasing each one
    pub fn clear(&self) {
        let drained: Vec<Arc<T>> = {
            let mut inner = self.inner.lock().expect("Cache lock poisoned");
            let drained = inner
                .slots
                .drain(..)
                .flatten()
                .map(|n| n.value)
                .collect();
            *inner = Inner::new();
            drained
        };

        for value in drained {
            value.release();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Cache lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys ordered from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("Cache lock poisoned");
        let mut keys = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            match inner.node(slot) {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Entry {
        key: String,
        released: Arc<AtomicUsize>,
    }

    impl Cached for Entry {
        fn cache_key(&self) -> &str {
            &self.key
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry(key: &str, released: &Arc<AtomicUsize>) -> Arc<Entry> {
        Arc::new(Entry {
            key: key.to_string(),
            released: Arc::clone(released),
        })
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(2);

        cache.put(entry("a", &released));
        cache.put(entry("b", &released));
        cache.put(entry("c", &released));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_promotes() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(2);

        cache.put(entry("a", &released));
        cache.put(entry("b", &released));
        assert!(cache.get("a").is_some());
        cache.put(entry("c", &released));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_replace_does_not_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(2);

        cache.put(entry("a", &released));
        cache.put(entry("a", &released));

        assert_eq!(cache.len(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_key_ignored() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(2);

        cache.put(entry("", &released));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_clear_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(4);

        cache.put(entry("a", &released));
        cache.put(entry("b", &released));
        cache.put(entry("c", &released));

        cache.remove("b");
        cache.remove("missing");
        assert_eq!(released.load(Ordering::SeqCst), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 3);

        cache.put(entry("d", &released));
        assert_eq!(cache.keys(), vec!["d".to_string()]);
    }
}
