//! Small ordered map with visitor-driven eviction.
//!
//! The pool decides per entry whether to evict, keep or stop scanning, so
//! the map itself stays policy-free. Most-recently-used entries sit at the
//! front; `trim` walks from the least-recently-used end.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    /// Keep the entry and continue scanning.
    Leave,
    /// Remove the entry and continue scanning.
    Evict,
    /// Keep the entry and stop scanning.
    Stop,
}

pub struct LruMap<K, V> {
    entries: VecDeque<(K, V)>,
    capacity: usize,
}

impl<K: PartialEq, V> LruMap<K, V> {
    pub fn new(capacity: usize) -> LruMap<K, V> {
        LruMap {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
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

    /// Lookup without renewing the entry's position.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Lookup renewing the entry to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos).unwrap();
        self.entries.push_front(entry);
        self.entries.front().map(|(_, v)| v)
    }

    /// Inserts at the most-recently-used position.
    pub fn insert(&mut self, key: K, value: V) -> &V {
        self.entries.push_front((key, value));
        &self.entries.front().unwrap().1
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        self.entries.remove(pos).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Walks entries from the least-recently-used end. The visitor is told
    /// whether the entry overflows the configured capacity and returns
    /// what to do with it.
    pub fn trim(&mut self, mut visitor: impl FnMut(&K, &V, bool) -> DropAction) {
        let mut index = self.entries.len();
        while index > 0 {
            index -= 1;
            let overflowed = index >= self.capacity;
            let (key, value) = &self.entries[index];
            match visitor(key, value, overflowed) {
                DropAction::Leave => {}
                DropAction::Evict => {
                    self.entries.remove(index);
                }
                DropAction::Stop => break,
            }
        }
    }
}
