//! Constant-time recency ordering
//!
//! A hashmap from key to slot plus an index-linked list over a slab of nodes.
//! The head is the least recently used key, the tail the most recent.
//! Both the resident decoder set and the activation cache keep their values
//! in their own maps and use this structure only for ordering.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Recency order over a set of keys with O(1) touch, insert, remove and evict.
pub struct RecencyList<K> {
    index: HashMap<K, usize>,
    /// Freed slots keep their stale node until reused
    slots: Vec<Node<K>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Clone + Eq + Hash> Default for RecencyList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> RecencyList<K> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Move `key` to the most-recent position. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        let Some(&slot) = self.index.get(key) else {
            return false;
        };
        if self.tail != Some(slot) {
            self.unlink(slot);
            self.link_tail(slot);
        }
        true
    }

    /// Insert `key` as most recent. An existing key is touched instead.
    ///
    /// Returns true if the key was newly inserted.
    pub fn push(&mut self, key: K) -> bool {
        if self.touch(&key) {
            return false;
        }
        let node = Node {
            key: key.clone(),
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = node;
                slot
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_tail(slot);
        true
    }

    /// Remove `key` from the order. Returns false if absent.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.free.push(slot);
        true
    }

    /// Least recently used key, without removing it.
    pub fn peek_lru(&self) -> Option<&K> {
        self.head.map(|slot| &self.slots[slot].key)
    }

    /// Remove and return the least recently used key.
    pub fn pop_lru(&mut self) -> Option<K> {
        let key = self.peek_lru()?.clone();
        self.remove(&key);
        Some(key)
    }

    /// Keys from least to most recently used.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn node(&self, slot: usize) -> &Node<K> {
        &self.slots[slot]
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K> {
        &mut self.slots[slot]
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn link_tail(&mut self, slot: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

/// Iterator from least to most recently used key.
pub struct Iter<'a, K> {
    list: &'a RecencyList<K>,
    cursor: Option<usize>,
}

impl<'a, K: Clone + Eq + Hash> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = &self.list.slots[slot];
        self.cursor = node.next;
        Some(&node.key)
    }
}
