//! Recency-ordered index keyed by code tuple
//!
//! A doubly linked list threaded through a slab, plus a hash map from key
//! to slab slot: lookup, touch, insert and remove are all O(1).

use ocvm_engine::CodeTuple;
use rustc_hash::FxHashMap;

#[derive(Debug)]
struct Node<V> {
    key: CodeTuple,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Entries ordered most- to least-recently used
#[derive(Debug)]
pub struct LruIndex<V> {
    slots: FxHashMap<CodeTuple, usize>,
    nodes: Vec<Option<Node<V>>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> Default for LruIndex<V> {
    fn default() -> Self {
        LruIndex {
            slots: FxHashMap::default(),
            nodes: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
        }
    }
}

impl<V> LruIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up without changing recency
    pub fn peek(&self, key: &CodeTuple) -> Option<&V> {
        let slot = *self.slots.get(key)?;
        self.node(slot).map(|n| &n.value)
    }

    /// Look up and move to the front
    pub fn touch(&mut self, key: &CodeTuple) -> Option<&V> {
        let slot = *self.slots.get(key)?;
        self.unlink(slot);
        self.link_front(slot);
        self.node(slot).map(|n| &n.value)
    }

    /// Insert at the front, returning the value it replaced
    pub fn push_front(&mut self, key: CodeTuple, value: V) -> Option<V> {
        let replaced = self.remove(&key);
        let node = Node { key, value, prev: None, next: None };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.slots.insert(key, slot);
        self.link_front(slot);
        replaced
    }

    pub fn remove(&mut self, key: &CodeTuple) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.unlink(slot);
        self.vacant.push(slot);
        self.nodes[slot].take().map(|n| n.value)
    }

    /// Entries from most to least recently used
    pub fn iter(&self) -> impl Iterator<Item = (&CodeTuple, &V)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some((&node.key, &node.value))
        })
    }

    /// Entries from least to most recently used
    pub fn iter_lru(&self) -> impl Iterator<Item = (&CodeTuple, &V)> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.prev;
            Some((&node.key, &node.value))
        })
    }

    fn node(&self, slot: usize) -> Option<&Node<V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
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

    fn link_front(&mut self, slot: usize) {
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
}
