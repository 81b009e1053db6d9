//! Insertion/recency ordered map backed by an index arena.
//!
//! Used for LRU tracking of cache lines and for bounded duplicate
//! suppression windows. All operations except iteration are O(1).

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LinkedMap<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K, V> Default for LinkedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LinkedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(
        &self,
        key: &K,
    ) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|s| &s.value)
    }

    /// Inserts at the back (most recent). An existing key is updated and moved to the back.
    pub fn insert(
        &mut self,
        key: K,
        value: V,
    ) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            self.unlink(idx);
            self.push_back(idx);
            return self.slots[idx].as_mut().map(|s| std::mem::replace(&mut s.value, value));
        }

        let slot = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_back(idx);
        None
    }

    /// Moves `key` to the back. Returns false if absent.
    pub fn touch(
        &mut self,
        key: &K,
    ) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.unlink(idx);
                self.push_back(idx);
                true
            }
            None => false,
        }
    }

    pub fn remove(
        &mut self,
        key: &K,
    ) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|s| s.value)
    }

    /// Oldest entry.
    pub fn front(&self) -> Option<(&K, &V)> {
        if self.head == NIL {
            return None;
        }
        self.slots[self.head].as_ref().map(|s| (&s.key, &s.value))
    }

    pub fn pop_front(&mut self) -> Option<(K, V)> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.unlink(idx);
        self.free.push(idx);
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.key);
        Some((slot.key, slot.value))
    }

    /// Iterates from oldest to most recent.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    fn push_back(
        &mut self,
        idx: usize,
    ) {
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = self.tail;
            slot.next = NIL;
        }
        if self.tail != NIL {
            if let Some(t) = self.slots[self.tail].as_mut() {
                t.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }

    fn unlink(
        &mut self,
        idx: usize,
    ) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(s) => (s.prev, s.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }
    }
}

pub struct Iter<'a, K, V> {
    map: &'a LinkedMap<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let slot = self.map.slots[self.cursor].as_ref()?;
        self.cursor = slot.next;
        Some((&slot.key, &slot.value))
    }
}
