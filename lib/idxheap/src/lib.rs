// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An indexed binary min-heap.
//!
//! `IdxHeap` is a binary min-heap over `i64` keys, each carrying an
//! auxiliary value. In addition to the usual insert / peek-root / pop-root
//! operations, it supports *removal and key adjustment at an arbitrary
//! slot*, which ordinary `BinaryHeap`-style structures don't offer. All of
//! those run in O(log n).
//!
//! Slots name positions in the heap's backing array, not elements: any
//! mutating operation may move elements between slots. The intended usage
//! pattern is either
//!
//! 1. operate only on the root, or
//! 2. inspect slots via [`IdxHeap::slot`] and immediately remove/adjust the
//!    slot you looked at, before any other mutation.
//!
//! Callers that keep longer-lived references to heap contents should store
//! an indirection (e.g. an index into an external table) as the value, and
//! validate it when it pops out. That is how the work queue uses this type:
//! heap entries are treated as possibly-stale handles, checked against the
//! table on pop.
//!
//! # Design goals
//!
//! - Removal anywhere, not just the root, without tombstones.
//! - Plain array storage so the caller can sample random slots (used by
//!   randomized work stealing).
//! - No unsafe code and no arithmetic tricks.
#[derive(Debug, Clone)]
struct Entry<T> {
    key: i64,
    value: T,
}

#[derive(Debug, Clone)]
pub struct IdxHeap<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for IdxHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdxHeap<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards all entries, keeping allocated storage.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Inserts `value` under `key`.
    pub fn insert(&mut self, key: i64, value: T) {
        self.entries.push(Entry { key, value });
        self.sift_up(self.entries.len() - 1);
    }

    /// Returns the minimum-key entry without removing it.
    pub fn root(&self) -> Option<(i64, &T)> {
        self.entries.first().map(|e| (e.key, &e.value))
    }

    /// Removes and returns the minimum-key entry.
    pub fn pop_root(&mut self) -> Option<(i64, T)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.remove(0))
        }
    }

    /// Returns the entry at `slot`, if `slot` is in range.
    pub fn slot(&self, slot: usize) -> Option<(i64, &T)> {
        self.entries.get(slot).map(|e| (e.key, &e.value))
    }

    /// Removes and returns the entry at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn remove(&mut self, slot: usize) -> (i64, T) {
        let e = self.entries.swap_remove(slot);
        if slot < self.entries.len() {
            // The element moved into `slot` came from the bottom of the
            // heap, so it can violate the heap property in either
            // direction relative to its new neighborhood.
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        (e.key, e.value)
    }

    /// Lowers the key of the entry at `slot` to `new_key`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range. Debug-asserts that the key
    /// actually decreases.
    pub fn decrease_key(&mut self, slot: usize, new_key: i64) {
        debug_assert!(new_key <= self.entries[slot].key);
        self.entries[slot].key = new_key;
        self.sift_up(slot);
    }

    /// Raises the key of the entry at `slot` to `new_key`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range. Debug-asserts that the key
    /// actually increases.
    pub fn increase_key(&mut self, slot: usize, new_key: i64) {
        debug_assert!(new_key >= self.entries[slot].key);
        self.entries[slot].key = new_key;
        self.sift_down(slot);
    }

    /// Iterates over entries in storage order (*not* key order).
    pub fn iter(&self) -> impl Iterator<Item = (i64, &T)> {
        self.entries.iter().map(|e| (e.key, &e.value))
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[parent].key <= self.entries[slot].key {
                break;
            }
            self.entries.swap(parent, slot);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            if left >= self.entries.len() {
                break;
            }
            let right = left + 1;
            let mut least = slot;
            if self.entries[left].key < self.entries[least].key {
                least = left;
            }
            if right < self.entries.len()
                && self.entries[right].key < self.entries[least].key
            {
                least = right;
            }
            if least == slot {
                break;
            }
            self.entries.swap(slot, least);
            slot = least;
        }
    }

    #[cfg(test)]
    fn check_consistent(&self) {
        for slot in 1..self.entries.len() {
            let parent = (slot - 1) / 2;
            assert!(
                self.entries[parent].key <= self.entries[slot].key,
                "heap property violated between slots {parent} and {slot}",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn base_state() {
        let h: IdxHeap<u32> = IdxHeap::new();
        assert!(h.is_empty());
        assert_eq!(h.root(), None);
    }

    #[test]
    fn pop_yields_key_order() {
        let mut h = IdxHeap::new();
        for (i, k) in [5i64, -2, 9, 0, 3, -2, 7].into_iter().enumerate() {
            h.insert(k, i);
            h.check_consistent();
        }

        let mut keys = Vec::new();
        while let Some((k, _)) = h.pop_root() {
            h.check_consistent();
            keys.push(k);
        }
        assert_eq!(keys, [-2, -2, 0, 3, 5, 7, 9]);
    }

    #[test]
    fn remove_arbitrary_slot() {
        let mut h = IdxHeap::new();
        for k in 0..16i64 {
            h.insert(k, k as u32);
        }

        // Remove a slot in the middle and check the heap heals.
        let (k, v) = h.remove(7);
        assert_eq!(k as u32, v);
        h.check_consistent();
        assert_eq!(h.len(), 15);

        // Everything except the removed key still comes out in order.
        let mut keys = Vec::new();
        while let Some((key, _)) = h.pop_root() {
            keys.push(key);
        }
        let expected: Vec<i64> = (0..16).filter(|x| *x != k).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn remove_last_slot() {
        let mut h = IdxHeap::new();
        h.insert(1, 'a');
        h.insert(2, 'b');
        let (k, v) = h.remove(h.len() - 1);
        assert_eq!((k, v), (2, 'b'));
        h.check_consistent();
        assert_eq!(h.pop_root(), Some((1, 'a')));
    }

    #[test]
    fn key_adjustment() {
        let mut h = IdxHeap::new();
        for k in [10i64, 20, 30, 40] {
            h.insert(k, k);
        }

        // Find 40's slot and promote it to the root.
        let slot = (0..h.len()).find(|&s| h.slot(s).unwrap().0 == 40).unwrap();
        h.decrease_key(slot, 5);
        h.check_consistent();
        assert_eq!(h.root(), Some((5, &40)));

        // Demote the root below everything else.
        h.increase_key(0, 99);
        h.check_consistent();
        assert_eq!(h.root(), Some((10, &10)));
    }

    #[test]
    fn backwards_slot_sweep() {
        // The work queue's steal path iterates slots from the end,
        // removing as it goes. Removing from the tail never disturbs
        // earlier slots, so the sweep visits every element exactly once.
        let mut h = IdxHeap::new();
        for k in 0..32i64 {
            h.insert(k, ());
        }
        let mut seen = Vec::new();
        for slot in (0..h.len()).rev() {
            if slot % 2 == 0 {
                let (k, ()) = h.remove(slot);
                seen.push(k);
                h.check_consistent();
            }
        }
        assert_eq!(seen.len(), 16);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 16);
    }

    proptest! {
        #[test]
        fn random_ops_preserve_order(ops in proptest::collection::vec(
            (any::<i64>(), 0usize..4), 0..200,
        )) {
            let mut h = IdxHeap::new();
            let mut model: Vec<i64> = Vec::new();

            for (key, op) in ops {
                match op {
                    // Insert twice as often as we remove, so the heap grows.
                    0 | 1 => {
                        h.insert(key, key);
                        model.push(key);
                    }
                    2 => {
                        if let Some((k, v)) = h.pop_root() {
                            prop_assert_eq!(k, v);
                            let min = *model.iter().min().unwrap();
                            prop_assert_eq!(k, min);
                            let at = model.iter().position(|x| *x == k).unwrap();
                            model.swap_remove(at);
                        }
                    }
                    _ => {
                        if !h.is_empty() {
                            let slot = (key.unsigned_abs() as usize) % h.len();
                            let (k, v) = h.remove(slot);
                            prop_assert_eq!(k, v);
                            let at = model.iter().position(|x| *x == k).unwrap();
                            model.swap_remove(at);
                        }
                    }
                }
                h.check_consistent();
                prop_assert_eq!(h.len(), model.len());
            }
        }
    }
}
