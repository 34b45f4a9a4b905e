// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity LRU set.
//!
//! `LruSet` remembers the most recently inserted/queried keys up to a fixed
//! capacity, evicting the least recently used key when full. Lookup hits
//! refresh recency. There are no values; the interesting question is only
//! "have I seen this key recently?", which is what the engine's closed-id
//! caches need.
//!
//! Recency is tracked with a slab-backed list (head = next victim, tail =
//! most recent) and a map from key to list handle, so every operation is
//! O(1) expected.
//!
//! A capacity of zero disables the set: inserts are dropped and lookups
//! always miss.

use std::collections::HashMap;
use std::hash::Hash;

use slablist::{Handle, SlabList};

#[derive(Debug)]
pub struct LruSet<K> {
    map: HashMap<K, Handle>,
    recency: SlabList<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> LruSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            recency: SlabList::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks membership, refreshing the key's recency on a hit.
    pub fn contains(&mut self, key: &K) -> bool {
        let Some(&handle) = self.map.get(key) else {
            return false;
        };
        // Move to the most-recent end of the chain.
        let k = self.recency.remove(handle).expect("recency chain desync");
        let fresh = self.recency.push_back(k);
        self.map.insert(key.clone(), fresh);
        true
    }

    /// Records `key` as most recently used, evicting the oldest entry if
    /// the set is full. Re-inserting a present key just refreshes it.
    pub fn insert(&mut self, key: K) {
        if self.capacity == 0 {
            return;
        }
        if self.contains(&key) {
            return;
        }
        if self.map.len() >= self.capacity {
            let victim = self
                .recency
                .pop_front()
                .expect("full set must have a victim");
            self.map.remove(&victim);
        }
        let handle = self.recency.push_back(key.clone());
        self.map.insert(key, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_up_to_capacity() {
        let mut s = LruSet::new(3);
        for k in [1, 2, 3] {
            s.insert(k);
        }
        assert_eq!(s.len(), 3);
        for k in [1, 2, 3] {
            assert!(s.contains(&k));
        }
        assert!(!s.contains(&4));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut s = LruSet::new(3);
        s.insert(1);
        s.insert(2);
        s.insert(3);

        // Touch 1 so that 2 becomes the victim.
        assert!(s.contains(&1));
        s.insert(4);

        assert!(s.contains(&1));
        assert!(!s.contains(&2));
        assert!(s.contains(&3));
        assert!(s.contains(&4));
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn reinsert_refreshes() {
        let mut s = LruSet::new(2);
        s.insert(1);
        s.insert(2);
        s.insert(1); // refresh, not duplicate
        assert_eq!(s.len(), 2);
        s.insert(3); // evicts 2, the true LRU
        assert!(s.contains(&1));
        assert!(!s.contains(&2));
        assert!(s.contains(&3));
    }

    #[test]
    fn zero_capacity_disables() {
        let mut s = LruSet::new(0);
        s.insert(1);
        assert!(!s.contains(&1));
        assert!(s.is_empty());
    }
}
