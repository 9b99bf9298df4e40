/*
 * Created on Thu Apr 18 2024
 *
 * This file is a part of Lattix
 * Lattix is a free and open-source library of concurrent in-memory index
 * structures (a B+Tree, an adaptive radix tree and an open-addressed hash
 * table) built for predictable performance under heavy multi-threaded
 * read and write workloads.
 *
 * Copyright (c) 2024, the Lattix authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Ordered iteration.
//!
//! An iterator pins an epoch for its whole lifetime, caches the current leaf
//! and a validated copy of its slot offsets, and hops across leaf boundaries
//! by re-descending the tree with the departing leaf's `high_key` (forward)
//! or `low_key` (backward). There is no sibling chain to chase.

use {
    super::{
        node::{Node, NodeRef},
        ConcurrentMap, KeyComparator, Snapshot, TreeConfig, ORD_CMP,
    },
    crate::sync::EpochGuard,
    core::ptr,
};

impl<K, V, C> ConcurrentMap<K, V, C>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    fn first_leaf(&self) -> Snapshot<K> {
        self.leaf_by(|inner| unsafe { Self::inner_ref(inner).first_child() })
    }

    fn last_leaf(&self) -> Snapshot<K> {
        self.leaf_by(|inner| unsafe { Self::inner_ref(inner).last_child() })
    }

    fn upper_bound_leaf(&self, cmp: &dyn KeyComparator<K>, key: &K) -> Snapshot<K> {
        self.leaf_by(|inner| unsafe {
            let inner = Self::inner_ref(inner);
            let num_values = inner.hdr().num_values();
            inner.child(inner.upper_bound_pos(cmp, key, num_values))
        })
    }

    fn prev_leaf_containing(&self, cmp: &dyn KeyComparator<K>, key: &K) -> Snapshot<K> {
        self.leaf_by(|inner| unsafe { Self::inner_ref(inner).child_below_key(cmp, key) })
    }

    /// the leaf holding the first entry `>= key`, with its slots copied out;
    /// null when no such entry exists
    fn next_leaf_from(
        &self,
        cmp: &dyn KeyComparator<K>,
        from: K,
        slots: &mut Vec<u32>,
    ) -> *mut Node<K> {
        let mut key = from;
        loop {
            let snapshot = self.leaf_for_key(cmp, &key);
            if snapshot.node.is_null() {
                return ptr::null_mut();
            }
            let leaf = Self::leaf_ref(snapshot.node);
            unsafe {
                leaf.collect_slots_from(cmp, &key, true, slots);
            }
            if self.is_snapshot_stale(&snapshot) {
                continue;
            }
            if slots.is_empty() {
                match unsafe { leaf.hdr().highkey() } {
                    Some(highkey) => {
                        key = highkey;
                        continue;
                    }
                    None => return ptr::null_mut(),
                }
            }
            return snapshot.node;
        }
    }

    /// the leaf holding the last entry `< key`; null when none exists
    fn prev_leaf_from(
        &self,
        cmp: &dyn KeyComparator<K>,
        from: K,
        slots: &mut Vec<u32>,
    ) -> *mut Node<K> {
        let mut key = from;
        loop {
            let snapshot = self.prev_leaf_containing(cmp, &key);
            if snapshot.node.is_null() {
                return ptr::null_mut();
            }
            let leaf = Self::leaf_ref(snapshot.node);
            unsafe {
                leaf.collect_slots_below(cmp, &key, slots);
            }
            if self.is_snapshot_stale(&snapshot) {
                continue;
            }
            if slots.is_empty() {
                match unsafe { leaf.hdr().lowkey() } {
                    Some(lowkey) => {
                        key = lowkey;
                        continue;
                    }
                    None => return ptr::null_mut(),
                }
            }
            return snapshot.node;
        }
    }

    pub fn iter_with<'a>(&'a self, cmp: &'a dyn KeyComparator<K>) -> Iter<'a, K, V, C, false> {
        let guard = self.gc.pin();
        let mut slots = Vec::new();
        let mut leaf;
        loop {
            let snapshot = self.first_leaf();
            leaf = snapshot.node;
            if leaf.is_null() {
                break;
            }
            unsafe {
                Self::leaf_ref(leaf).collect_slots(&mut slots);
            }
            if !self.is_snapshot_stale(&snapshot) {
                break;
            }
        }
        if !leaf.is_null() && slots.is_empty() {
            leaf = match unsafe { (*leaf).highkey() } {
                Some(highkey) => self.next_leaf_from(cmp, highkey, &mut slots),
                None => ptr::null_mut(),
            };
        }
        Iter::new(self, cmp, guard, leaf, slots, 0)
    }

    pub fn iter_rev_with<'a>(&'a self, cmp: &'a dyn KeyComparator<K>) -> Iter<'a, K, V, C, true> {
        let guard = self.gc.pin();
        let mut slots = Vec::new();
        let mut leaf;
        loop {
            let snapshot = self.last_leaf();
            leaf = snapshot.node;
            if leaf.is_null() {
                break;
            }
            unsafe {
                Self::leaf_ref(leaf).collect_slots(&mut slots);
            }
            if !self.is_snapshot_stale(&snapshot) {
                break;
            }
        }
        if !leaf.is_null() && slots.is_empty() {
            leaf = match unsafe { (*leaf).lowkey() } {
                Some(lowkey) => self.prev_leaf_from(cmp, lowkey, &mut slots),
                None => ptr::null_mut(),
            };
        }
        let pos = if leaf.is_null() {
            0
        } else {
            slots.len() as isize - 1
        };
        Iter::new(self, cmp, guard, leaf, slots, pos)
    }

    /// iterate from the first entry `>= key`
    pub fn lower_bound_with<'a>(
        &'a self,
        key: &K,
        cmp: &'a dyn KeyComparator<K>,
    ) -> Iter<'a, K, V, C, false> {
        let guard = self.gc.pin();
        let mut slots = Vec::new();
        let leaf = self.next_leaf_from(cmp, *key, &mut slots);
        Iter::new(self, cmp, guard, leaf, slots, 0)
    }

    /// iterate from the first entry `> key`
    pub fn upper_bound_with<'a>(
        &'a self,
        key: &K,
        cmp: &'a dyn KeyComparator<K>,
    ) -> Iter<'a, K, V, C, false> {
        let guard = self.gc.pin();
        let mut slots = Vec::new();
        let mut leaf;
        loop {
            let snapshot = self.upper_bound_leaf(cmp, key);
            leaf = snapshot.node;
            if leaf.is_null() {
                break;
            }
            unsafe {
                Self::leaf_ref(leaf).collect_slots_from(cmp, key, false, &mut slots);
            }
            if !self.is_snapshot_stale(&snapshot) {
                break;
            }
        }
        if !leaf.is_null() && slots.is_empty() {
            leaf = match unsafe { (*leaf).highkey() } {
                Some(highkey) => self.next_leaf_from(cmp, highkey, &mut slots),
                None => ptr::null_mut(),
            };
        }
        Iter::new(self, cmp, guard, leaf, slots, 0)
    }
}

impl<K, V, C> ConcurrentMap<K, V, C>
where
    K: Copy + Ord,
    V: Copy,
    C: TreeConfig,
{
    /// ascending iteration over `(key, value)` copies
    pub fn iter(&self) -> Iter<'_, K, V, C, false> {
        self.iter_with(&ORD_CMP)
    }

    /// descending iteration
    pub fn iter_rev(&self) -> Iter<'_, K, V, C, true> {
        self.iter_rev_with(&ORD_CMP)
    }

    pub fn lower_bound(&self, key: &K) -> Iter<'_, K, V, C, false> {
        self.lower_bound_with(key, &ORD_CMP)
    }

    pub fn upper_bound(&self, key: &K) -> Iter<'_, K, V, C, false> {
        self.upper_bound_with(key, &ORD_CMP)
    }
}

/// A one-direction cursor yielding `(K, V)` copies. Holds an epoch guard for
/// its lifetime, so drop iterators promptly on write-heavy maps: a live
/// iterator pins every node retired after it started.
pub struct Iter<'a, K, V, C, const REVERSE: bool>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    map: &'a ConcurrentMap<K, V, C>,
    cmp: &'a dyn KeyComparator<K>,
    _guard: EpochGuard<'a, Node<K>>,
    leaf: *mut Node<K>,
    slots: Vec<u32>,
    pos: isize,
}

impl<'a, K, V, C, const REVERSE: bool> Iter<'a, K, V, C, REVERSE>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    fn new(
        map: &'a ConcurrentMap<K, V, C>,
        cmp: &'a dyn KeyComparator<K>,
        guard: EpochGuard<'a, Node<K>>,
        leaf: *mut Node<K>,
        slots: Vec<u32>,
        pos: isize,
    ) -> Self {
        Self {
            map,
            cmp,
            _guard: guard,
            leaf,
            slots,
            pos,
        }
    }

    fn advance(&mut self) {
        if REVERSE {
            self.pos -= 1;
            if self.pos >= 0 {
                return;
            }
            match unsafe { (*self.leaf).lowkey() } {
                Some(lowkey) => {
                    self.leaf = self.map.prev_leaf_from(self.cmp, lowkey, &mut self.slots);
                    self.pos = if self.leaf.is_null() {
                        0
                    } else {
                        self.slots.len() as isize - 1
                    };
                }
                None => self.exhaust(),
            }
        } else {
            self.pos += 1;
            if self.pos < self.slots.len() as isize {
                return;
            }
            match unsafe { (*self.leaf).highkey() } {
                Some(highkey) => {
                    self.leaf = self.map.next_leaf_from(self.cmp, highkey, &mut self.slots);
                    self.pos = 0;
                }
                None => self.exhaust(),
            }
        }
    }

    fn exhaust(&mut self) {
        self.leaf = ptr::null_mut();
        self.pos = 0;
        self.slots.clear();
    }
}

impl<K, V, C, const REVERSE: bool> Iterator for Iter<'_, K, V, C, REVERSE>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.leaf.is_null() {
            return None;
        }
        let item = unsafe {
            // UNSAFE: the guard pins the leaf; offsets were validated when
            // copied
            let leaf: NodeRef<K, V, C> = NodeRef::from_raw(self.leaf);
            let record = leaf.record_at(self.slots[self.pos as usize]);
            ((*record).key, (*record).val)
        };
        self.advance();
        Some(item)
    }
}
