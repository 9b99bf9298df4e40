/*
 * Created on Mon Apr 15 2024
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

//! Slotted tree pages.
//!
//! A node is one contiguous page: header, then a slot array of 32-bit record
//! offsets growing from the front, then a record heap growing back from the
//! page end. Records are never moved while a node is live; deletion only
//! drops the slot, so concurrent optimistic readers chasing stale slots still
//! land on validly-typed bytes. `max_slot_offset` tracks the slot array's
//! high watermark for exactly that reason: the heap must never grow below it.
//!
//! Inner nodes hold child pointers as their record payload; slot 0 is the
//! "negative infinity" child and carries no key.

use {
    super::TreeConfig,
    crate::sync::{Mutex, ORD_ACQ, ORD_REL, ORD_RLX, ORD_SEQ},
    core::{
        alloc::Layout,
        marker::PhantomData,
        mem::{align_of, offset_of, size_of},
        ptr,
        sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8},
    },
    std::alloc::{alloc_zeroed, dealloc, handle_alloc_error},
};

pub(super) const MAX_HEIGHT: usize = 32;

const LOCKED_BIT: u64 = 1 << 62;
const DELETED_BIT: u64 = 1 << 63;
const FLAG_MASK: u64 = LOCKED_BIT | DELETED_BIT;

/// 62-bit version plus locked/deleted flag bits; any structural change is
/// observable as a version increment, `deleted` is sticky
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(super) struct NodeState(u64);

impl NodeState {
    #[inline(always)]
    pub const fn empty() -> Self {
        Self(0)
    }
    #[inline(always)]
    pub const fn bits(self) -> u64 {
        self.0
    }
    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
    #[inline(always)]
    pub fn version(self) -> u64 {
        self.0 & !FLAG_MASK
    }
    #[inline(always)]
    pub fn is_locked(self) -> bool {
        self.0 & LOCKED_BIT != 0
    }
    #[inline(always)]
    pub fn is_deleted(self) -> bool {
        self.0 & DELETED_BIT != 0
    }
    #[inline(always)]
    pub fn set_locked(self) -> Self {
        Self(self.0 | LOCKED_BIT)
    }
    #[inline(always)]
    pub fn reset_locked(self) -> Self {
        Self(self.0 & !LOCKED_BIT)
    }
    #[inline(always)]
    pub fn set_deleted(self) -> Self {
        Self(self.0 | DELETED_BIT)
    }
    #[inline(always)]
    pub fn increment_version(self) -> Self {
        Self((self.0 & FLAG_MASK) | (self.version() + 1))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(super) enum NodeType {
    Leaf,
    Inner,
}

/// page header; the slot array begins right after it
#[repr(C)]
pub(super) struct Node<K> {
    state: AtomicU64,
    num_values: AtomicU32,
    /// bytes of live records + slots; drives the underfull test
    logical_pagesize: AtomicU32,
    next_slot_offset: AtomicU32,
    /// high watermark of the slot array; the record heap must stay above it
    max_slot_offset: AtomicU32,
    last_value_offset: AtomicU32,
    /// saturates at 2: "more than one" is all the trim test needs
    num_dead_values: AtomicU8,
    node_type: NodeType,
    height: u8,
    pub(super) mutex: Mutex,
    lowkey: Option<K>,
    highkey: Option<K>,
}

impl<K: Copy> Node<K> {
    #[inline(always)]
    pub fn state(&self) -> NodeState {
        NodeState(self.state.load(ORD_SEQ))
    }
    #[inline(always)]
    pub fn set_state(&self, s: NodeState) {
        self.state.store(s.bits(), ORD_SEQ);
    }
    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }
    #[inline(always)]
    pub fn is_inner(&self) -> bool {
        self.node_type == NodeType::Inner
    }
    #[inline(always)]
    pub fn num_values(&self) -> usize {
        self.num_values.load(ORD_ACQ) as usize
    }
    #[inline(always)]
    pub fn height(&self) -> usize {
        self.height as usize
    }
    #[inline(always)]
    pub fn lowkey(&self) -> Option<K> {
        self.lowkey
    }
    #[inline(always)]
    pub fn highkey(&self) -> Option<K> {
        self.highkey
    }
    #[inline(always)]
    pub fn can_trim(&self) -> bool {
        self.num_dead_values.load(ORD_RLX) > 1
    }
    #[inline(always)]
    pub fn can_split(&self) -> bool {
        self.num_values() > 2
    }
    fn bump_dead_values(&self) {
        let dead = self.num_dead_values.load(ORD_RLX);
        self.num_dead_values
            .store(if dead > 1 { dead } else { dead + 1 }, ORD_RLX);
    }
    pub fn is_underfull<C: TreeConfig>(&self) -> bool {
        debug_assert!(self.logical_pagesize.load(ORD_RLX) as usize <= C::NODE_SIZE);
        (self.logical_pagesize.load(ORD_RLX) as usize * 100) / C::NODE_SIZE < C::MERGE_THRESHOLD
    }
    /// run `mutate` with the locked bit raised, then publish a new version.
    /// The node mutex must be held.
    pub fn atomic_update(&self, mutate: impl FnOnce()) {
        self.set_state(self.state().set_locked());
        mutate();
        self.set_state(self.state().reset_locked().increment_version());
    }
}

/// a slotted record; inner nodes store `T = *mut Node<K>`
#[repr(C)]
pub(super) struct Record<K, T> {
    pub key: K,
    pub val: T,
}

const fn cmax(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Typed view over a raw page. `T` is the record payload this view reads and
/// writes: the map only ever constructs leaf views (`T = V`) over leaves and
/// inner views (`T = *mut Node<K>`) over inner nodes.
pub(super) struct NodeRef<K, T, C> {
    node: *mut Node<K>,
    _m: PhantomData<(T, C)>,
}

impl<K, T, C> Clone for NodeRef<K, T, C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K, T, C> Copy for NodeRef<K, T, C> {}

pub(super) type InnerRef<K, C> = NodeRef<K, *mut Node<K>, C>;

impl<K: Copy, T: Copy, C: TreeConfig> NodeRef<K, T, C> {
    const SLOT_SIZE: usize = size_of::<u32>();
    const RECORD_SIZE: usize = size_of::<Record<K, T>>();
    const HEADER_SIZE: usize = size_of::<Node<K>>();
    const PAGE_ALIGN: usize = cmax(align_of::<Node<K>>(), align_of::<Record<K, T>>());
    const _GEOMETRY: () = {
        assert!(
            (C::NODE_SIZE - size_of::<Node<K>>()) / (size_of::<Record<K, T>>() + size_of::<u32>())
                >= 4,
            "a node must hold at least 4 records at the configured page size"
        );
        assert!(
            C::NODE_SIZE % align_of::<Record<K, T>>() == 0,
            "page size must be a multiple of the record alignment"
        );
        assert!(C::NODE_SIZE <= u32::MAX as usize);
    };

    #[inline(always)]
    pub fn from_raw(node: *mut Node<K>) -> Self {
        Self {
            node,
            _m: PhantomData,
        }
    }

    #[inline(always)]
    pub fn raw(self) -> *mut Node<K> {
        self.node
    }

    #[inline(always)]
    pub unsafe fn hdr<'a>(self) -> &'a Node<K> {
        &*self.node
    }

    fn layout() -> Layout {
        let _ = Self::_GEOMETRY;
        Layout::from_size_align(C::NODE_SIZE, Self::PAGE_ALIGN).unwrap()
    }

    pub fn alloc(
        node_type: NodeType,
        lowkey: Option<K>,
        highkey: Option<K>,
        height: usize,
    ) -> Self {
        unsafe {
            // UNSAFE: fresh page; the header is written before anything can
            // observe the node
            let page = alloc_zeroed(Self::layout());
            if page.is_null() {
                handle_alloc_error(Self::layout());
            }
            let node = page as *mut Node<K>;
            node.write(Node {
                state: AtomicU64::new(0),
                num_values: AtomicU32::new(0),
                logical_pagesize: AtomicU32::new(0),
                next_slot_offset: AtomicU32::new(Self::HEADER_SIZE as u32),
                max_slot_offset: AtomicU32::new(0),
                last_value_offset: AtomicU32::new(C::NODE_SIZE as u32),
                num_dead_values: AtomicU8::new(0),
                node_type,
                height: height as u8,
                mutex: Mutex::new(),
                lowkey,
                highkey,
            });
            Self::from_raw(node)
        }
    }

    /// release the page. The caller owns the node (unpublished, or past its
    /// reclamation epoch).
    pub unsafe fn dealloc(node: *mut Node<K>) {
        ptr::drop_in_place(node);
        dealloc(node as *mut u8, Self::layout());
    }

    // ---- raw layout access ----

    #[inline(always)]
    unsafe fn page(self) -> *mut u8 {
        self.node as *mut u8
    }

    #[inline(always)]
    unsafe fn slots(self) -> *const AtomicU32 {
        self.page().add(Self::HEADER_SIZE) as *const AtomicU32
    }

    #[inline(always)]
    pub unsafe fn slot_offset(self, pos: usize) -> u32 {
        (*self.slots().add(pos)).load(ORD_ACQ)
    }

    #[inline(always)]
    pub unsafe fn record_at(self, offset: u32) -> *mut Record<K, T> {
        self.page().add(offset as usize) as *mut Record<K, T>
    }

    #[inline(always)]
    pub unsafe fn record(self, pos: usize) -> *mut Record<K, T> {
        self.record_at(self.slot_offset(pos))
    }

    #[inline(always)]
    pub unsafe fn key(self, pos: usize) -> K {
        (*self.record(pos)).key
    }

    #[inline(always)]
    fn first_slot(self) -> usize {
        unsafe {
            if self.hdr().is_leaf() {
                0
            } else {
                1
            }
        }
    }

    // ---- space accounting ----

    /// both the free gap and the slot-array watermark must clear the next
    /// record; the node mutex must be held
    pub unsafe fn have_enough_space(self) -> bool {
        let h = self.hdr();
        let next_slot_offset = h.next_slot_offset.load(ORD_RLX) as i64;
        let max_slot_offset = h.max_slot_offset.load(ORD_RLX) as i64;
        let last_value_offset = h.last_value_offset.load(ORD_RLX) as i64;
        let record = Self::RECORD_SIZE as i64;
        let slot = Self::SLOT_SIZE as i64;

        next_slot_offset + slot <= last_value_offset - record
            && max_slot_offset <= last_value_offset - record
    }

    pub unsafe fn can_merge_with(self, other: Self) -> bool {
        let this = self.hdr().logical_pagesize.load(ORD_RLX) as usize;
        let that = other.hdr().logical_pagesize.load(ORD_RLX) as usize;
        let separator = if self.hdr().is_inner() {
            Self::RECORD_SIZE
        } else {
            0
        };
        this + that + separator + Self::HEADER_SIZE <= C::NODE_SIZE
    }

    unsafe fn update_meta_after_insert(self) {
        let h = self.hdr();
        let next_slot_offset = h.next_slot_offset.load(ORD_RLX) + Self::SLOT_SIZE as u32;
        let logical_pagesize = h.logical_pagesize.load(ORD_RLX)
            + (Self::RECORD_SIZE + Self::SLOT_SIZE) as u32;
        let max_slot_offset = h.max_slot_offset.load(ORD_RLX).max(next_slot_offset);

        h.last_value_offset.store(
            h.last_value_offset.load(ORD_RLX) - Self::RECORD_SIZE as u32,
            ORD_RLX,
        );
        h.next_slot_offset.store(next_slot_offset, ORD_RLX);
        h.logical_pagesize.store(logical_pagesize, ORD_RLX);
        h.max_slot_offset.store(max_slot_offset, ORD_RLX);

        debug_assert!(next_slot_offset <= h.last_value_offset.load(ORD_RLX));
    }

    // ---- slot shuffling (node mutex held, inside atomic_update) ----

    unsafe fn copy_slots_backward(self, start_pos: usize, end_pos: usize, out_end_pos: usize) {
        debug_assert!(out_end_pos >= end_pos);
        let slots = self.slots();
        let (mut end, mut out) = (end_pos, out_end_pos);
        while start_pos < end {
            end -= 1;
            out -= 1;
            (*slots.add(out)).store((*slots.add(end)).load(ORD_RLX), ORD_REL);
        }
    }

    unsafe fn copy_slots(self, start_pos: usize, end_pos: usize, out_pos: usize) {
        debug_assert!(out_pos < start_pos);
        let slots = self.slots();
        let (mut start, mut out) = (start_pos, out_pos);
        while start < end_pos {
            (*slots.add(out)).store((*slots.add(start)).load(ORD_RLX), ORD_REL);
            out += 1;
            start += 1;
        }
    }

    pub unsafe fn insert_into_slot(self, pos: usize, value_offset: u32) {
        let h = self.hdr();
        let num_values = h.num_values.load(ORD_RLX) as usize;
        self.copy_slots_backward(pos, num_values, num_values + 1);
        (*self.slots().add(pos)).store(value_offset, ORD_REL);
        h.num_values.store(num_values as u32 + 1, ORD_REL);
    }

    // ---- record construction ----

    /// append onto an unpublished node
    pub unsafe fn append(self, key: K, val: T) {
        let h = self.hdr();
        let offset = h.last_value_offset.load(ORD_RLX) - Self::RECORD_SIZE as u32;
        let pos = h.num_values.load(ORD_RLX);

        self.record_at(offset).write(Record { key, val });
        (*self.slots().add(pos as usize)).store(offset, ORD_RLX);
        h.num_values.store(pos + 1, ORD_RLX);
        self.update_meta_after_insert();
    }

    /// write a record and splice its slot in at `pos`; the node mutex must
    /// be held. Fails only for want of space.
    pub unsafe fn insert_record_at(self, key: K, val: T, pos: usize) -> bool {
        if !self.have_enough_space() {
            return false;
        }
        let offset = self.hdr().last_value_offset.load(ORD_RLX) - Self::RECORD_SIZE as u32;
        self.record_at(offset).write(Record { key, val });
        self.hdr().atomic_update(|| unsafe {
            self.insert_into_slot(pos, offset);
        });
        self.update_meta_after_insert();
        true
    }

    /// drop the slot at `pos`; the record stays behind as a dead heap entry.
    /// The node mutex must be held.
    pub unsafe fn remove_pos(self, pos: usize) {
        let h = self.hdr();
        h.atomic_update(|| unsafe {
            let num_values = h.num_values.load(ORD_RLX) as usize;
            self.copy_slots(pos + 1, num_values, pos);
            h.num_values.store(num_values as u32 - 1, ORD_REL);
        });
        h.next_slot_offset.store(
            h.next_slot_offset.load(ORD_RLX) - Self::SLOT_SIZE as u32,
            ORD_RLX,
        );
        h.logical_pagesize.store(
            h.logical_pagesize.load(ORD_RLX) - (Self::RECORD_SIZE + Self::SLOT_SIZE) as u32,
            ORD_RLX,
        );
        h.bump_dead_values();
    }

    unsafe fn copy_from(self, src: Self, start_pos: usize, end_pos: usize) {
        for pos in start_pos..end_pos {
            let record = src.record(pos);
            self.append((*record).key, (*record).val);
        }
    }

    // ---- search ----

    pub unsafe fn lower_bound_pos(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
        num_values: usize,
    ) -> usize {
        let mut lo = self.first_slot();
        let mut hi = num_values;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.less(&self.key(mid), key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub unsafe fn upper_bound_pos(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
        num_values: usize,
    ) -> usize {
        let mut lo = self.first_slot();
        let mut hi = num_values;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.less(key, &self.key(mid)) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if self.hdr().is_inner() {
            lo.saturating_sub(1).min(num_values - 1)
        } else {
            lo
        }
    }

    pub unsafe fn lower_bound(self, cmp: &dyn super::KeyComparator<K>, key: &K) -> (usize, bool) {
        let num_values = self.hdr().num_values();
        let pos = self.lower_bound_pos(cmp, key, num_values);
        let present = pos < num_values && cmp.equal(&self.key(pos), key);
        (pos, present)
    }

    // ---- SMO building blocks (node mutex held) ----

    pub unsafe fn trim_leaf(self) -> Self {
        debug_assert!(self.hdr().is_leaf());
        let fresh = Self::alloc(
            NodeType::Leaf,
            self.hdr().lowkey,
            self.hdr().highkey,
            self.hdr().height(),
        );
        fresh.copy_from(self, 0, self.hdr().num_values());
        fresh
    }

    pub unsafe fn split_leaf(self) -> SplitInfo<K> {
        debug_assert!(self.hdr().is_leaf() && self.hdr().can_split());
        let num_values = self.hdr().num_values();
        let split_pos = (num_values + 1) / 2;
        let split_key = self.key(split_pos);
        let left = Self::alloc(
            NodeType::Leaf,
            self.hdr().lowkey,
            Some(split_key),
            self.hdr().height(),
        );
        let right = Self::alloc(
            NodeType::Leaf,
            Some(split_key),
            self.hdr().highkey,
            self.hdr().height(),
        );
        left.copy_from(self, 0, split_pos);
        right.copy_from(self, split_pos, num_values);
        SplitInfo {
            left: left.raw(),
            right: right.raw(),
            split_key: Some(split_key),
        }
    }

    pub unsafe fn merge_leaf(self, right: Self) -> Option<Self> {
        debug_assert!(self.hdr().is_leaf());
        if !self.can_merge_with(right) {
            return None;
        }
        let merged = Self::alloc(
            NodeType::Leaf,
            self.hdr().lowkey,
            right.hdr().highkey,
            self.hdr().height(),
        );
        merged.copy_from(self, 0, self.hdr().num_values());
        merged.copy_from(right, 0, right.hdr().num_values());
        Some(merged)
    }

    /// copy out the live slot offsets (reader side; validated afterwards)
    pub unsafe fn collect_slots(self, out: &mut Vec<u32>) {
        out.clear();
        let num_values = self.hdr().num_values();
        for pos in 0..num_values {
            out.push(self.slot_offset(pos));
        }
    }

    pub unsafe fn collect_slots_from(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
        inclusive: bool,
        out: &mut Vec<u32>,
    ) {
        out.clear();
        let num_values = self.hdr().num_values();
        let pos = if inclusive {
            self.lower_bound_pos(cmp, key, num_values)
        } else {
            self.upper_bound_pos(cmp, key, num_values)
        };
        for p in pos..num_values {
            out.push(self.slot_offset(p));
        }
    }

    pub unsafe fn collect_slots_below(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
        out: &mut Vec<u32>,
    ) {
        out.clear();
        let (pos, found) = self.lower_bound(cmp, key);
        let end = if found { pos.saturating_sub(1) } else { pos };
        for p in 0..end {
            out.push(self.slot_offset(p));
        }
    }
}

/// the two fresh halves and their separator; empty when an SMO step failed
/// before allocating
#[derive(Clone, Copy)]
pub(super) struct SplitInfo<K> {
    pub left: *mut Node<K>,
    pub right: *mut Node<K>,
    pub split_key: Option<K>,
}

impl<K> SplitInfo<K> {
    pub fn empty() -> Self {
        Self {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            split_key: None,
        }
    }
}

// ---- inner-node specifics ----

impl<K: Copy, C: TreeConfig> InnerRef<K, C> {
    /// the child-pointer cell for a slot. Slot 0 stores a bare pointer (no
    /// key); every other slot points at a full record.
    #[inline]
    pub unsafe fn child_cell(self, pos: usize) -> *const AtomicPtr<Node<K>> {
        let offset = self.slot_offset(pos);
        if pos == 0 {
            self.page().add(offset as usize) as *const AtomicPtr<Node<K>>
        } else {
            self.page()
                .add(offset as usize + offset_of!(Record<K, *mut Node<K>>, val))
                as *const AtomicPtr<Node<K>>
        }
    }

    #[inline]
    pub unsafe fn child(self, pos: usize) -> *mut Node<K> {
        (*self.child_cell(pos)).load(ORD_ACQ)
    }

    #[inline]
    pub unsafe fn first_child(self) -> *mut Node<K> {
        self.child(0)
    }

    #[inline]
    pub unsafe fn last_child(self) -> *mut Node<K> {
        self.child(self.hdr().num_values() - 1)
    }

    /// install the leftmost (keyless) child on an unpublished node
    pub unsafe fn insert_neg_infinity(self, child: *mut Node<K>) {
        let h = self.hdr();
        debug_assert!(h.is_inner() && h.num_values() == 0);
        let offset =
            h.last_value_offset.load(ORD_RLX) - size_of::<*mut Node<K>>() as u32;
        (self.page().add(offset as usize) as *mut *mut Node<K>).write(child);
        (*self.slots()).store(offset, ORD_RLX);
        h.num_values.store(1, ORD_RLX);
        self.update_meta_after_insert();
    }

    /// slot whose child subtree covers `key`
    pub unsafe fn search_inner(self, cmp: &dyn super::KeyComparator<K>, key: &K) -> usize {
        let (pos, present) = self.lower_bound(cmp, key);
        if present {
            pos
        } else {
            pos - 1
        }
    }

    pub unsafe fn child_for_key(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
    ) -> *mut Node<K> {
        self.child(self.search_inner(cmp, key))
    }

    /// child strictly left of `key`'s covering position (reverse iteration)
    pub unsafe fn child_below_key(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
    ) -> *mut Node<K> {
        let pos = self.search_inner(cmp, key);
        if pos == 0 {
            return self.first_child();
        }
        self.child(if cmp.equal(key, &self.key(pos)) {
            pos - 1
        } else {
            pos
        })
    }

    pub unsafe fn trim_inner(self) -> Self {
        debug_assert!(self.hdr().is_inner());
        let fresh = Self::alloc(
            NodeType::Inner,
            self.hdr().lowkey,
            self.hdr().highkey,
            self.hdr().height(),
        );
        fresh.insert_neg_infinity(self.first_child());
        fresh.copy_from(self, 1, self.hdr().num_values());
        fresh
    }

    pub unsafe fn split_inner(self) -> SplitInfo<K> {
        debug_assert!(self.hdr().is_inner() && self.hdr().can_split());
        let num_values = self.hdr().num_values();
        let split_pos = num_values / 2;
        // the separator is promoted into the parent, not kept in a half
        let split_key = self.key(split_pos);
        let left = Self::alloc(
            NodeType::Inner,
            self.hdr().lowkey,
            Some(split_key),
            self.hdr().height(),
        );
        let right = Self::alloc(
            NodeType::Inner,
            Some(split_key),
            self.hdr().highkey,
            self.hdr().height(),
        );
        left.insert_neg_infinity(self.first_child());
        left.copy_from(self, 1, split_pos);
        right.insert_neg_infinity(self.child(split_pos));
        right.copy_from(self, split_pos + 1, num_values);
        SplitInfo {
            left: left.raw(),
            right: right.raw(),
            split_key: Some(split_key),
        }
    }

    pub unsafe fn merge_inner(self, right: Self, merge_key: K) -> Option<Self> {
        debug_assert!(self.hdr().is_inner());
        if !self.can_merge_with(right) {
            return None;
        }
        let merged = Self::alloc(
            NodeType::Inner,
            self.hdr().lowkey,
            right.hdr().highkey,
            self.hdr().height(),
        );
        merged.insert_neg_infinity(self.first_child());
        merged.copy_from(self, 1, self.hdr().num_values());
        merged.append(merge_key, right.first_child());
        merged.copy_from(right, 1, right.hdr().num_values());
        Some(merged)
    }

    /// swap the child covering `key` for `child`; node mutex held
    pub unsafe fn replace_child_for_key(
        self,
        cmp: &dyn super::KeyComparator<K>,
        key: &K,
        child: *mut Node<K>,
    ) {
        let pos = self.search_inner(cmp, key);
        let cell = self.child_cell(pos);
        self.hdr().atomic_update(|| unsafe {
            (*cell).store(child, ORD_REL);
        });
    }

    /// replace the split child with `left` and splice `(split_key, right)`
    /// in just after it; node mutex held. False on overflow.
    pub unsafe fn apply_split(
        self,
        cmp: &dyn super::KeyComparator<K>,
        split: &SplitInfo<K>,
    ) -> bool {
        if !self.have_enough_space() {
            return false;
        }
        let split_key = split.split_key.expect("split without a separator");
        let offset = self.hdr().last_value_offset.load(ORD_RLX)
            - size_of::<Record<K, *mut Node<K>>>() as u32;
        let (split_pos, found) = self.lower_bound(cmp, &split_key);
        debug_assert!(!found);
        let old_child = self.child_cell(split_pos - 1);

        self.record_at(offset).write(Record {
            key: split_key,
            val: split.right,
        });
        self.hdr().atomic_update(|| unsafe {
            (*old_child).store(split.left, ORD_REL);
            self.insert_into_slot(split_pos, offset);
        });
        self.update_meta_after_insert();
        true
    }

    /// drop the merged-away sibling's slot and point the survivor's slot at
    /// the merged node; node mutex held
    pub unsafe fn apply_merge(self, merged_pos: usize, merged_child: *mut Node<K>) {
        let h = self.hdr();
        let deleted_pos = merged_pos + 1;
        let old_child = self.child_cell(merged_pos);
        h.atomic_update(|| unsafe {
            let num_values = h.num_values.load(ORD_RLX) as usize;
            self.copy_slots(deleted_pos + 1, num_values, deleted_pos);
            h.num_values.store(num_values as u32 - 1, ORD_REL);
            (*old_child).store(merged_child, ORD_REL);
        });
        h.bump_dead_values();
        h.next_slot_offset.store(
            h.next_slot_offset.load(ORD_RLX) - Self::SLOT_SIZE as u32,
            ORD_RLX,
        );
        h.logical_pagesize.store(
            h.logical_pagesize.load(ORD_RLX)
                - (Self::RECORD_SIZE + Self::SLOT_SIZE) as u32,
            ORD_RLX,
        );
    }

    /// children for the teardown walk; no locking, owner only
    pub unsafe fn collect_children(self, out: &mut Vec<*mut Node<K>>) {
        out.push(self.first_child());
        for pos in 1..self.hdr().num_values() {
            out.push(self.child(pos));
        }
    }
}
