/*
 * Created on Wed Mar 27 2024
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

//! The five node shapes of the radix tree and the operations that migrate
//! children between them. Everything here expects the node's mutex to be
//! held for mutation; lock-free readers only ever follow the atomic child
//! pointers and the per-node version counter.

use {
    super::RadixKey,
    crate::sync::{Mutex, ORD_ACQ, ORD_REL, ORD_RLX},
    core::{
        cell::UnsafeCell,
        ptr,
        sync::atomic::{AtomicPtr, AtomicU16, AtomicU64, AtomicU8},
    },
};

/// version sentinel: the node is unlinked and owned by the epoch manager
pub(super) const DEAD_VERSION: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(super) enum NodeType {
    Leaf,
    N4,
    N16,
    N48,
    N256,
}

#[repr(C)]
pub(super) struct NodeBase<K> {
    pub node_type: NodeType,
    /// key bytes agreed on by every descendant (path compression depth)
    pub level: u8,
    pub num_children: AtomicU16,
    pub num_deleted: AtomicU16,
    /// the compressed path, packed into a full-width key
    pub key: K,
    /// bumped on every mutation; `DEAD_VERSION` is the tombstone
    pub version: AtomicU64,
    pub m: Mutex,
}

impl<K: RadixKey> NodeBase<K> {
    fn new(node_type: NodeType, key: K, level: u8) -> Self {
        Self {
            node_type,
            level,
            num_children: AtomicU16::new(0),
            num_deleted: AtomicU16::new(0),
            key,
            version: AtomicU64::new(0),
            m: Mutex::new(),
        }
    }

    #[inline(always)]
    pub fn index_of(&self, key: K) -> u8 {
        key.byte_at(self.level as usize)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        (self.num_children.load(ORD_ACQ) - self.num_deleted.load(ORD_ACQ)) as usize
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }

    #[inline(always)]
    pub fn mark_dead(&self) {
        self.version.store(DEAD_VERSION, ORD_REL);
    }

    #[inline(always)]
    pub fn is_dead(&self) -> bool {
        self.version.load(ORD_ACQ) == DEAD_VERSION
    }

    #[inline(always)]
    fn bump_version(&self) {
        self.version
            .store(self.version.load(ORD_ACQ) + 1, ORD_REL);
    }
}

#[repr(C)]
pub(super) struct Leaf<K, V> {
    pub base: NodeBase<K>,
    pub value: UnsafeCell<V>,
}

#[repr(C)]
pub(super) struct Node4<K> {
    pub base: NodeBase<K>,
    keys: [AtomicU8; 4],
    children: [AtomicPtr<NodeBase<K>>; 4],
}

#[repr(C)]
pub(super) struct Node16<K> {
    pub base: NodeBase<K>,
    keys: [AtomicU8; 16],
    children: [AtomicPtr<NodeBase<K>>; 16],
}

#[repr(C)]
pub(super) struct Node48<K> {
    pub base: NodeBase<K>,
    /// byte -> 1-based slot in `children`; 0 is "absent"
    keys: [AtomicU8; 256],
    /// bit (47 - pos) set while slot pos is in use
    freemap: UnsafeCell<u64>,
    children: [AtomicPtr<NodeBase<K>>; 48],
}

#[repr(C)]
pub(super) struct Node256<K> {
    pub base: NodeBase<K>,
    children: [AtomicPtr<NodeBase<K>>; 256],
}

fn null_children<K, const N: usize>() -> [AtomicPtr<NodeBase<K>>; N] {
    core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()))
}

fn zero_keys<const N: usize>() -> [AtomicU8; N] {
    core::array::from_fn(|_| AtomicU8::new(0))
}

pub(super) fn new_leaf<K: RadixKey, V>(key: K, value: V) -> *mut NodeBase<K> {
    Box::into_raw(Box::new(Leaf {
        base: NodeBase::new(NodeType::Leaf, key, K::LEN as u8),
        value: UnsafeCell::new(value),
    })) as *mut NodeBase<K>
}

pub(super) fn new_node4<K: RadixKey>(key: K, level: u8) -> *mut NodeBase<K> {
    Box::into_raw(Box::new(Node4 {
        base: NodeBase::new(NodeType::N4, key, level),
        keys: zero_keys(),
        children: null_children(),
    })) as *mut NodeBase<K>
}

fn new_node16<K: RadixKey>(key: K, level: u8) -> *mut NodeBase<K> {
    Box::into_raw(Box::new(Node16 {
        base: NodeBase::new(NodeType::N16, key, level),
        keys: zero_keys(),
        children: null_children(),
    })) as *mut NodeBase<K>
}

fn new_node48<K: RadixKey>(key: K, level: u8) -> *mut NodeBase<K> {
    Box::into_raw(Box::new(Node48 {
        base: NodeBase::new(NodeType::N48, key, level),
        keys: zero_keys(),
        freemap: UnsafeCell::new(0),
        children: null_children(),
    })) as *mut NodeBase<K>
}

fn new_node256<K: RadixKey>(key: K, level: u8) -> *mut NodeBase<K> {
    Box::into_raw(Box::new(Node256 {
        base: NodeBase::new(NodeType::N256, key, level),
        children: null_children(),
    })) as *mut NodeBase<K>
}

// ---- linear-array helpers shared by N4/N16 ----

fn linear_find_pos<K: RadixKey>(
    keys: &[AtomicU8],
    children: &[AtomicPtr<NodeBase<K>>],
    num_children: usize,
    ind: u8,
) -> Option<usize> {
    (0..num_children)
        .find(|&pos| !children[pos].load(ORD_ACQ).is_null() && keys[pos].load(ORD_ACQ) == ind)
}

fn linear_find<K: RadixKey>(
    keys: &[AtomicU8],
    children: &[AtomicPtr<NodeBase<K>>],
    num_children: usize,
    ind: u8,
) -> *mut NodeBase<K> {
    match linear_find_pos(keys, children, num_children, ind) {
        Some(pos) => children[pos].load(ORD_ACQ),
        None => ptr::null_mut(),
    }
}

fn linear_add<K: RadixKey>(
    keys: &[AtomicU8],
    children: &[AtomicPtr<NodeBase<K>>],
    num_children: &AtomicU16,
    child: *mut NodeBase<K>,
    ind: u8,
) {
    let pos = num_children.load(ORD_ACQ) as usize;
    keys[pos].store(ind, ORD_REL);
    children[pos].store(child, ORD_REL);
    num_children.store(pos as u16 + 1, ORD_REL);
}

fn linear_remove<K: RadixKey>(
    keys: &[AtomicU8],
    children: &[AtomicPtr<NodeBase<K>>],
    num_children: &AtomicU16,
    num_deleted: &AtomicU16,
    ind: u8,
) {
    let pos = linear_find_pos(keys, children, num_children.load(ORD_ACQ) as usize, ind)
        .expect("removing an absent child");
    children[pos].store(ptr::null_mut(), ORD_REL);
    num_deleted.store(num_deleted.load(ORD_ACQ) + 1, ORD_REL);
}

fn linear_update<K: RadixKey>(
    keys: &[AtomicU8],
    children: &[AtomicPtr<NodeBase<K>>],
    num_children: usize,
    child: *mut NodeBase<K>,
    ind: u8,
) -> *mut NodeBase<K> {
    let pos = linear_find_pos(keys, children, num_children, ind).expect("updating an absent child");
    let old = children[pos].load(ORD_RLX);
    children[pos].store(child, ORD_REL);
    old
}

impl<K: RadixKey> Node48<K> {
    const SLOTS: usize = 48;

    // freemap bit for slot pos is (48 - 1 - pos); the allocator always picks
    // the highest free bit, i.e. the smallest free pos
    unsafe fn alloc_pos(&self) -> usize {
        let used = *self.freemap.get();
        let free = !(used | (!0u64 << Self::SLOTS));
        let ind = free.leading_zeros() as usize;
        debug_assert!(ind >= 64 - Self::SLOTS);
        *self.freemap.get() = used | 1 << (63 - ind);
        ind - (64 - Self::SLOTS)
    }

    unsafe fn mark_free(&self, pos: usize) {
        *self.freemap.get() &= !(1 << (Self::SLOTS - 1 - pos));
    }
}

// ---- type-dispatched node operations ----
//
// all of these take raw node pointers: the graph is shared and mutation
// rights come from the node mutex, not from &mut

pub(super) unsafe fn find<K: RadixKey>(node: *const NodeBase<K>, ind: u8) -> *mut NodeBase<K> {
    match (*node).node_type {
        NodeType::N4 => {
            let n = &*(node as *const Node4<K>);
            linear_find(
                &n.keys,
                &n.children,
                n.base.num_children.load(ORD_ACQ) as usize,
                ind,
            )
        }
        NodeType::N16 => {
            let n = &*(node as *const Node16<K>);
            linear_find(
                &n.keys,
                &n.children,
                n.base.num_children.load(ORD_ACQ) as usize,
                ind,
            )
        }
        NodeType::N48 => {
            let n = &*(node as *const Node48<K>);
            match n.keys[ind as usize].load(ORD_ACQ) {
                0 => ptr::null_mut(),
                pos => n.children[pos as usize - 1].load(ORD_ACQ),
            }
        }
        NodeType::N256 => (*(node as *const Node256<K>)).children[ind as usize].load(ORD_ACQ),
        NodeType::Leaf => unreachable!("child lookup on a leaf"),
    }
}

/// add under the node's mutex; false iff the node is full and must expand
pub(super) unsafe fn add<K: RadixKey>(
    node: *mut NodeBase<K>,
    child: *mut NodeBase<K>,
    ind: u8,
) -> bool {
    let added = match (*node).node_type {
        NodeType::N4 => {
            let n = &*(node as *const Node4<K>);
            let num = n.base.num_children.load(ORD_ACQ) as usize;
            if num < 4 {
                linear_add(&n.keys, &n.children, &n.base.num_children, child, ind);
                true
            } else {
                false
            }
        }
        NodeType::N16 => {
            let n = &*(node as *const Node16<K>);
            let num = n.base.num_children.load(ORD_ACQ) as usize;
            if num < 16 {
                linear_add(&n.keys, &n.children, &n.base.num_children, child, ind);
                true
            } else {
                false
            }
        }
        NodeType::N48 => {
            let n = &*(node as *const Node48<K>);
            let num = n.base.num_children.load(ORD_ACQ);
            if (num as usize) < Node48::<K>::SLOTS {
                let pos = n.alloc_pos();
                n.children[pos].store(child, ORD_REL);
                n.keys[ind as usize].store(pos as u8 + 1, ORD_REL);
                n.base.num_children.store(num + 1, ORD_REL);
                true
            } else {
                false
            }
        }
        NodeType::N256 => {
            let n = &*(node as *const Node256<K>);
            debug_assert!(n.children[ind as usize].load(ORD_RLX).is_null());
            n.children[ind as usize].store(child, ORD_REL);
            n.base
                .num_children
                .store(n.base.num_children.load(ORD_ACQ) + 1, ORD_REL);
            true
        }
        NodeType::Leaf => unreachable!("child add on a leaf"),
    };
    if added {
        (*node).bump_version();
    }
    added
}

#[inline]
pub(super) unsafe fn add_child<K: RadixKey>(
    node: *mut NodeBase<K>,
    child: *mut NodeBase<K>,
) -> bool {
    add(node, child, (*node).index_of((*child).key))
}

/// swap the child registered under `child.key`'s byte; returns the old child
pub(super) unsafe fn update_child<K: RadixKey>(
    node: *mut NodeBase<K>,
    child: *mut NodeBase<K>,
) -> *mut NodeBase<K> {
    let ind = (*node).index_of((*child).key);
    let old = match (*node).node_type {
        NodeType::N4 => {
            let n = &*(node as *const Node4<K>);
            linear_update(
                &n.keys,
                &n.children,
                n.base.num_children.load(ORD_ACQ) as usize,
                child,
                ind,
            )
        }
        NodeType::N16 => {
            let n = &*(node as *const Node16<K>);
            linear_update(
                &n.keys,
                &n.children,
                n.base.num_children.load(ORD_ACQ) as usize,
                child,
                ind,
            )
        }
        NodeType::N48 => {
            let n = &*(node as *const Node48<K>);
            let pos = n.keys[ind as usize].load(ORD_ACQ);
            debug_assert_ne!(pos, 0);
            let slot = &n.children[pos as usize - 1];
            let old = slot.load(ORD_RLX);
            slot.store(child, ORD_REL);
            old
        }
        NodeType::N256 => {
            let slot = &(*(node as *const Node256<K>)).children[ind as usize];
            let old = slot.load(ORD_RLX);
            slot.store(child, ORD_REL);
            old
        }
        NodeType::Leaf => unreachable!("child update on a leaf"),
    };
    (*node).bump_version();
    old
}

pub(super) unsafe fn remove_child<K: RadixKey>(node: *mut NodeBase<K>, key: K) {
    let ind = (*node).index_of(key);
    match (*node).node_type {
        NodeType::N4 => {
            let n = &*(node as *const Node4<K>);
            linear_remove(
                &n.keys,
                &n.children,
                &n.base.num_children,
                &n.base.num_deleted,
                ind,
            );
        }
        NodeType::N16 => {
            let n = &*(node as *const Node16<K>);
            linear_remove(
                &n.keys,
                &n.children,
                &n.base.num_children,
                &n.base.num_deleted,
                ind,
            );
        }
        NodeType::N48 => {
            let n = &*(node as *const Node48<K>);
            let pos = n.keys[ind as usize].load(ORD_ACQ);
            debug_assert_ne!(pos, 0);
            n.children[pos as usize - 1].store(ptr::null_mut(), ORD_REL);
            n.keys[ind as usize].store(0, ORD_REL);
            n.mark_free(pos as usize - 1);
            n.base
                .num_children
                .store(n.base.num_children.load(ORD_ACQ) - 1, ORD_REL);
        }
        NodeType::N256 => {
            let n = &*(node as *const Node256<K>);
            n.children[ind as usize].store(ptr::null_mut(), ORD_REL);
            n.base
                .num_children
                .store(n.base.num_children.load(ORD_ACQ) - 1, ORD_REL);
        }
        NodeType::Leaf => unreachable!("child removal on a leaf"),
    }
    (*node).bump_version();
}

/// visit every live child in index order
pub(super) unsafe fn for_each_child<K: RadixKey>(
    node: *const NodeBase<K>,
    mut f: impl FnMut(u8, *mut NodeBase<K>),
) {
    match (*node).node_type {
        NodeType::N4 => {
            let n = &*(node as *const Node4<K>);
            for pos in 0..n.base.num_children.load(ORD_ACQ) as usize {
                let child = n.children[pos].load(ORD_ACQ);
                if !child.is_null() {
                    f(n.keys[pos].load(ORD_ACQ), child);
                }
            }
        }
        NodeType::N16 => {
            let n = &*(node as *const Node16<K>);
            for pos in 0..n.base.num_children.load(ORD_ACQ) as usize {
                let child = n.children[pos].load(ORD_ACQ);
                if !child.is_null() {
                    f(n.keys[pos].load(ORD_ACQ), child);
                }
            }
        }
        NodeType::N48 => {
            let n = &*(node as *const Node48<K>);
            for ind in 0..256usize {
                let pos = n.keys[ind].load(ORD_ACQ);
                if pos != 0 {
                    f(ind as u8, n.children[pos as usize - 1].load(ORD_ACQ));
                }
            }
        }
        NodeType::N256 => {
            let n = &*(node as *const Node256<K>);
            for ind in 0..256usize {
                let child = n.children[ind].load(ORD_ACQ);
                if !child.is_null() {
                    f(ind as u8, child);
                }
            }
        }
        NodeType::Leaf => {}
    }
}

/// Copy into the next (or, when dead slots can be compacted away, the same)
/// arity. Caller holds the node's mutex; the copy is private until installed.
pub(super) unsafe fn expand<K: RadixKey>(node: *const NodeBase<K>) -> *mut NodeBase<K> {
    let base = &*node;
    let bigger = match base.node_type {
        NodeType::N4 if base.num_deleted.load(ORD_ACQ) != 0 => new_node4(base.key, base.level),
        NodeType::N4 => new_node16(base.key, base.level),
        NodeType::N16 if base.num_deleted.load(ORD_ACQ) != 0 => new_node16(base.key, base.level),
        NodeType::N16 => new_node48(base.key, base.level),
        NodeType::N48 => new_node256(base.key, base.level),
        NodeType::N256 | NodeType::Leaf => unreachable!("expand on {:?}", base.node_type),
    };
    for_each_child(node, |ind, child| {
        let ok = unsafe { add(bigger, child, ind) };
        debug_assert!(ok);
    });
    bigger
}

pub(super) unsafe fn is_underfull<K: RadixKey>(node: *const NodeBase<K>) -> bool {
    let size = (*node).size();
    match (*node).node_type {
        NodeType::N4 => size <= 1,
        NodeType::N16 => size <= 4,
        NodeType::N48 => size <= 16,
        NodeType::N256 => size <= 48,
        NodeType::Leaf => false,
    }
}

/// The shrunken replacement: for an N4 this is its single surviving child
/// (handed back as-is, not a copy); for larger shapes a fresh smaller node.
pub(super) unsafe fn shrink<K: RadixKey>(node: *const NodeBase<K>) -> *mut NodeBase<K> {
    let base = &*node;
    match base.node_type {
        NodeType::N4 => {
            debug_assert_eq!(base.size(), 1);
            let mut only = ptr::null_mut();
            for_each_child(node, |_, child| only = child);
            debug_assert!(!only.is_null());
            only
        }
        NodeType::N16 => {
            let smaller = new_node4(base.key, base.level);
            for_each_child(node, |ind, child| {
                unsafe { add(smaller, child, ind) };
            });
            smaller
        }
        NodeType::N48 => {
            let smaller = new_node16(base.key, base.level);
            for_each_child(node, |ind, child| {
                unsafe { add(smaller, child, ind) };
            });
            smaller
        }
        NodeType::N256 => {
            let smaller = new_node48(base.key, base.level);
            for_each_child(node, |ind, child| {
                unsafe { add(smaller, child, ind) };
            });
            smaller
        }
        NodeType::Leaf => unreachable!("shrink on a leaf"),
    }
}

pub(super) unsafe fn free_node<K: RadixKey, V>(node: *mut NodeBase<K>) {
    match (*node).node_type {
        NodeType::Leaf => drop(Box::from_raw(node as *mut Leaf<K, V>)),
        NodeType::N4 => drop(Box::from_raw(node as *mut Node4<K>)),
        NodeType::N16 => drop(Box::from_raw(node as *mut Node16<K>)),
        NodeType::N48 => drop(Box::from_raw(node as *mut Node48<K>)),
        NodeType::N256 => drop(Box::from_raw(node as *mut Node256<K>)),
    }
}
