/*
 * Created on Tue Apr 16 2024
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

//! A concurrent B+Tree over slotted pages.
//!
//! Readers traverse root-to-leaf optimistically, holding nothing but
//! `(node, state)` snapshots and validating each parent's state before
//! trusting the child pointer read through it; persistent contention falls
//! back to pessimistic lock coupling. Structural changes never edit a node
//! in place: the writer builds replacement nodes (trim, split halves, merged
//! node), swaps the parent's child pointer under locks after re-verifying
//! every captured snapshot, marks the displaced nodes deleted and retires
//! them to the epoch manager. Readers still parked on a displaced node
//! observe the version change and restart.
//!
//! There is no sibling chain: iterators hop leaves by re-descending with the
//! current leaf's `high_key` (or `low_key` going backwards).

mod iter;
pub(super) mod node;
#[cfg(test)]
mod tests;

pub use iter::Iter;

use {
    self::node::{InnerRef, Node, NodeRef, NodeState, NodeType, SplitInfo, MAX_HEIGHT},
    super::ConcurrentIndex,
    crate::{
        mem::UArray,
        sync::{EpochManager, Mutex, ORD_REL, ORD_RLX, ORD_SEQ},
    },
    core::{
        marker::PhantomData,
        ptr,
        sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize},
    },
    std::{thread, time::Duration},
};

/// Compile-time shape of the tree
pub trait TreeConfig: 'static {
    /// page size in bytes
    const NODE_SIZE: usize;
    /// occupancy percentage below which a node tries to merge left
    const MERGE_THRESHOLD: usize;
    /// maintain the instrumentation counter block
    const STAT: bool;
}

pub struct DefTreeConfig;

impl TreeConfig for DefTreeConfig {
    const NODE_SIZE: usize = 8 * 1024;
    const MERGE_THRESHOLD: usize = 20;
    const STAT: bool = false;
}

/// default shape plus the full counter block
pub struct StatTreeConfig;

impl TreeConfig for StatTreeConfig {
    const NODE_SIZE: usize = 8 * 1024;
    const MERGE_THRESHOLD: usize = 20;
    const STAT: bool = true;
}

/// Key ordering, dynamically dispatched so a comparator can be chosen per
/// call. Implementations must be total orders agreeing with `equal`.
pub trait KeyComparator<K> {
    fn less(&self, a: &K, b: &K) -> bool;
    fn equal(&self, a: &K, b: &K) -> bool;
}

/// the zero-sized comparator backing the `Ord` method family
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    #[inline(always)]
    fn less(&self, a: &K, b: &K) -> bool {
        a < b
    }
    #[inline(always)]
    fn equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

const ORD_CMP: OrdComparator = OrdComparator;

/// instrumentation block; only `num_elements` is maintained when
/// [`TreeConfig::STAT`] is off
#[derive(Default)]
pub struct TreeStats {
    num_elements: AtomicUsize,
    num_leaf_splits: AtomicUsize,
    num_inner_splits: AtomicUsize,
    num_leaf_trims: AtomicUsize,
    num_inner_trims: AtomicUsize,
    num_leaf_merges: AtomicUsize,
    num_inner_merges: AtomicUsize,
    num_pessimistic_reads: AtomicUsize,
    num_optimistic_fails: AtomicUsize,
    num_retries: AtomicUsize,
}

macro_rules! stat_getters {
    ($($field:ident),*$(,)?) => {
        $(pub fn $field(&self) -> usize { self.$field.load(ORD_RLX) })*
    };
}

impl TreeStats {
    stat_getters! {
        num_elements, num_leaf_splits, num_inner_splits, num_leaf_trims,
        num_inner_trims, num_leaf_merges, num_inner_merges,
        num_pessimistic_reads, num_optimistic_fails, num_retries,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpResult {
    Success,
    Failure,
    StaleSnapshot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum InsertStatus {
    Overflow,
    Duplicate,
    Inserted,
}

#[derive(Clone, Copy)]
pub(super) struct Snapshot<K> {
    node: *mut Node<K>,
    state: NodeState,
}

impl<K> Snapshot<K> {
    fn null() -> Self {
        Self {
            node: ptr::null_mut(),
            state: NodeState::empty(),
        }
    }
}

/// root pseudo-snapshot + one per level + the leaf
pub(super) type Snapshots<K> = UArray<{ MAX_HEIGHT + 2 }, Snapshot<K>>;

const OPTIMISTIC: bool = true;
const PESSIMISTIC: bool = false;
const OPTIMISTIC_TRY_COUNT: usize = 3;
const OPTIMISTIC_SPIN_WAIT: Duration = Duration::from_nanos(300);
const MAX_OPTIMISTIC_RESTARTS: usize = 2;

unsafe fn dealloc_any<K: Copy, V: Copy, C: TreeConfig>(node: *mut Node<K>) {
    if (*node).is_leaf() {
        NodeRef::<K, V, C>::dealloc(node);
    } else {
        InnerRef::<K, C>::dealloc(node);
    }
}

/// Ordered concurrent map. Keys and values must be trivially copyable:
/// optimistic readers copy records out of shared pages before validating.
pub struct ConcurrentMap<K, V, C = DefTreeConfig>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    root_mutex: Mutex,
    root_state: AtomicU64,
    root: AtomicPtr<Node<K>>,
    height: AtomicUsize,
    stats: TreeStats,
    gc: EpochManager<Node<K>>,
    _v: PhantomData<V>,
    _c: PhantomData<C>,
}

unsafe impl<K, V, C> Send for ConcurrentMap<K, V, C>
where
    K: Copy + Send,
    V: Copy + Send,
    C: TreeConfig,
{
}
unsafe impl<K, V, C> Sync for ConcurrentMap<K, V, C>
where
    K: Copy + Send + Sync,
    V: Copy + Send + Sync,
    C: TreeConfig,
{
}

impl<K, V, C> ConcurrentMap<K, V, C>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    pub fn new() -> Self {
        Self {
            root_mutex: Mutex::new(),
            root_state: AtomicU64::new(NodeState::empty().bits()),
            root: AtomicPtr::new(ptr::null_mut()),
            height: AtomicUsize::new(0),
            stats: TreeStats::default(),
            gc: EpochManager::new(),
            _v: PhantomData,
            _c: PhantomData,
        }
    }

    #[inline(always)]
    fn leaf_ref(node: *mut Node<K>) -> NodeRef<K, V, C> {
        NodeRef::from_raw(node)
    }

    #[inline(always)]
    fn inner_ref(node: *mut Node<K>) -> InnerRef<K, C> {
        InnerRef::from_raw(node)
    }

    #[inline(always)]
    fn stat(&self, counter: &AtomicUsize) {
        if C::STAT {
            counter.fetch_add(1, ORD_RLX);
        }
    }

    // ---- snapshots & node locking ----

    fn node_state(&self, node: *mut Node<K>) -> NodeState {
        if node.is_null() {
            NodeState::from_bits(self.root_state.load(ORD_SEQ))
        } else {
            unsafe { (*node).state() }
        }
    }

    pub(super) fn is_snapshot_stale(&self, snapshot: &Snapshot<K>) -> bool {
        self.node_state(snapshot.node) != snapshot.state
    }

    fn unlock_node(&self, node: *mut Node<K>) {
        if node.is_null() {
            self.root_mutex.unlock();
        } else {
            unsafe { (*node).mutex.unlock() }
        }
    }

    /// blocking lock; a deleted node is unlocked again immediately and the
    /// returned state tells the caller to restart
    fn lock_pessimistic(&self, node: *mut Node<K>) -> NodeState {
        self.stat(&self.stats.num_pessimistic_reads);
        if node.is_null() {
            self.root_mutex.lock();
        } else {
            unsafe { (*node).mutex.lock() };
        }
        let state = self.node_state(node);
        if state.is_deleted() {
            self.unlock_node(node);
        }
        state
    }

    /// spin for an unlocked state; None once the writer has outstayed the
    /// spin budget
    fn try_lock_optimistic(&self, node: *mut Node<K>) -> Option<NodeState> {
        for _ in 0..OPTIMISTIC_TRY_COUNT {
            let state = self.node_state(node);
            if !state.is_locked() {
                return Some(state);
            }
            thread::sleep(OPTIMISTIC_SPIN_WAIT);
        }
        None
    }

    /// capture the node's state; true means the node is deleted and the
    /// traversal must restart
    fn lock_node_or_restart(
        &self,
        node: *mut Node<K>,
        optimistic: bool,
        state: &mut NodeState,
    ) -> bool {
        if optimistic {
            match self.try_lock_optimistic(node) {
                Some(s) => *state = s,
                None => {
                    self.stat(&self.stats.num_optimistic_fails);
                    // wait the writer out behind its own mutex
                    *state = self.lock_pessimistic(node);
                    if !state.is_deleted() {
                        self.unlock_node(node);
                    }
                }
            }
        } else {
            *state = self.lock_pessimistic(node);
        }
        state.is_deleted()
    }

    /// optimistic: re-validate; pessimistic: release the coupling lock
    fn unlock_node_or_restart(
        &self,
        node: *mut Node<K>,
        state: NodeState,
        optimistic: bool,
    ) -> bool {
        if optimistic {
            self.node_state(node) != state
        } else {
            self.unlock_node(node);
            false
        }
    }

    // ---- traversal ----

    fn traverse<F>(
        &self,
        optimistic: bool,
        fill: bool,
        get_child: &F,
        snapshots: &mut Snapshots<K>,
        leaf_snapshot: &mut Snapshot<K>,
    ) -> OpResult
    where
        F: Fn(*mut Node<K>) -> *mut Node<K>,
    {
        snapshots.clear();
        *leaf_snapshot = Snapshot::null();

        let mut parent: *mut Node<K> = ptr::null_mut();
        let mut parent_state = NodeState::empty();
        let mut current_state = NodeState::empty();

        if self.lock_node_or_restart(parent, optimistic, &mut parent_state) {
            return OpResult::StaleSnapshot;
        }
        if fill {
            snapshots.push(Snapshot {
                node: parent,
                state: parent_state,
            });
        }

        let mut current = self.root.load(ORD_SEQ);
        unsafe {
            while !current.is_null() && (*current).is_inner() {
                if self.lock_node_or_restart(current, optimistic, &mut current_state)
                    || self.unlock_node_or_restart(parent, parent_state, optimistic)
                {
                    return OpResult::StaleSnapshot;
                }
                if fill {
                    snapshots.push(Snapshot {
                        node: current,
                        state: current_state,
                    });
                }
                parent = current;
                parent_state = current_state;
                current = get_child(current);
                // the child pointer was read through the parent; it is only
                // trustworthy if the parent hasn't moved since its capture
                if self.is_snapshot_stale(&Snapshot {
                    node: parent,
                    state: parent_state,
                }) {
                    return OpResult::StaleSnapshot;
                }
            }
        }

        if (!current.is_null()
            && self.lock_node_or_restart(current, optimistic, &mut current_state))
            || self.unlock_node_or_restart(parent, parent_state, optimistic)
        {
            return OpResult::StaleSnapshot;
        }

        if !current.is_null() {
            let snapshot = Snapshot {
                node: current,
                state: current_state,
            };
            if fill {
                snapshots.push(snapshot);
            }
            *leaf_snapshot = snapshot;
        }
        OpResult::Success
    }

    /// optimistic descent with a bounded retry budget, then one pessimistic
    /// pass that cannot fail. Returns true iff the pessimistic pass ran, in
    /// which case the leaf's mutex is held on return.
    fn traverse_to_leaf<F>(
        &self,
        fill: bool,
        get_child: F,
        snapshots: &mut Snapshots<K>,
        leaf_snapshot: &mut Snapshot<K>,
    ) -> bool
    where
        F: Fn(*mut Node<K>) -> *mut Node<K>,
    {
        let mut restarts = 0;
        let mut res;
        loop {
            res = self.traverse(OPTIMISTIC, fill, &get_child, snapshots, leaf_snapshot);
            restarts += 1;
            if res == OpResult::Success || restarts >= MAX_OPTIMISTIC_RESTARTS {
                break;
            }
        }
        if res != OpResult::Success {
            let pess = self.traverse(PESSIMISTIC, fill, &get_child, snapshots, leaf_snapshot);
            debug_assert_eq!(pess, OpResult::Success);
        }
        res != OpResult::Success
    }

    /// writer-side descent: keeps the whole ancestor chain
    fn leaf_for_key_fill(
        &self,
        cmp: &dyn KeyComparator<K>,
        key: &K,
        snapshots: &mut Snapshots<K>,
    ) -> bool {
        let mut leaf_snapshot = Snapshot::null();
        let is_leaf_locked = self.traverse_to_leaf(
            true,
            |inner| unsafe { Self::inner_ref(inner).child_for_key(cmp, key) },
            snapshots,
            &mut leaf_snapshot,
        );
        debug_assert!(!snapshots.is_empty());
        snapshots.len() > 1 && is_leaf_locked
    }

    /// reader-side descent: leaf snapshot only, nothing left locked
    pub(super) fn leaf_for_key(&self, cmp: &dyn KeyComparator<K>, key: &K) -> Snapshot<K> {
        self.leaf_by(|inner| unsafe { Self::inner_ref(inner).child_for_key(cmp, key) })
    }

    pub(super) fn leaf_by<F>(&self, get_child: F) -> Snapshot<K>
    where
        F: Fn(*mut Node<K>) -> *mut Node<K>,
    {
        let mut snapshots = Snapshots::new();
        let mut leaf_snapshot = Snapshot::null();
        let is_leaf_locked =
            self.traverse_to_leaf(false, get_child, &mut snapshots, &mut leaf_snapshot);
        if is_leaf_locked && !leaf_snapshot.node.is_null() {
            self.unlock_node(leaf_snapshot.node);
        }
        debug_assert!(
            leaf_snapshot.node.is_null() || unsafe { (*leaf_snapshot.node).is_leaf() }
        );
        leaf_snapshot
    }

    // ---- root management ----

    /// root mutex must be held
    fn store_root(&self, new_root: *mut Node<K>) {
        let state = NodeState::from_bits(self.root_state.load(ORD_RLX));
        self.root_state.store(state.set_locked().bits(), ORD_REL);
        self.root.store(new_root, ORD_REL);
        let state = NodeState::from_bits(self.root_state.load(ORD_RLX));
        self.root_state
            .store(state.reset_locked().increment_version().bits(), ORD_REL);
        self.height.fetch_add(1, ORD_REL);
    }

    /// root mutex must be held
    unsafe fn create_root(&self, split: &SplitInfo<K>) {
        let new_root = InnerRef::<K, C>::alloc(
            NodeType::Inner,
            (*split.left).lowkey(),
            (*split.right).highkey(),
            self.height.load(ORD_RLX) + 1,
        );
        new_root.insert_neg_infinity(split.left);
        new_root.append(split.split_key.expect("rootless split"), split.right);
        self.store_root(new_root.raw());
    }

    fn update_root(&self, expected: NodeState, new_root: *mut Node<K>) -> bool {
        self.root_mutex.lock();
        let ok = NodeState::from_bits(self.root_state.load(ORD_SEQ)) == expected;
        if ok {
            self.store_root(new_root);
        }
        self.root_mutex.unlock();
        ok
    }

    fn ensure_root(&self) {
        while self.root.load(ORD_SEQ).is_null() {
            let new_root =
                NodeRef::<K, V, C>::alloc(NodeType::Leaf, None, None, self.height.load(ORD_RLX));
            if !self.update_root(NodeState::empty(), new_root.raw()) {
                unsafe {
                    // UNSAFE: never published
                    NodeRef::<K, V, C>::dealloc(new_root.raw());
                }
            }
        }
    }

    fn lock_parent_or_root(&self, parent: *mut Node<K>) {
        if parent.is_null() {
            self.root_mutex.lock();
        } else {
            unsafe { (*parent).mutex.lock() };
        }
    }

    // ---- subtree replacement ----

    /// Lock every snapshot from `from_node` down to the leaf, re-verify them
    /// all, run `install`, and on success mark the whole locked chain
    /// deleted and retire it in a fresh epoch.
    fn replace_subtree_on_version_match(
        &self,
        snapshots: &Snapshots<K>,
        from_node: usize,
        install: impl FnOnce() -> bool,
    ) -> OpResult {
        let mut locked: UArray<{ MAX_HEIGHT + 2 }, *mut Node<K>> = UArray::new();
        let mut res = OpResult::Success;

        for idx in from_node..snapshots.len() {
            let snapshot = snapshots[idx];
            unsafe { (*snapshot.node).mutex.lock() };
            locked.push(snapshot.node);
            if self.is_snapshot_stale(&snapshot) {
                res = OpResult::StaleSnapshot;
                break;
            }
        }

        let mut retired: UArray<{ MAX_HEIGHT + 2 }, *mut Node<K>> = UArray::new();
        if res == OpResult::Success {
            if install() {
                for idx in from_node..snapshots.len() {
                    let node = snapshots[idx].node;
                    unsafe {
                        (*node).set_state((*node).state().set_deleted().increment_version());
                    }
                    retired.push(node);
                }
            } else {
                res = OpResult::Failure;
            }
        }

        for &node in locked.iter() {
            self.unlock_node(node);
        }
        if !retired.is_empty() {
            unsafe {
                // UNSAFE: all marked deleted and unlinked by install()
                self.gc.retire_in_new_epoch(dealloc_any::<K, V, C>, &retired);
            }
        }
        res
    }

    fn trim_node(
        &self,
        cmp: &dyn KeyComparator<K>,
        node_idx: usize,
        key: &K,
        snapshots: &Snapshots<K>,
        prev_split: &SplitInfo<K>,
    ) -> (OpResult, SplitInfo<K>) {
        let node_snapshot = snapshots[node_idx];
        let parent_snapshot = snapshots[node_idx - 1];
        let node = node_snapshot.node;
        let parent = parent_snapshot.node;

        self.lock_parent_or_root(parent);
        if self.is_snapshot_stale(&parent_snapshot) {
            self.unlock_node(parent);
            return (OpResult::StaleSnapshot, SplitInfo::empty());
        }
        let trimmed = unsafe {
            (*node).mutex.lock();
            if self.is_snapshot_stale(&node_snapshot) {
                (*node).mutex.unlock();
                self.unlock_node(parent);
                return (OpResult::StaleSnapshot, SplitInfo::empty());
            }
            let trimmed = if (*node).is_leaf() {
                self.stat(&self.stats.num_leaf_trims);
                Self::leaf_ref(node).trim_leaf().raw()
            } else {
                self.stat(&self.stats.num_inner_trims);
                Self::inner_ref(node).trim_inner().raw()
            };
            (*node).mutex.unlock();
            trimmed
        };

        let res = self.replace_subtree_on_version_match(snapshots, node_idx, || unsafe {
            if (*node).is_inner() {
                // the child split that overflowed us lands in the compacted copy
                Self::inner_ref(trimmed).apply_split(cmp, prev_split);
            }
            if parent.is_null() {
                self.store_root(trimmed);
            } else {
                Self::inner_ref(parent).replace_child_for_key(cmp, key, trimmed);
            }
            true
        });
        self.unlock_node(parent);
        (
            res,
            SplitInfo {
                left: trimmed,
                right: ptr::null_mut(),
                split_key: None,
            },
        )
    }

    fn split_node(
        &self,
        cmp: &dyn KeyComparator<K>,
        node_idx: usize,
        snapshots: &Snapshots<K>,
        prev_split: &SplitInfo<K>,
    ) -> (OpResult, SplitInfo<K>) {
        let node_snapshot = snapshots[node_idx];
        let parent_snapshot = snapshots[node_idx - 1];
        let node = node_snapshot.node;
        let parent = parent_snapshot.node;

        self.lock_parent_or_root(parent);
        if self.is_snapshot_stale(&parent_snapshot) {
            self.unlock_node(parent);
            return (OpResult::StaleSnapshot, SplitInfo::empty());
        }
        let split = unsafe {
            (*node).mutex.lock();
            if self.is_snapshot_stale(&node_snapshot) {
                (*node).mutex.unlock();
                self.unlock_node(parent);
                return (OpResult::StaleSnapshot, SplitInfo::empty());
            }
            let split = if (*node).is_leaf() {
                self.stat(&self.stats.num_leaf_splits);
                Self::leaf_ref(node).split_leaf()
            } else {
                self.stat(&self.stats.num_inner_splits);
                Self::inner_ref(node).split_inner()
            };
            (*node).mutex.unlock();
            split
        };

        let res = self.replace_subtree_on_version_match(snapshots, node_idx, || unsafe {
            if (*node).is_inner() {
                self.insert_into_split_half(cmp, &split, prev_split);
            }
            if parent.is_null() {
                self.create_root(&split);
                true
            } else {
                Self::inner_ref(parent).apply_split(cmp, &split)
            }
        });
        self.unlock_node(parent);
        (res, split)
    }

    /// after an inner node splits, the child separator that triggered the
    /// whole cascade goes into whichever half now covers it
    unsafe fn insert_into_split_half(
        &self,
        cmp: &dyn KeyComparator<K>,
        parent_split: &SplitInfo<K>,
        child_split: &SplitInfo<K>,
    ) {
        let child_key = child_split.split_key.expect("cascade without separator");
        let parent_key = parent_split.split_key.expect("cascade without separator");
        let half = if cmp.less(&child_key, &parent_key) {
            parent_split.left
        } else {
            parent_split.right
        };
        Self::inner_ref(half).apply_split(cmp, child_split);
    }

    fn handle_node_overflow(
        &self,
        cmp: &dyn KeyComparator<K>,
        node_idx: usize,
        key: &K,
        snapshots: &Snapshots<K>,
        prev_split: &SplitInfo<K>,
    ) -> (OpResult, SplitInfo<K>) {
        let node = snapshots[node_idx].node;
        if unsafe { (*node).can_trim() } {
            self.trim_node(cmp, node_idx, key, snapshots, prev_split)
        } else {
            self.split_node(cmp, node_idx, snapshots, prev_split)
        }
    }

    /// Mend an overflowing leaf by trimming or splitting, propagating the
    /// split upward as far as it must go; a fresh root is grown if the old
    /// one splits. On any staleness every unlinked allocation is released
    /// and the overall operation restarts.
    fn handle_overflow(
        &self,
        cmp: &dyn KeyComparator<K>,
        snapshots: &Snapshots<K>,
        key: &K,
    ) {
        let mut node_idx = snapshots.len() - 1;
        let mut top_split = SplitInfo::<K>::empty();
        let mut failed: UArray<{ MAX_HEIGHT + 2 }, SplitInfo<K>> = UArray::new();

        debug_assert!(unsafe { (*snapshots[node_idx].node).is_leaf() });

        let free_failed = |failed: &[SplitInfo<K>]| {
            for split in failed {
                unsafe {
                    if !split.left.is_null() {
                        dealloc_any::<K, V, C>(split.left);
                    }
                    if !split.right.is_null() {
                        dealloc_any::<K, V, C>(split.right);
                    }
                }
            }
        };

        while node_idx > 0 {
            let (res, split) =
                self.handle_node_overflow(cmp, node_idx, key, snapshots, &top_split);
            match res {
                OpResult::Failure => {
                    // the parent had no room for the separator; split it too
                    top_split = split;
                    failed.push(split);
                    node_idx -= 1;
                }
                OpResult::StaleSnapshot => {
                    failed.push(split);
                    free_failed(&failed);
                    return;
                }
                OpResult::Success => return,
            }
        }
        free_failed(&failed);
        debug_assert!(false, "record larger than a node can carry");
    }

    // ---- leaf-level operations ----

    fn leaf_insert_or_upsert(
        &self,
        leaf: NodeRef<K, V, C>,
        cmp: &dyn KeyComparator<K>,
        key: K,
        val: V,
        upsert: bool,
    ) -> (InsertStatus, Option<V>) {
        unsafe {
            let (pos, present) = leaf.lower_bound(cmp, &key);
            if present {
                if upsert {
                    let record = leaf.record(pos);
                    let old = (*record).val;
                    leaf.hdr()
                        .atomic_update(|| unsafe { ptr::write(ptr::addr_of_mut!((*record).val), val) });
                    return (InsertStatus::Duplicate, Some(old));
                }
                return (InsertStatus::Duplicate, None);
            }
            if leaf.insert_record_at(key, val, pos) {
                (InsertStatus::Inserted, None)
            } else {
                (InsertStatus::Overflow, None)
            }
        }
    }

    /// None means the snapshot went stale and the caller must redo the descent
    fn insert_or_upsert_leaf(
        &self,
        cmp: &dyn KeyComparator<K>,
        snapshots: &Snapshots<K>,
        is_leaf_locked: bool,
        key: K,
        val: V,
        upsert: bool,
    ) -> Option<(bool, Option<V>)> {
        let leaf_snapshot = snapshots[snapshots.len() - 1];
        let leaf = Self::leaf_ref(leaf_snapshot.node);

        let (status, old) = unsafe {
            if is_leaf_locked {
                debug_assert!(!self.is_snapshot_stale(&leaf_snapshot));
                let r = self.leaf_insert_or_upsert(leaf, cmp, key, val, upsert);
                leaf.hdr().mutex.unlock();
                r
            } else {
                leaf.hdr().mutex.lock();
                if self.is_snapshot_stale(&leaf_snapshot) {
                    leaf.hdr().mutex.unlock();
                    return None;
                }
                let r = self.leaf_insert_or_upsert(leaf, cmp, key, val, upsert);
                leaf.hdr().mutex.unlock();
                r
            }
        };

        match status {
            InsertStatus::Overflow => {
                self.handle_overflow(cmp, snapshots, &key);
                None
            }
            InsertStatus::Inserted => {
                self.stats.num_elements.fetch_add(1, ORD_RLX);
                Some((true, old))
            }
            InsertStatus::Duplicate => Some((false, old)),
        }
    }

    fn insert_or_upsert(
        &self,
        cmp: &dyn KeyComparator<K>,
        key: K,
        val: V,
        upsert: bool,
    ) -> (bool, Option<V>) {
        let mut snapshots = Snapshots::new();
        self.ensure_root();
        loop {
            let _eg = self.gc.pin();
            let is_leaf_locked = self.leaf_for_key_fill(cmp, &key, &mut snapshots);
            debug_assert!(snapshots.len() > 1);
            if let Some(result) =
                self.insert_or_upsert_leaf(cmp, &snapshots, is_leaf_locked, key, val, upsert)
            {
                return result;
            }
            self.stat(&self.stats.num_retries);
        }
    }

    // ---- merge ----

    fn merge_node(
        &self,
        cmp: &dyn KeyComparator<K>,
        node_idx: usize,
        snapshots: &mut Snapshots<K>,
        key: &K,
    ) {
        if node_idx == 1 {
            // the root has no sibling
            return;
        }
        let node_snapshot = snapshots[node_idx];
        let parent_snapshot = snapshots[node_idx - 1];
        let node = node_snapshot.node;
        let parent = parent_snapshot.node;
        let parent_ref = Self::inner_ref(parent);

        let mut merged: *mut Node<K> = ptr::null_mut();
        let mut sibling: *mut Node<K> = ptr::null_mut();

        unsafe {
            // read the sibling position optimistically; everything is
            // re-verified once the parent lock is held
            let pos = parent_ref.search_inner(cmp, key);
            if pos != 0 {
                let merge_key = parent_ref.key(pos);
                let sibling_pos = pos - 1;

                (*parent).mutex.lock();
                if self.is_snapshot_stale(&parent_snapshot) {
                    (*parent).mutex.unlock();
                    return;
                }
                sibling = parent_ref.child(sibling_pos);
                (*sibling).mutex.lock();
                (*node).mutex.lock();
                if self.is_snapshot_stale(&node_snapshot) {
                    (*node).mutex.unlock();
                    (*sibling).mutex.unlock();
                    (*parent).mutex.unlock();
                    return;
                }

                merged = if (*node).is_leaf() {
                    Self::leaf_ref(sibling)
                        .merge_leaf(Self::leaf_ref(node))
                        .map_or(ptr::null_mut(), |m| m.raw())
                } else {
                    Self::inner_ref(sibling)
                        .merge_inner(Self::inner_ref(node), merge_key)
                        .map_or(ptr::null_mut(), |m| m.raw())
                };

                if !merged.is_null() {
                    if (*node).is_leaf() {
                        self.stat(&self.stats.num_leaf_merges);
                    } else {
                        self.stat(&self.stats.num_inner_merges);
                    }
                    parent_ref.apply_merge(sibling_pos, merged);
                    (*sibling).set_state((*sibling).state().set_deleted().increment_version());
                    (*node).set_state((*node).state().set_deleted().increment_version());
                }
                (*node).mutex.unlock();
                (*sibling).mutex.unlock();
                (*parent).mutex.unlock();
            }

            if !merged.is_null() {
                // stamp the retirees with the pre-merge epoch, then advance:
                // readers that entered before the swap keep the old nodes
                self.gc
                    .retire_in_current_epoch(dealloc_any::<K, V, C>, &[sibling]);
                self.gc
                    .retire_in_current_epoch(dealloc_any::<K, V, C>, &[node]);
                self.gc.switch_epoch();
                // our own merge bumped the parent; refresh its snapshot so
                // an upward merge can still verify it
                snapshots[node_idx - 1] = Snapshot {
                    node: parent,
                    state: (*parent).state(),
                };
            }

            if (*parent).is_underfull::<C>() {
                self.merge_node(cmp, node_idx - 1, snapshots, key);
            }
        }
    }

    /// None means the snapshot went stale and the caller must redo the descent
    fn delete_from_leaf(
        &self,
        cmp: &dyn KeyComparator<K>,
        key: &K,
        is_leaf_locked: bool,
        snapshots: &mut Snapshots<K>,
    ) -> Option<Option<V>> {
        let leaf_idx = snapshots.len() - 1;
        let leaf_snapshot = snapshots[leaf_idx];
        let leaf = Self::leaf_ref(leaf_snapshot.node);
        let mut deleted = false;

        let ret = unsafe {
            if !is_leaf_locked {
                leaf.hdr().mutex.lock();
            }
            let ret = if self.is_snapshot_stale(&leaf_snapshot) {
                None
            } else {
                let (pos, present) = leaf.lower_bound(cmp, key);
                if !present {
                    Some(None)
                } else {
                    let old = (*leaf.record(pos)).val;
                    leaf.remove_pos(pos);
                    deleted = true;
                    // the removal bumped our version; keep the chain usable
                    // for the merge pass
                    snapshots[leaf_idx] = Snapshot {
                        node: leaf.raw(),
                        state: leaf.hdr().state(),
                    };
                    Some(Some(old))
                }
            };
            leaf.hdr().mutex.unlock();
            ret
        };

        if deleted {
            self.stats.num_elements.fetch_sub(1, ORD_RLX);
        }
        if unsafe { leaf.hdr().is_underfull::<C>() } {
            self.merge_node(cmp, snapshots.len() - 1, snapshots, key);
        }
        ret
    }

    // ---- public operations (comparator-explicit flavors) ----

    pub fn insert_with(&self, key: K, val: V, cmp: &dyn KeyComparator<K>) -> bool {
        self.insert_or_upsert(cmp, key, val, false).0
    }

    pub fn upsert_with(&self, key: K, val: V, cmp: &dyn KeyComparator<K>) -> Option<V> {
        self.insert_or_upsert(cmp, key, val, true).1
    }

    pub fn update_with(&self, key: &K, val: V, cmp: &dyn KeyComparator<K>) -> Option<V> {
        loop {
            let _eg = self.gc.pin();
            let leaf_snapshot = self.leaf_for_key(cmp, key);
            if leaf_snapshot.node.is_null() {
                return None;
            }
            let leaf = Self::leaf_ref(leaf_snapshot.node);
            unsafe {
                leaf.hdr().mutex.lock();
                if self.is_snapshot_stale(&leaf_snapshot) {
                    leaf.hdr().mutex.unlock();
                    self.stat(&self.stats.num_retries);
                    continue;
                }
                let (pos, present) = leaf.lower_bound(cmp, key);
                let old = present.then(|| unsafe {
                    let record = leaf.record(pos);
                    let old = (*record).val;
                    leaf.hdr()
                        .atomic_update(|| unsafe { ptr::write(ptr::addr_of_mut!((*record).val), val) });
                    old
                });
                leaf.hdr().mutex.unlock();
                return old;
            }
        }
    }

    pub fn search_with(&self, key: &K, cmp: &dyn KeyComparator<K>) -> Option<V> {
        loop {
            let _eg = self.gc.pin();
            let leaf_snapshot = self.leaf_for_key(cmp, key);
            if leaf_snapshot.node.is_null() {
                return None;
            }
            let leaf = Self::leaf_ref(leaf_snapshot.node);
            let val = unsafe {
                let (pos, present) = leaf.lower_bound(cmp, key);
                present.then(|| unsafe { (*leaf.record(pos)).val })
            };
            if self.is_snapshot_stale(&leaf_snapshot) {
                self.stat(&self.stats.num_retries);
                continue;
            }
            return val;
        }
    }

    pub fn remove_with(&self, key: &K, cmp: &dyn KeyComparator<K>) -> Option<V> {
        let mut snapshots = Snapshots::new();
        loop {
            let _eg = self.gc.pin();
            let is_leaf_locked = self.leaf_for_key_fill(cmp, key, &mut snapshots);
            if snapshots.len() <= 1 {
                // empty tree
                return None;
            }
            if let Some(result) = self.delete_from_leaf(cmp, key, is_leaf_locked, &mut snapshots) {
                return result;
            }
            self.stat(&self.stats.num_retries);
        }
    }

    // ---- observers ----

    pub fn len(&self) -> usize {
        self.stats.num_elements.load(ORD_RLX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// number of root replacements; 0 for a never-written tree, 1 for a
    /// single-leaf tree, and so on
    pub fn height(&self) -> usize {
        self.height.load(ORD_RLX)
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// drain every reclaimable retired node on the calling thread's list
    pub fn reclaim_all(&mut self) {
        self.gc.reclaim_all();
    }
}

impl<K, V, C> ConcurrentMap<K, V, C>
where
    K: Copy + Ord,
    V: Copy,
    C: TreeConfig,
{
    pub fn insert(&self, key: K, val: V) -> bool {
        self.insert_with(key, val, &ORD_CMP)
    }
    pub fn upsert(&self, key: K, val: V) -> Option<V> {
        self.upsert_with(key, val, &ORD_CMP)
    }
    pub fn update(&self, key: &K, val: V) -> Option<V> {
        self.update_with(key, val, &ORD_CMP)
    }
    pub fn search(&self, key: &K) -> Option<V> {
        self.search_with(key, &ORD_CMP)
    }
    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_with(key, &ORD_CMP)
    }
}

impl<K, V, C> Default for ConcurrentMap<K, V, C>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> Drop for ConcurrentMap<K, V, C>
where
    K: Copy,
    V: Copy,
    C: TreeConfig,
{
    fn drop(&mut self) {
        let mut pending: Vec<*mut Node<K>> = Vec::new();
        let root = *self.root.get_mut();
        if !root.is_null() {
            pending.push(root);
        }
        while let Some(node) = pending.pop() {
            unsafe {
                // UNSAFE: sole owner at drop; retired nodes live on the
                // epoch manager's lists, not in this walk
                if (*node).is_inner() {
                    Self::inner_ref(node).collect_children(&mut pending);
                }
                dealloc_any::<K, V, C>(node);
            }
        }
    }
}

impl<K, V, C> ConcurrentIndex<K, V> for ConcurrentMap<K, V, C>
where
    K: Copy + Ord,
    V: Copy,
    C: TreeConfig,
{
    fn insert(&self, key: K, val: V) -> bool {
        ConcurrentMap::insert(self, key, val)
    }
    fn upsert(&self, key: K, val: V) -> Option<V> {
        ConcurrentMap::upsert(self, key, val)
    }
    fn update(&self, key: &K, val: V) -> Option<V> {
        ConcurrentMap::update(self, key, val)
    }
    fn search(&self, key: &K) -> Option<V> {
        ConcurrentMap::search(self, key)
    }
    fn remove(&self, key: &K) -> Option<V> {
        ConcurrentMap::remove(self, key)
    }
    fn len(&self) -> usize {
        ConcurrentMap::len(self)
    }
}
