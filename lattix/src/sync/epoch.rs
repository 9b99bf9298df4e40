/*
 * Created on Mon Mar 18 2024
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

//! Epoch based safe memory reclamation.
//!
//! Readers bracket every index operation with an [`EpochGuard`]; writers hand
//! unlinked nodes to [`EpochManager::retire_in_new_epoch`] (or
//! `..._in_current_epoch`) together with a destructor. A retiree stamped with
//! epoch `E` is destroyed only once `min(local epoch of all threads) > E`, so
//! a reader that entered before the retire can never observe a freed node.
//!
//! Retire lists are strictly thread-local (indexed by registry slot); the
//! only cross-thread traffic is the epoch counters.

use {
    super::{registry, ORD_REL, ORD_RLX, ORD_SEQ},
    crate::mem::CachePadded,
    core::{cell::UnsafeCell, sync::atomic::AtomicU64},
    std::{collections::VecDeque, sync::atomic::AtomicUsize},
};

/// local-epoch sentinel: the thread is not inside any operation
const QUIESCENT: u64 = u64::MAX;
const DEF_RECLAIM_THRESHOLD: usize = 1000;

struct Retiree<T> {
    object: *mut T,
    reclaimer: unsafe fn(*mut T),
    retired_epoch: u64,
}

impl<T> Retiree<T> {
    /// reclaimable once every thread has moved past the retire epoch
    #[inline(always)]
    fn can_reclaim(&self, min_used_epoch: u64) -> bool {
        min_used_epoch > self.retired_epoch
    }
}

pub struct EpochManager<T> {
    reclaim_threshold: AtomicUsize,
    global_epoch: CachePadded<AtomicU64>,
    local_epochs: Box<[CachePadded<AtomicU64>]>,
    retire_lists: Box<[CachePadded<UnsafeCell<VecDeque<Retiree<T>>>>]>,
}

// the raw retiree pointers are owned by the manager from retire onwards;
// each retire list is only ever touched through its owner thread's slot
unsafe impl<T> Send for EpochManager<T> {}
unsafe impl<T> Sync for EpochManager<T> {}

impl<T> Default for EpochManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EpochManager<T> {
    pub fn new() -> Self {
        Self {
            reclaim_threshold: AtomicUsize::new(DEF_RECLAIM_THRESHOLD),
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            local_epochs: (0..registry::MAX_THREADS)
                .map(|_| CachePadded::new(AtomicU64::new(QUIESCENT)))
                .collect(),
            retire_lists: (0..registry::MAX_THREADS)
                .map(|_| CachePadded::new(UnsafeCell::new(VecDeque::new())))
                .collect(),
        }
    }

    /// All shared objects the calling thread reaches between here and the
    /// matching [`Self::exit_epoch`] are protected from reclamation.
    #[inline]
    pub fn enter_epoch(&self) {
        self.local_epochs[registry::thread_id()].store(self.now(), ORD_SEQ);
    }

    /// Mark the calling thread quiescent, releasing its hold on every epoch.
    #[inline]
    pub fn exit_epoch(&self) {
        self.local_epochs[registry::thread_id()].store(QUIESCENT, ORD_REL);
    }

    /// RAII [`Self::enter_epoch`]/[`Self::exit_epoch`]
    #[inline]
    pub fn pin(&self) -> EpochGuard<'_, T> {
        EpochGuard::new(self)
    }

    /// Advance the global epoch; returns the epoch being left behind.
    #[inline]
    pub fn switch_epoch(&self) -> u64 {
        self.global_epoch.fetch_add(1, ORD_SEQ)
    }

    /// The current global epoch
    #[inline]
    pub fn now(&self) -> u64 {
        self.global_epoch.load(ORD_SEQ)
    }

    /// The calling thread's local epoch (for diagnostics)
    #[inline]
    pub fn my_epoch(&self) -> u64 {
        self.local_epochs[registry::thread_id()].load(ORD_RLX)
    }

    /// Hand objects over for deferred destruction, stamped against the epoch
    /// being closed by an atomic global-epoch bump.
    ///
    /// # Safety
    /// The objects must be unlinked (unreachable for new readers) and owned
    /// by the caller; `reclaimer` will be called exactly once per object.
    pub unsafe fn retire_in_new_epoch(&self, reclaimer: unsafe fn(*mut T), objects: &[*mut T]) {
        let epoch = self.switch_epoch();
        self.retire(reclaimer, objects, epoch);
    }

    /// Like [`Self::retire_in_new_epoch`] without advancing the global epoch.
    ///
    /// # Safety
    /// Same contract as [`Self::retire_in_new_epoch`].
    pub unsafe fn retire_in_current_epoch(&self, reclaimer: unsafe fn(*mut T), objects: &[*mut T]) {
        self.retire(reclaimer, objects, self.now());
    }

    unsafe fn retire(&self, reclaimer: unsafe fn(*mut T), objects: &[*mut T], retired_epoch: u64) {
        let len = {
            let list = &mut *self.retire_lists[registry::thread_id()].get();
            for &object in objects {
                list.push_back(Retiree {
                    object,
                    reclaimer,
                    retired_epoch,
                });
            }
            list.len()
        };
        if len >= self.reclaim_threshold.load(ORD_RLX) {
            self.do_reclaim();
        }
    }

    /// Destroy every retiree on the calling thread's list that no active
    /// thread can still see. Returns the number of objects still pending.
    pub fn do_reclaim(&self) -> usize {
        let min_used_epoch = self.min_used_epoch();
        unsafe {
            // UNSAFE: our own slot's list; retire contract covers the frees
            Self::reclaim_in(
                &mut *self.retire_lists[registry::thread_id()].get(),
                min_used_epoch,
            )
        }
    }

    /// [`Self::do_reclaim`] across every thread's retire list. Exclusive
    /// access makes the cross-slot walk safe; called on index teardown.
    pub fn reclaim_all(&mut self) {
        let min_used_epoch = self.min_used_epoch();
        for list in self.retire_lists.iter_mut() {
            unsafe {
                // UNSAFE: &mut self, no other thread can touch any list
                Self::reclaim_in(list.get_mut(), min_used_epoch);
            }
        }
    }

    /// objects to accumulate before an automatic reclaim pass (default 1000)
    pub fn set_reclamation_threshold(&self, threshold: usize) {
        if threshold > 0 {
            self.reclaim_threshold.store(threshold, ORD_RLX);
        }
    }

    unsafe fn reclaim_in(list: &mut VecDeque<Retiree<T>>, min_used_epoch: u64) -> usize {
        let mut reclaimed = 0;
        while let Some(front) = list.front() {
            if !front.can_reclaim(min_used_epoch) {
                break;
            }
            let retiree = list.pop_front().unwrap();
            (retiree.reclaimer)(retiree.object);
            reclaimed += 1;
        }
        if reclaimed != 0 {
            log::trace!("epoch reclaim: freed {reclaimed}, {} pending", list.len());
            list.shrink_to_fit();
        }
        list.len()
    }

    /// seq-cst min-reduction over every slot a registered thread may occupy
    fn min_used_epoch(&self) -> u64 {
        match registry::max_thread_id() {
            Some(max_tid) => self.local_epochs[..=max_tid]
                .iter()
                .map(|e| e.load(ORD_SEQ))
                .min()
                .unwrap_or(QUIESCENT),
            None => QUIESCENT,
        }
    }
}

impl<T> Drop for EpochManager<T> {
    fn drop(&mut self) {
        // owner teardown: no reader can exist, drain unconditionally
        for list in self.retire_lists.iter_mut() {
            for retiree in list.get_mut().drain(..) {
                unsafe {
                    // UNSAFE: retire contract; exactly-once destruction
                    (retiree.reclaimer)(retiree.object);
                }
            }
        }
    }
}

pub struct EpochGuard<'a, T> {
    mgr: &'a EpochManager<T>,
}

impl<'a, T> EpochGuard<'a, T> {
    #[inline]
    pub fn new(mgr: &'a EpochManager<T>) -> Self {
        mgr.enter_epoch();
        Self { mgr }
    }
}

impl<T> Drop for EpochGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mgr.exit_epoch();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        core::sync::atomic::{AtomicUsize, Ordering},
        std::{sync::mpsc, sync::Arc, thread},
    };

    // every test gets its own counter + reclaimer pair: retire takes plain
    // fn pointers, and the test binary runs tests concurrently
    macro_rules! drop_counter {
        ($ctr:ident, $dtor:ident) => {
            static $ctr: AtomicUsize = AtomicUsize::new(0);
            unsafe fn $dtor(obj: *mut u64) {
                $ctr.fetch_add(1, Ordering::SeqCst);
                drop(Box::from_raw(obj));
            }
        };
    }

    fn leak(v: u64) -> *mut u64 {
        Box::into_raw(Box::new(v))
    }

    #[test]
    fn quiescent_retirees_reclaim_immediately() {
        drop_counter!(DROPS, count_drop);
        registry::register().unwrap();
        let gc: EpochManager<u64> = EpochManager::new();
        unsafe {
            gc.retire_in_new_epoch(count_drop, &[leak(1), leak(2)]);
        }
        // nobody is inside an epoch, so everything is reclaimable
        assert_eq!(gc.do_reclaim(), 0);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
        registry::unregister();
    }

    #[test]
    fn pinned_reader_blocks_reclamation() {
        drop_counter!(DROPS, count_drop);
        registry::register().unwrap();
        let gc: Arc<EpochManager<u64>> = Arc::new(EpochManager::new());
        let (enter_tx, enter_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();

        let reader = {
            let gc = gc.clone();
            thread::spawn(move || {
                registry::register().unwrap();
                let guard = gc.pin();
                enter_tx.send(()).unwrap();
                // pinned until the writer saw the blocked reclaim
                exit_rx.recv().unwrap();
                drop(guard);
                registry::unregister();
            })
        };
        enter_rx.recv().unwrap();

        unsafe {
            gc.retire_in_new_epoch(count_drop, &[leak(7)]);
        }
        assert_eq!(gc.do_reclaim(), 1, "pinned reader must hold the object");
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        exit_tx.send(()).unwrap();
        reader.join().unwrap();

        assert_eq!(gc.do_reclaim(), 0);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        registry::unregister();
    }

    #[test]
    fn threshold_triggers_inline_reclaim() {
        drop_counter!(DROPS, count_drop);
        registry::register().unwrap();
        let gc: EpochManager<u64> = EpochManager::new();
        gc.set_reclamation_threshold(4);
        for i in 0..4 {
            unsafe {
                gc.retire_in_new_epoch(count_drop, &[leak(i)]);
            }
        }
        // the fourth retire crossed the threshold with no pinned readers
        assert_eq!(DROPS.load(Ordering::SeqCst), 4);
        registry::unregister();
    }

    #[test]
    fn drop_drains_pending_retirees() {
        drop_counter!(DROPS, count_drop);
        registry::register().unwrap();
        let gc: EpochManager<u64> = EpochManager::new();
        unsafe {
            gc.retire_in_current_epoch(count_drop, &[leak(1)]);
        }
        drop(gc);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        registry::unregister();
    }

    #[test]
    fn guard_tracks_epoch() {
        registry::register().unwrap();
        let gc: EpochManager<u64> = EpochManager::new();
        {
            let _g = gc.pin();
            assert_eq!(gc.my_epoch(), gc.now());
        }
        assert_eq!(gc.my_epoch(), QUIESCENT);
        registry::unregister();
    }
}
