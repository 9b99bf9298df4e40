/*
 * Created on Thu Mar 14 2024
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

//! An address-keyed wait/wake primitive: an emulated futex built from 4096
//! bucketed waiter lists and per-waiter condition variables. Two levels of
//! locking: the bucket mutex guards the intrusive list, the per-waiter mutex
//! and condvar carry the actual wakeup so a single unpark never produces a
//! thundering herd.
//!
//! Waiter nodes live on the parker's stack; a node is always unlinked under
//! the bucket lock before `park` returns, so the frame never outlives its
//! list membership.

use {
    super::{ORD_RLX, ORD_SEQ},
    core::sync::atomic::{AtomicBool, AtomicU64},
    parking_lot::{Condvar, Mutex},
    std::time::{Duration, Instant},
};

const BUCKET_COUNT: usize = 4096;
/// lot ids below this are reserved for the crate's own static lots
const RESERVED_LOTS: u64 = 1;

static LOT_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(RESERVED_LOTS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// the `to_park` predicate said no; nothing was enqueued
    Skip,
    Unparked,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnparkControl {
    RetainContinue,
    RemoveContinue,
    RetainBreak,
    RemoveBreak,
}

struct Waiter {
    key: usize,
    lot_id: u64,
    data: u64,
    next: *mut Waiter,
    prev: *mut Waiter,
    // write signaled only while holding both the bucket and the waiter
    // mutex; read it under either
    signaled: AtomicBool,
    mtx: Mutex<()>,
    cond: Condvar,
}

impl Waiter {
    fn new(key: usize, lot_id: u64, data: u64) -> Self {
        Self {
            key,
            lot_id,
            data,
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            signaled: AtomicBool::new(false),
            mtx: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
    /// block until signaled; true on deadline expiry
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.mtx.lock();
        while !self.signaled.load(ORD_RLX) {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return true;
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
        false
    }
    /// must be called under the bucket lock; holds the waiter mutex across
    /// the notify so the parker cannot observe the signal (and release its
    /// frame) before we are done touching the node
    fn wake(&self) {
        let _guard = self.mtx.lock();
        self.signaled.store(true, ORD_RLX);
        self.cond.notify_one();
    }
}

struct WaitList {
    head: *mut Waiter,
    tail: *mut Waiter,
}

struct Bucket {
    count: AtomicU64,
    list: Mutex<WaitList>,
}

// raw list pointers are only touched under the bucket mutex
unsafe impl Sync for Bucket {}
unsafe impl Send for Bucket {}

impl Bucket {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Bucket = Bucket {
        count: AtomicU64::new(0),
        list: Mutex::new(WaitList {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        }),
    };

    unsafe fn push_back(list: &mut WaitList, node: *mut Waiter) {
        if list.tail.is_null() {
            list.head = node;
            list.tail = node;
        } else {
            (*node).prev = list.tail;
            (*list.tail).next = node;
            list.tail = node;
        }
    }

    unsafe fn erase(&self, list: &mut WaitList, node: *mut Waiter) {
        debug_assert!(self.count.load(ORD_RLX) >= 1);
        if !(*node).prev.is_null() {
            (*(*node).prev).next = (*node).next;
        } else {
            list.head = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        } else {
            list.tail = (*node).prev;
        }
        (*node).next = core::ptr::null_mut();
        (*node).prev = core::ptr::null_mut();
        self.count.fetch_sub(1, ORD_RLX);
    }
}

static BUCKETS: [Bucket; BUCKET_COUNT] = [Bucket::EMPTY; BUCKET_COUNT];

/// A handle over the shared bucket array. Waiters from different lots may
/// land in the same bucket; `unpark` only ever visits entries carrying this
/// lot's id, so selector callbacks never see foreign data.
pub struct ParkingLot {
    lot_id: u64,
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkingLot {
    pub fn new() -> Self {
        Self {
            lot_id: LOT_ID_ALLOCATOR.fetch_add(1, ORD_RLX),
        }
    }

    pub(crate) const fn with_reserved_id(lot_id: u64) -> Self {
        Self { lot_id }
    }

    #[inline(always)]
    fn bucket_for(key: usize) -> &'static Bucket {
        // fibonacci mix; the key is almost always an address
        let h = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &BUCKETS[(h >> (64 - 12)) as usize & (BUCKET_COUNT - 1)]
    }

    /// Enqueue the calling thread under `key` and block.
    ///
    /// `to_park` is evaluated under the bucket lock: returning false aborts
    /// with [`ParkResult::Skip`] before anything is enqueued. `pre_wait` runs
    /// after the bucket lock is released, before blocking.
    pub fn park(
        &self,
        key: usize,
        data: u64,
        to_park: impl FnOnce() -> bool,
        pre_wait: impl FnOnce(),
    ) -> ParkResult {
        self.park_until(key, data, to_park, pre_wait, None)
    }

    /// [`Self::park`] with a relative deadline
    pub fn park_for(
        &self,
        key: usize,
        data: u64,
        to_park: impl FnOnce() -> bool,
        pre_wait: impl FnOnce(),
        timeout: Duration,
    ) -> ParkResult {
        self.park_until(key, data, to_park, pre_wait, Some(Instant::now() + timeout))
    }

    fn park_until(
        &self,
        key: usize,
        data: u64,
        to_park: impl FnOnce() -> bool,
        pre_wait: impl FnOnce(),
        deadline: Option<Instant>,
    ) -> ParkResult {
        let bucket = Self::bucket_for(key);
        let waiter = Waiter::new(key, self.lot_id, data);
        let waiter_ptr = &waiter as *const Waiter as *mut Waiter;
        {
            // A: must be seq-cst; matches B in unpark. The increment has to
            // be ordered before whatever to_park() reads, or a waker that
            // published its state and then loaded a zero count could miss us.
            bucket.count.fetch_add(1, ORD_SEQ);
            let mut list = bucket.list.lock();
            if !to_park() {
                drop(list);
                bucket.count.fetch_sub(1, ORD_RLX);
                return ParkResult::Skip;
            }
            unsafe {
                // UNSAFE: waiter outlives list membership; see module docs
                Bucket::push_back(&mut list, waiter_ptr);
            }
        }
        pre_wait();

        if waiter.wait(deadline) {
            // not really a timeout until the unsignalled node is unlinked
            let mut list = bucket.list.lock();
            if !waiter.signaled.load(ORD_RLX) {
                unsafe {
                    // UNSAFE: node is still linked; we hold the bucket lock
                    bucket.erase(&mut list, waiter_ptr);
                }
                return ParkResult::Timeout;
            }
        }
        ParkResult::Unparked
    }

    /// Walk the waiters parked under `key` in this lot, handing each waiter's
    /// `data` to the selector. `Remove*` results unlink and wake the waiter;
    /// `*Break` results stop the walk.
    pub fn unpark(&self, key: usize, mut selector: impl FnMut(u64) -> UnparkControl) {
        let bucket = Self::bucket_for(key);
        // B: must be seq-cst; matches A in park
        if bucket.count.load(ORD_SEQ) == 0 {
            return;
        }
        let mut list = bucket.list.lock();
        let mut cur = list.head;
        while !cur.is_null() {
            let node = unsafe {
                // UNSAFE: linked nodes are alive while we hold the bucket lock
                &*cur
            };
            cur = node.next;
            if node.key == key && node.lot_id == self.lot_id {
                let verdict = selector(node.data);
                if matches!(
                    verdict,
                    UnparkControl::RemoveBreak | UnparkControl::RemoveContinue
                ) {
                    unsafe {
                        // UNSAFE: unlink before waking; the frame may die the
                        // moment the parker observes the signal
                        bucket.erase(&mut list, node as *const Waiter as *mut Waiter);
                    }
                    node.wake();
                }
                if matches!(
                    verdict,
                    UnparkControl::RemoveBreak | UnparkControl::RetainBreak
                ) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        core::sync::atomic::{AtomicUsize, Ordering},
        std::{sync::Arc, thread, time::Duration},
    };

    #[test]
    fn skip_when_predicate_fails() {
        let lot = ParkingLot::new();
        let key = &lot as *const _ as usize;
        assert_eq!(lot.park(key, 0, || false, || {}), ParkResult::Skip);
    }

    #[test]
    fn timeout_expires() {
        let lot = ParkingLot::new();
        let key = &lot as *const _ as usize;
        let res = lot.park_for(key, 0, || true, || {}, Duration::from_millis(50));
        assert_eq!(res, ParkResult::Timeout);
    }

    #[test]
    fn unpark_wakes_one_waiter_at_a_time() {
        let lot = Arc::new(ParkingLot::new());
        let key = Arc::as_ptr(&lot) as usize;
        let enqueued = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let (lot, enqueued) = (lot.clone(), enqueued.clone());
                thread::spawn(move || {
                    // pre_wait runs once the node is on the bucket list
                    lot.park(
                        key,
                        i,
                        || true,
                        || {
                            enqueued.fetch_add(1, Ordering::SeqCst);
                        },
                    )
                })
            })
            .collect();

        while enqueued.load(Ordering::SeqCst) != 2 {
            thread::yield_now();
        }
        let mut woken = 0;
        while woken != 2 {
            lot.unpark(key, |_| UnparkControl::RemoveBreak);
            woken += 1;
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), ParkResult::Unparked);
        }
    }

    #[test]
    fn selector_sees_parked_data() {
        let lot = Arc::new(ParkingLot::new());
        let key = Arc::as_ptr(&lot) as usize;
        let t = {
            let lot = lot.clone();
            thread::spawn(move || lot.park(key, 0xdead, || true, || {}))
        };
        // retry until the waiter is actually enqueued
        let mut seen = None;
        while seen.is_none() {
            lot.unpark(key, |data| {
                seen = Some(data);
                UnparkControl::RemoveBreak
            });
            thread::yield_now();
        }
        assert_eq!(seen, Some(0xdead));
        assert_eq!(t.join().unwrap(), ParkResult::Unparked);
    }
}
