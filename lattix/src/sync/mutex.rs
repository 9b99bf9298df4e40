/*
 * Created on Fri Mar 15 2024
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

//! A four-byte mutex that knows who owns it.
//!
//! The word holds the owner's registry slot id in the low bits and a
//! contended flag in the high bit; `!CONTENDED_MASK` means unowned. The fast
//! path is a CAS, the contended path parks on the mutex address in the
//! global [`ParkingLot`]. Because the owner id is readable, the
//! deadlock-safe flavor can walk the holder → waited-on graph after a wait
//! times out, verify the suspected cycle under a global mutex, and hand
//! [`LockResult::Deadlocked`] back instead of waiting forever.
//!
//! Lock and unlock are deliberately unpaired methods (no RAII guard): the
//! index protocols route lock ownership across node replacement and retire
//! steps where a scoped guard cannot follow.

use {
    super::{
        parking::{ParkResult, ParkingLot, UnparkControl},
        registry, ORD_RLX, ORD_SEQ,
    },
    core::sync::atomic::{AtomicPtr, AtomicU32},
    std::{collections::HashMap, time::Duration},
};

const CONTENDED_MASK: u32 = 1 << 31;
const UNLOCKED: u32 = !CONTENDED_MASK;
const DEADLOCK_DETECT_TIMEOUT: Duration = Duration::from_secs(1);

assertions! {
    registry::MAX_THREADS < CONTENDED_MASK as usize,
}

pub type Mutex = RawMutex<false>;
pub type DeadlockSafeMutex = RawMutex<true>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Locked,
    /// only ever returned by [`DeadlockSafeMutex`]; the lock was *not*
    /// acquired and the caller owns recovery
    Deadlocked,
}

static MUTEX_LOT: ParkingLot = ParkingLot::with_reserved_id(0);
static DEADLOCK_VERIFY: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[allow(clippy::declare_interior_mutable_const)]
const NO_WAIT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
/// tid -> the deadlock-safe mutex that thread is currently parked on. Racy
/// by nature; anything read from it is re-verified under [`DEADLOCK_VERIFY`]
/// before a deadlock is declared.
static WAITING_ON: [AtomicPtr<()>; registry::MAX_THREADS] = [NO_WAIT; registry::MAX_THREADS];

pub struct RawMutex<const DEADLOCK_SAFE: bool> {
    word: AtomicU32,
}

impl<const DEADLOCK_SAFE: bool> Default for RawMutex<DEADLOCK_SAFE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEADLOCK_SAFE: bool> RawMutex<DEADLOCK_SAFE> {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline(always)]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// CAS the unowned word to our tid. The caller must be registered.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, registry::thread_id() as u32, ORD_SEQ, ORD_RLX)
            .is_ok()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(ORD_SEQ) != UNLOCKED
    }

    #[inline]
    fn is_contended(&self) -> bool {
        self.word.load(ORD_SEQ) & CONTENDED_MASK != 0
    }

    pub fn lock(&self) -> LockResult {
        loop {
            if self.try_lock() {
                debug_assert!(self.is_locked());
                return LockResult::Locked;
            }
            if !self.uncontended_path_available() {
                return self.lock_contended();
            }
            core::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        let old = self.word.swap(UNLOCKED, ORD_SEQ);
        debug_assert_ne!(old, UNLOCKED, "unlock of an unowned mutex");
        if old & CONTENDED_MASK != 0 {
            MUTEX_LOT.unpark(self.addr(), |_| UnparkControl::RemoveBreak);
        }
    }

    /// Spin while the lock looks takeable. Returns false once the contended
    /// bit is set (by us or somebody else), which is the signal to park.
    fn uncontended_path_available(&self) -> bool {
        loop {
            let old = self.word.load(ORD_SEQ);
            if old == UNLOCKED {
                return true;
            }
            if old & CONTENDED_MASK != 0
                || self
                    .word
                    .compare_exchange(old, old | CONTENDED_MASK, ORD_SEQ, ORD_RLX)
                    .is_ok()
            {
                return false;
            }
            core::hint::spin_loop();
        }
    }

    /// Acquire with the contended bit set so the next unlock knows to wake
    /// someone.
    #[inline]
    fn try_lock_contended(&self) -> bool {
        self.word
            .compare_exchange(
                UNLOCKED,
                registry::thread_id() as u32 | CONTENDED_MASK,
                ORD_SEQ,
                ORD_RLX,
            )
            .is_ok()
    }

    fn lock_contended(&self) -> LockResult {
        while !self.try_lock_contended() {
            if self.park() {
                return LockResult::Deadlocked;
            }
        }
        LockResult::Locked
    }

    /// true iff a verified deadlock was detected and the wait abandoned
    fn park(&self) -> bool {
        if DEADLOCK_SAFE {
            self.announce_wait();
            let res = MUTEX_LOT.park_for(
                self.addr(),
                0,
                || self.is_contended(),
                || {},
                DEADLOCK_DETECT_TIMEOUT,
            );
            if res == ParkResult::Timeout && self.check_deadlock() {
                // check_deadlock cleared our wait entry under the verify lock
                return true;
            }
            self.denounce_wait();
        } else {
            MUTEX_LOT.park(self.addr(), 0, || self.is_contended(), || {});
        }
        false
    }

    fn announce_wait(&self) {
        WAITING_ON[registry::thread_id()].store(self.addr() as *mut (), ORD_SEQ);
    }

    fn denounce_wait(&self) {
        WAITING_ON[registry::thread_id()].store(core::ptr::null_mut(), ORD_SEQ);
    }

    /// Walk holder → waited-on edges starting from this mutex. The wait
    /// table is racy, so a discovered cycle is only trusted after every edge
    /// re-checks under the global verify mutex.
    ///
    /// Deadlock-safe mutexes taking part in detection are expected to be
    /// long-lived: the walk dereferences mutex addresses published by other
    /// threads.
    fn check_deadlock(&self) -> bool {
        let mut waiters: HashMap<usize, usize> = HashMap::new();

        let detected = {
            let mut waiting_on = self.addr();
            waiters.insert(registry::thread_id(), waiting_on);
            loop {
                let word = unsafe {
                    // UNSAFE: announced addresses point at live mutexes by
                    // the documented lifetime contract
                    (*(waiting_on as *const Self)).word.load(ORD_SEQ)
                };
                let holder = word & !CONTENDED_MASK;
                if holder == UNLOCKED {
                    // lock was released while we walked
                    break false;
                }
                let next = WAITING_ON[holder as usize].load(ORD_SEQ) as usize;
                if next == 0 {
                    // the holder is running, not waiting
                    break false;
                }
                if waiters.contains_key(&(holder as usize)) {
                    break true;
                }
                waiters.insert(holder as usize, next);
                waiting_on = next;
            }
        };
        if !detected {
            return false;
        }

        // suspicion only; every edge must still hold under the verify lock
        let _verify = DEADLOCK_VERIFY.lock();
        for (&tid, &mtx) in &waiters {
            if WAITING_ON[tid].load(ORD_SEQ) as usize != mtx {
                return false;
            }
        }
        log::warn!(
            "abandoning lock wait: verified a {}-thread wait cycle",
            waiters.len()
        );
        self.denounce_wait();
        true
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::sync::registry,
        core::{cell::UnsafeCell, sync::atomic::AtomicUsize},
        std::{sync::Arc, thread, time::Duration},
    };

    struct Shared {
        m: Mutex,
        v: UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}

    #[test]
    fn mutual_exclusion() {
        const PER_THREAD: u64 = 50_000;
        let shared = Arc::new(Shared {
            m: Mutex::new(),
            v: UnsafeCell::new(0),
        });
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    registry::register().unwrap();
                    for _ in 0..PER_THREAD {
                        shared.m.lock();
                        unsafe {
                            *shared.v.get() += 1;
                        }
                        shared.m.unlock();
                    }
                    registry::unregister();
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().unwrap());
        registry::register().unwrap();
        shared.m.lock();
        assert_eq!(unsafe { *shared.v.get() }, 4 * PER_THREAD);
        shared.m.unlock();
        registry::unregister();
    }

    #[test]
    fn try_lock_reports_owner_conflicts() {
        registry::register().unwrap();
        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
        registry::unregister();
    }

    #[test]
    fn two_thread_cycle_is_detected() {
        // A takes m1 then wants m2; B takes m2 then wants m1. Exactly the
        // wait cycle the 1s timeout plus verification pass must break.
        let m1 = Arc::new(DeadlockSafeMutex::new());
        let m2 = Arc::new(DeadlockSafeMutex::new());
        let deadlocks = Arc::new(AtomicUsize::new(0));

        let spawn_side = |first: Arc<DeadlockSafeMutex>,
                          second: Arc<DeadlockSafeMutex>,
                          deadlocks: Arc<AtomicUsize>| {
            thread::spawn(move || {
                registry::register().unwrap();
                assert_eq!(first.lock(), LockResult::Locked);
                // ensure both sides hold their first lock before crossing
                thread::sleep(Duration::from_millis(200));
                match second.lock() {
                    LockResult::Locked => second.unlock(),
                    LockResult::Deadlocked => {
                        deadlocks.fetch_add(1, ORD_SEQ);
                    }
                }
                first.unlock();
                registry::unregister();
            })
        };

        let a = spawn_side(m1.clone(), m2.clone(), deadlocks.clone());
        let b = spawn_side(m2, m1, deadlocks.clone());
        a.join().unwrap();
        b.join().unwrap();
        // at least one side must have observed the cycle and backed off
        assert!(deadlocks.load(ORD_SEQ) >= 1);
    }
}
