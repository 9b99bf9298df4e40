/*
 * Created on Wed Mar 13 2024
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

//! Dense, stable, bounded thread slot ids.
//!
//! Every thread that touches an index registers here first and receives the
//! smallest free id below [`MAX_THREADS`]. The ids are the subscripts into
//! every per-thread array in the crate (epoch slots, retire lists, size
//! counters, the deadlock wait-for table), which keeps those arrays flat and
//! hash-free on the hot path.

use {
    crate::error::{Error, RuntimeResult},
    core::{
        cell::Cell,
        sync::atomic::{AtomicI64, AtomicUsize},
    },
    std::collections::BTreeSet,
};

use super::{ORD_RLX, ORD_SEQ};

cfg_if::cfg_if! {
    if #[cfg(feature = "max-threads-65536")] {
        /// Ceiling on concurrently registered threads
        pub const MAX_THREADS: usize = 1 << 16;
    } else if #[cfg(feature = "max-threads-4096")] {
        /// Ceiling on concurrently registered threads
        pub const MAX_THREADS: usize = 4096;
    } else {
        /// Ceiling on concurrently registered threads
        pub const MAX_THREADS: usize = 1024;
    }
}

struct SlotState {
    /// ids returned by unregistering threads; the allocator prefers these
    freed: BTreeSet<usize>,
    /// ids in [0, never_used) have been handed out at least once
    never_used: usize,
    in_use: BTreeSet<usize>,
}

static SLOTS: parking_lot::Mutex<SlotState> = parking_lot::Mutex::new(SlotState {
    freed: BTreeSet::new(),
    never_used: 0,
    in_use: BTreeSet::new(),
});

// -1 encodes "no thread registered"; observers may read these without the
// slot lock and can be stale, but never larger than the true value
static MAX_USED_TID: AtomicI64 = AtomicI64::new(-1);
static NUM_REGISTERED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static TID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Allocate a slot id for the calling thread. Idempotent: re-registering an
/// already registered thread is a no-op. Fails only when all [`MAX_THREADS`]
/// slots are taken.
pub fn register() -> RuntimeResult<()> {
    if TID.with(|t| t.get()).is_some() {
        return Ok(());
    }
    let mut slots = SLOTS.lock();
    let id = match slots.freed.pop_first() {
        Some(id) => id,
        None if slots.never_used < MAX_THREADS => {
            let id = slots.never_used;
            slots.never_used += 1;
            id
        }
        None => {
            log::warn!("thread registry exhausted ({MAX_THREADS} slots)");
            return Err(Error::MaxThreadsReached);
        }
    };
    slots.in_use.insert(id);
    MAX_USED_TID.store(*slots.in_use.last().unwrap() as i64, ORD_SEQ);
    NUM_REGISTERED.fetch_add(1, ORD_SEQ);
    TID.with(|t| t.set(Some(id)));
    Ok(())
}

/// Return the calling thread's slot to the registry. A thread that still
/// holds an epoch guard must not unregister. No-op if not registered.
pub fn unregister() {
    let Some(id) = TID.with(|t| t.take()) else {
        return;
    };
    let mut slots = SLOTS.lock();
    slots.in_use.remove(&id);
    slots.freed.insert(id);
    MAX_USED_TID.store(slots.in_use.last().map_or(-1, |&m| m as i64), ORD_SEQ);
    NUM_REGISTERED.fetch_sub(1, ORD_SEQ);
}

/// The calling thread's slot id. Panics in debug builds if the thread never
/// registered; in release the returned id is unspecified garbage (slot 0).
#[inline]
pub fn thread_id() -> usize {
    let tid = TID.with(|t| t.get());
    debug_assert!(tid.is_some(), "unregistered thread entered an index");
    tid.unwrap_or(0)
}

/// Largest id among currently registered threads. May lag behind concurrent
/// registrations, never ahead of them.
#[inline]
pub fn max_thread_id() -> Option<usize> {
    match MAX_USED_TID.load(ORD_SEQ) {
        -1 => None,
        m => Some(m as usize),
    }
}

#[inline]
pub fn num_registered() -> usize {
    NUM_REGISTERED.load(ORD_RLX)
}

/// True iff the calling thread holds a slot
#[inline]
pub fn is_registered() -> bool {
    TID.with(|t| t.get()).is_some()
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread};

    #[test]
    fn register_is_idempotent() {
        register().unwrap();
        let id = thread_id();
        register().unwrap();
        assert_eq!(thread_id(), id);
        unregister();
        unregister();
    }

    #[test]
    fn smallest_free_id_is_reused() {
        register().unwrap();
        let mine = thread_id();
        let stolen = thread::spawn(|| {
            register().unwrap();
            let id = thread_id();
            unregister();
            id
        })
        .join()
        .unwrap();
        // the helper's id went back to the free set; the next registration
        // must pick it up again
        let reused = thread::spawn(|| {
            register().unwrap();
            let id = thread_id();
            unregister();
            id
        })
        .join()
        .unwrap();
        assert_eq!(stolen, reused);
        assert!(max_thread_id().unwrap() >= mine);
        unregister();
    }

    #[test]
    fn observers_track_registration() {
        register().unwrap();
        let before = num_registered();
        thread::spawn(move || {
            register().unwrap();
            assert!(num_registered() >= before + 1);
            assert!(max_thread_id().unwrap() >= thread_id());
            unregister();
        })
        .join()
        .unwrap();
        unregister();
    }
}
