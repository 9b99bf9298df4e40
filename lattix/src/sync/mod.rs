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

//! The concurrency substrate shared by every index: thread slots, the
//! parking lot, the word-sized mutex and the epoch manager.

pub mod epoch;
pub mod mutex;
pub mod parking;
pub mod registry;

use core::sync::atomic::Ordering;

pub(crate) const ORD_RLX: Ordering = Ordering::Relaxed;
pub(crate) const ORD_ACQ: Ordering = Ordering::Acquire;
pub(crate) const ORD_REL: Ordering = Ordering::Release;
pub(crate) const ORD_SEQ: Ordering = Ordering::SeqCst;

pub use {
    epoch::{EpochGuard, EpochManager},
    mutex::{DeadlockSafeMutex, LockResult, Mutex},
    parking::{ParkResult, ParkingLot, UnparkControl},
};
