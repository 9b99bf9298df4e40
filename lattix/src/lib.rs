/*
 * Created on Mon Mar 11 2024
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

//! # Lattix
//!
//! Concurrent in-memory associative indexes over a shared concurrency
//! substrate:
//!
//! - [`idx::OrderedMap`]: a B+Tree with optimistic reads and
//!   subtree-replacement structural modifications
//! - [`idx::RadixMap`]: an adaptive radix tree over fixed-width integer keys
//! - [`idx::HashMap`]: bounded linear probing with cooperative migration
//!
//! All three defer node destruction through an epoch manager
//! ([`sync::epoch`]), identify threads through a dense slot registry
//! ([`sync::registry`]) and serialize structural changes with a word-sized
//! wait-aware mutex ([`sync::mutex`]) parked on an address-keyed lot
//! ([`sync::parking`]).
//!
//! Every thread touching an index must be registered first:
//!
//! ```
//! use lattix::{idx::HashMap, sync::registry};
//!
//! registry::register().unwrap();
//! let map: HashMap<u64, u64> = HashMap::new();
//! assert!(map.insert(1, 10));
//! assert_eq!(map.search(&1), Some(10));
//! registry::unregister();
//! ```

#[macro_use]
mod macros;
pub mod error;
pub mod idx;
pub mod mem;
pub mod sync;

pub use error::{Error, RuntimeResult};
