/*
 * Created on Tue Mar 19 2024
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

pub mod art;
pub mod btree;
pub mod hashtable;
#[cfg(test)]
mod tests;

// re-exports
pub type OrderedMap<K, V> = btree::ConcurrentMap<K, V, btree::DefTreeConfig>;
pub type RadixMap<V> = art::ConcurrentMap<u64, V>;
pub type HashMap<K, V> = hashtable::ConcurrentMap<
    K,
    V,
    std::collections::hash_map::RandomState,
    hashtable::DefHashConfig,
>;

/// The operation surface every concurrent index in this crate exposes.
/// Callers must hold a registry slot ([`crate::sync::registry::register`])
/// before invoking any method.
///
/// `len` is approximate while writers are active and exact at quiescence.
pub trait ConcurrentIndex<K, V> {
    /// true iff the key was newly added
    fn insert(&self, key: K, val: V) -> bool;
    /// insert-or-replace; returns the previous value if one existed
    fn upsert(&self, key: K, val: V) -> Option<V>;
    /// replace only; no-op on absent keys
    fn update(&self, key: &K, val: V) -> Option<V>;
    fn search(&self, key: &K) -> Option<V>;
    /// returns the removed value, if any
    fn remove(&self, key: &K) -> Option<V>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
