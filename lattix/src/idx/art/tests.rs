/*
 * Created on Fri Mar 29 2024
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

use {
    super::*,
    crate::sync::registry,
    rand::{prelude::SliceRandom, Rng},
};

struct Registered;

impl Registered {
    fn acquire() -> Self {
        registry::register().unwrap();
        Self
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        registry::unregister();
    }
}

#[test]
fn empty_tree() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    assert_eq!(map.search(42), None);
    assert_eq!(map.remove(42), None);
    assert_eq!(map.update(42, 0), None);
    assert!(map.is_empty());
}

#[test]
fn single_key_lifecycle() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    assert!(map.insert(99, 1));
    assert!(!map.insert(99, 2), "duplicate insert must fail");
    assert_eq!(map.search(99), Some(1));
    assert_eq!(map.update(99, 3), Some(1));
    assert_eq!(map.upsert(99, 4), Some(3));
    assert_eq!(map.remove(99), Some(4));
    assert_eq!(map.search(99), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn prefix_splits() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    // keys sharing long native-order prefixes force path decompression
    let keys = [
        0u64,
        1,
        1 << 8,
        1 << 16,
        1 << 24,
        (1 << 24) | 1,
        u64::MAX,
        u64::MAX - 1,
    ];
    for &k in &keys {
        assert!(map.insert(k, !k), "insert {k:#x}");
    }
    for &k in &keys {
        assert_eq!(map.search(k), Some(!k), "search {k:#x}");
    }
    assert_eq!(map.len(), keys.len());
}

#[test]
fn node_growth_through_all_arities() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    // 256 keys differing in one byte walk a node from N4 through N256
    for b in 0..256u64 {
        assert!(map.insert(b, b + 7));
    }
    for b in 0..256u64 {
        assert_eq!(map.search(b), Some(b + 7));
    }
    assert_eq!(map.len(), 256);
}

#[test]
fn shrink_after_deletes() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    for b in 0..256u64 {
        assert!(map.insert(b, b));
    }
    // delete down through every shrink threshold
    for b in (2..256u64).rev() {
        assert_eq!(map.remove(b), Some(b));
    }
    assert_eq!(map.search(0), Some(0));
    assert_eq!(map.search(1), Some(1));
    assert_eq!(map.len(), 2);
    assert_eq!(map.remove(0), Some(0));
    assert_eq!(map.remove(1), Some(1));
    assert!(map.is_empty());
    assert_eq!(map.search(0), None);
}

#[test]
fn random_keys_round_trip() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    let mut rng = rand::thread_rng();
    let mut keys: Vec<u64> = (0..(1u64 << 14)).map(|_| rng.gen()).collect();
    keys.sort_unstable();
    keys.dedup();
    for &k in &keys {
        assert!(map.insert(k, k ^ 0x5a5a));
    }
    keys.shuffle(&mut rng);
    for &k in &keys {
        assert_eq!(map.search(k), Some(k ^ 0x5a5a));
    }
    assert_eq!(map.len(), keys.len());
    for &k in &keys {
        assert_eq!(map.remove(k), Some(k ^ 0x5a5a));
    }
    assert_eq!(map.len(), 0);
}

#[test]
fn u32_keys_work() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u32, u16> = ConcurrentMap::new();
    for k in 0..1024u32 {
        assert!(map.insert(k.wrapping_mul(2654435761), k as u16));
    }
    for k in 0..1024u32 {
        assert_eq!(map.search(k.wrapping_mul(2654435761)), Some(k as u16));
    }
}

#[test]
fn reserve_is_a_noop() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64> = ConcurrentMap::new();
    map.reserve(1 << 20);
    assert!(map.is_empty());
}

#[test]
fn concurrent_disjoint_inserts() {
    let _slot = Registered::acquire();
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 8192;
    let map: std::sync::Arc<ConcurrentMap<u64, u64>> = std::sync::Arc::new(ConcurrentMap::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            std::thread::spawn(move || {
                registry::register().unwrap();
                // spread the slices across the key space so threads collide
                // on shared upper nodes
                for i in 0..PER_THREAD {
                    let k = i * THREADS + t;
                    assert!(map.insert(k, k));
                    assert_eq!(map.search(k), Some(k));
                }
                registry::unregister();
            })
        })
        .collect();
    handles.into_iter().for_each(|h| h.join().unwrap());
    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    for k in 0..THREADS * PER_THREAD {
        assert_eq!(map.search(k), Some(k), "key {k} missing");
    }
}
