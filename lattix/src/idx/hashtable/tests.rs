/*
 * Created on Fri Apr 5 2024
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
    core::hash::Hasher,
    std::collections::hash_map::RandomState,
};

type Map<K, V> = ConcurrentMap<K, V, RandomState, DefHashConfig>;

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
fn insert_search_delete() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    assert!(map.insert(1, 100));
    assert!(!map.insert(1, 200), "duplicate insert must not overwrite");
    assert_eq!(map.search(&1), Some(100));
    assert_eq!(map.remove(&1), Some(100));
    assert_eq!(map.search(&1), None);
    assert_eq!(map.remove(&1), None);
}

#[test]
fn upsert_returns_previous() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    assert_eq!(map.upsert(7, 1), None);
    assert_eq!(map.upsert(7, 2), Some(1));
    assert_eq!(map.search(&7), Some(2));
    assert_eq!(map.len(), 1);
}

#[test]
fn update_requires_presence() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    assert_eq!(map.update(&3, 30), None);
    assert!(map.insert(3, 31));
    assert_eq!(map.update(&3, 32), Some(31));
    assert_eq!(map.search(&3), Some(32));
}

#[test]
fn len_tracks_inserts_and_deletes() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    for k in 0..128u64 {
        assert!(map.insert(k, k * 2));
    }
    assert_eq!(map.len(), 128);
    for k in 0..64u64 {
        assert_eq!(map.remove(&k), Some(k * 2));
    }
    assert_eq!(map.len(), 64);
    assert!(map.load_factor() <= 100);
}

#[test]
fn overflow_forces_migration() {
    let _slot = Registered::acquire();
    // minimum sized table: four buckets, u8 links. Filling well past the
    // initial capacity has to overflow at least one probe chain and trigger
    // a cooperative migration.
    let map: Map<u64, u64> = Map::with_capacity(MINIMUM_CAPACITY);
    assert_eq!(map.capacity(), MINIMUM_CAPACITY);
    for k in 0..512u64 {
        assert!(map.insert(k, !k));
    }
    assert!(map.num_migrations() >= 1);
    assert!(map.capacity() > MINIMUM_CAPACITY);
    for k in 0..512u64 {
        assert_eq!(map.search(&k), Some(!k), "key {k} lost across migration");
    }
    assert_eq!(map.len(), 512);
}

/// every key hashes identically: the worst case for the probe chains
struct Colliding;

impl core::hash::BuildHasher for Colliding {
    type Hasher = CollidingHasher;
    fn build_hasher(&self) -> CollidingHasher {
        CollidingHasher
    }
}

struct CollidingHasher;

impl Hasher for CollidingHasher {
    fn finish(&self) -> u64 {
        42
    }
    fn write(&mut self, _: &[u8]) {}
}

#[test]
fn tombstones_preserve_probe_chains() {
    let _slot = Registered::acquire();
    let map: ConcurrentMap<u64, u64, Colliding, DefHashConfig> =
        ConcurrentMap::with_capacity_and_hasher(64, Colliding);
    for k in 0..16u64 {
        assert!(map.insert(k, k + 1000));
    }
    // delete from the middle of the single shared chain; the entries past
    // the tombstones must stay reachable
    for k in (4..12u64).step_by(2) {
        assert_eq!(map.remove(&k), Some(k + 1000));
    }
    for k in 0..16u64 {
        let expect = if (4..12).contains(&k) && k % 2 == 0 {
            None
        } else {
            Some(k + 1000)
        };
        assert_eq!(map.search(&k), expect, "chain broken at key {k}");
    }
}

#[test]
fn heap_keys_survive_deferred_destruction() {
    let _slot = Registered::acquire();
    let map: Map<String, u32> = Map::new();
    for i in 0..64u32 {
        assert!(map.insert(format!("key-{i}"), i));
    }
    for i in 0..64u32 {
        assert_eq!(map.remove(&format!("key-{i}")), Some(i));
    }
    assert_eq!(map.len(), 0);
    // re-filling forces fresh buckets plus an eventual migration over the
    // tombstone-riddled table
    for i in 0..64u32 {
        assert!(map.insert(format!("key-{i}"), i + 1));
    }
    for i in 0..64u32 {
        assert_eq!(map.search(&format!("key-{i}")), Some(i + 1));
    }
}
