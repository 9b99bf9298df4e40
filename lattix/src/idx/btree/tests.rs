/*
 * Created on Fri Apr 19 2024
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
    std::sync::Arc,
};

/// tiny pages hammer the split/trim/merge machinery
struct SmallPages;

impl TreeConfig for SmallPages {
    const NODE_SIZE: usize = 256;
    const MERGE_THRESHOLD: usize = 20;
    const STAT: bool = true;
}

type Map<K, V> = ConcurrentMap<K, V, DefTreeConfig>;
type SmallMap<K, V> = ConcurrentMap<K, V, SmallPages>;

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
fn empty_tree_reads() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    assert_eq!(map.search(&1), None);
    assert_eq!(map.remove(&1), None);
    assert_eq!(map.update(&1, 0), None);
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);
    assert_eq!(map.height(), 0);
}

#[test]
fn single_key_lifecycle() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    assert!(map.insert(5, 50));
    assert!(!map.insert(5, 51));
    assert_eq!(map.search(&5), Some(50));
    assert_eq!(map.update(&5, 52), Some(50));
    assert_eq!(map.upsert(5, 53), Some(52));
    assert_eq!(map.remove(&5), Some(53));
    assert_eq!(map.search(&5), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn ascending_iteration_over_a_thousand_keys() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    for k in 1..=1000u64 {
        assert!(map.insert(k, k * 10));
    }
    let collected: Vec<(u64, u64)> = map.iter().collect();
    assert_eq!(collected.len(), 1000);
    for (i, &(k, v)) in collected.iter().enumerate() {
        assert_eq!(k, i as u64 + 1);
        assert_eq!(v, k * 10);
    }
    let reversed: Vec<u64> = map.iter_rev().map(|(k, _)| k).collect();
    assert_eq!(reversed.len(), 1000);
    assert!(reversed.windows(2).all(|w| w[0] > w[1]));
}

#[test]
fn small_pages_random_bulk() {
    let _slot = Registered::acquire();
    let map: SmallMap<u64, u64> = SmallMap::new();
    let mut rng = rand::thread_rng();
    let mut keys: Vec<u64> = (0..100_000u64).map(|_| rng.gen()).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.shuffle(&mut rng);

    for &k in &keys {
        assert!(map.insert(k, !k));
    }
    assert_eq!(map.len(), keys.len());
    for &k in &keys {
        assert_eq!(map.search(&k), Some(!k));
    }
    // trees this deep must have split a few times
    assert!(map.stats().num_leaf_splits() > 0);
    assert!(map.height() >= 2);

    // ordered iteration sees everything exactly once, ascending
    keys.sort_unstable();
    let iterated: Vec<u64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(iterated, keys);
}

#[test]
fn deletes_trigger_merges() {
    let _slot = Registered::acquire();
    let map: SmallMap<u64, u64> = SmallMap::new();
    const N: u64 = 10_000;
    for k in 0..N {
        assert!(map.insert(k, k));
    }
    // delete all but a narrow band; the tree has to collapse back down
    for k in 0..N {
        if !(4000..4016).contains(&k) {
            assert_eq!(map.remove(&k), Some(k));
        }
    }
    assert_eq!(map.len(), 16);
    assert!(map.stats().num_leaf_merges() > 0);
    for k in 4000..4016u64 {
        assert_eq!(map.search(&k), Some(k));
    }
    let all: Vec<u64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(all, (4000..4016u64).collect::<Vec<_>>());
}

#[test]
fn bounds_partition_the_key_space() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    for k in (0..100u64).map(|k| k * 2) {
        assert!(map.insert(k, k));
    }
    // present key: [lower_bound, upper_bound) holds exactly that entry
    let from_lower: Vec<u64> = map.lower_bound(&50).map(|(k, _)| k).take(2).collect();
    let from_upper: Vec<u64> = map.upper_bound(&50).map(|(k, _)| k).take(2).collect();
    assert_eq!(from_lower, vec![50, 52]);
    assert_eq!(from_upper, vec![52, 54]);
    // absent key: both bounds agree on the successor
    assert_eq!(map.lower_bound(&51).next(), Some((52, 52)));
    assert_eq!(map.upper_bound(&51).next(), Some((52, 52)));
    assert_eq!(map.upper_bound(&50).next(), Some((52, 52)));
    // past the end
    assert_eq!(map.lower_bound(&199).next(), None);
}

#[test]
fn upsert_and_update_discriminate_presence() {
    let _slot = Registered::acquire();
    let map: SmallMap<u64, u64> = SmallMap::new();
    for k in 0..2000u64 {
        assert_eq!(map.upsert(k, k), None);
    }
    for k in 0..2000u64 {
        assert_eq!(map.upsert(k, k + 1), Some(k));
        assert_eq!(map.update(&k, k + 2), Some(k + 1));
    }
    assert_eq!(map.update(&9999, 1), None);
    assert_eq!(map.len(), 2000);
    for k in 0..2000u64 {
        assert_eq!(map.search(&k), Some(k + 2));
    }
}

/// descending order through the dynamic comparator interface
struct RevCmp;

impl KeyComparator<u64> for RevCmp {
    fn less(&self, a: &u64, b: &u64) -> bool {
        b < a
    }
    fn equal(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

#[test]
fn dynamic_comparator_orders_the_tree() {
    let _slot = Registered::acquire();
    let map: Map<u64, u64> = Map::new();
    let cmp = RevCmp;
    for k in 0..500u64 {
        assert!(map.insert_with(k, k, &cmp));
    }
    for k in 0..500u64 {
        assert_eq!(map.search_with(&k, &cmp), Some(k));
    }
    // iteration follows the comparator: descending key order
    let keys: Vec<u64> = map.iter_with(&cmp).map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 500);
    assert!(keys.windows(2).all(|w| w[0] > w[1]));
    for k in 0..500u64 {
        assert_eq!(map.remove_with(&k, &cmp), Some(k));
    }
    assert!(map.is_empty());
}

#[test]
fn concurrent_disjoint_inserts() {
    let _slot = Registered::acquire();
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 16_384;
    let map: Arc<SmallMap<u64, u64>> = Arc::new(SmallMap::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            std::thread::spawn(move || {
                registry::register().unwrap();
                for i in 0..PER_THREAD {
                    let k = i * THREADS + t;
                    assert!(map.insert(k, k), "duplicate for {k}");
                    assert_eq!(map.search(&k), Some(k));
                }
                registry::unregister();
            })
        })
        .collect();
    handles.into_iter().for_each(|h| h.join().unwrap());

    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    for k in 0..THREADS * PER_THREAD {
        assert_eq!(map.search(&k), Some(k), "key {k} missing");
    }
    let iterated: Vec<u64> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(iterated, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
}

#[test]
fn readers_run_against_writers() {
    let _slot = Registered::acquire();
    const N: u64 = 8_192;
    let map: Arc<SmallMap<u64, u64>> = Arc::new(SmallMap::new());
    for k in 0..N {
        assert!(map.insert(k, k));
    }
    let writer = {
        let map = map.clone();
        std::thread::spawn(move || {
            registry::register().unwrap();
            // churn the same keys: delete and re-insert forces splits and
            // merges under the readers' feet
            for k in 0..N {
                assert_eq!(map.remove(&k), Some(k));
                assert!(map.insert(k, k + 1));
            }
            registry::unregister();
        })
    };
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let map = map.clone();
            std::thread::spawn(move || {
                registry::register().unwrap();
                for k in 0..N {
                    // value is k before the writer's pass and k+1 after;
                    // absent only in the tiny swap window
                    if let Some(v) = map.search(&k) {
                        assert!(v == k || v == k + 1, "key {k} had value {v}");
                    }
                }
                registry::unregister();
            })
        })
        .collect();
    writer.join().unwrap();
    readers.into_iter().for_each(|r| r.join().unwrap());

    assert_eq!(map.len(), N as usize);
    for k in 0..N {
        assert_eq!(map.search(&k), Some(k + 1));
    }
}
