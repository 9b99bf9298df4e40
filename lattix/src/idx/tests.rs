/*
 * Created on Mon Apr 22 2024
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

//! One harness, three indexes: every map behind [`ConcurrentIndex`] has to
//! survive the same single-threaded oracle run and the same multi-threaded
//! insert / swap / delete gauntlet.

use {
    super::{ConcurrentIndex, HashMap, OrderedMap, RadixMap},
    crate::sync::registry,
    rand::{prelude::SliceRandom, Rng},
    std::{sync::Arc, thread},
};

struct Registered;

impl Registered {
    fn acquire() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        registry::register().unwrap();
        Self
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        registry::unregister();
    }
}

fn unique_shuffled_keys(count: usize) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<u64> = (0..count as u64).map(|k| k * 7 + 1).collect();
    keys.shuffle(&mut rng);
    keys
}

/// single-threaded mixed workload checked against a standard ordered map
fn oracle_exercise<M: ConcurrentIndex<u64, u64>>(map: M) {
    let _slot = Registered::acquire();
    const OPS: usize = 1 << 18;
    let cardinality = (OPS / 10) as u64;
    let mut rng = rand::thread_rng();
    let mut oracle = std::collections::BTreeMap::<u64, u64>::new();

    for _ in 0..OPS {
        let key = rng.gen_range(1..=cardinality);
        match rng.gen_range(0..3) {
            0 => {
                let val: u64 = rng.gen();
                match oracle.insert(key, val) {
                    Some(old) => {
                        assert_eq!(map.update(&key, val), Some(old));
                    }
                    None => {
                        assert!(map.insert(key, val));
                        assert_eq!(map.search(&key), Some(val));
                    }
                }
            }
            1 => {
                assert_eq!(map.search(&key), oracle.get(&key).copied());
            }
            _ => {
                assert_eq!(map.remove(&key), oracle.remove(&key));
            }
        }
    }

    assert_eq!(map.len(), oracle.len());
    for (key, val) in oracle {
        assert_eq!(map.remove(&key), Some(val));
    }
    assert_eq!(map.len(), 0);
}

enum Phase {
    Insert,
    DeleteAndInsert,
    Delete,
}

/// the multi-threaded gauntlet: disjoint-slice inserts with a scanning
/// reader, then a full contended delete-and-reinsert swap, then teardown
fn concurrent_exercise<M>(map: M)
where
    M: ConcurrentIndex<u64, u64> + Send + Sync + 'static,
{
    let _slot = Registered::acquire();
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1 << 14;

    let map = Arc::new(map);
    let keys = Arc::new(unique_shuffled_keys(THREADS * PER_THREAD));

    let run_phase = |phase: &'static Phase| {
        let mut workers: Vec<thread::JoinHandle<()>> = (0..THREADS)
            .map(|t| {
                let map = map.clone();
                let keys = keys.clone();
                thread::spawn(move || {
                    registry::register().unwrap();
                    for &key in &keys[t * PER_THREAD..(t + 1) * PER_THREAD] {
                        match phase {
                            Phase::Insert => {
                                assert!(map.insert(key, key));
                                assert_eq!(map.search(&key), Some(key));
                            }
                            Phase::DeleteAndInsert => {
                                assert_eq!(map.remove(&key), Some(key));
                                assert!(map.insert(key, key));
                            }
                            Phase::Delete => {
                                assert_eq!(map.remove(&key), Some(key));
                                assert_eq!(map.search(&key), None);
                            }
                        }
                    }
                    registry::unregister();
                })
            })
            .collect();
        // a reader scanning the full key set while the writers run
        workers.push({
            let map = map.clone();
            let keys = keys.clone();
            thread::spawn(move || {
                registry::register().unwrap();
                for &key in keys.iter() {
                    let _ = map.search(&key);
                }
                registry::unregister();
            })
        });
        workers.into_iter().for_each(|w| w.join().unwrap());
    };

    run_phase(&Phase::Insert);
    assert_eq!(map.len(), keys.len());
    for &key in keys.iter() {
        assert_eq!(map.search(&key), Some(key), "missing after insert phase");
    }

    run_phase(&Phase::DeleteAndInsert);
    assert_eq!(map.len(), keys.len());
    for &key in keys.iter() {
        assert_eq!(map.search(&key), Some(key), "missing after swap phase");
    }

    run_phase(&Phase::Delete);
    assert_eq!(map.len(), 0);
}

#[test]
fn oracle_btree() {
    oracle_exercise(OrderedMap::<u64, u64>::new());
}

#[test]
fn oracle_art() {
    oracle_exercise(RadixMap::<u64>::new());
}

#[test]
fn oracle_hashtable() {
    oracle_exercise(HashMap::<u64, u64>::new());
}

#[test]
fn gauntlet_btree() {
    concurrent_exercise(OrderedMap::<u64, u64>::new());
}

#[test]
fn gauntlet_art() {
    concurrent_exercise(RadixMap::<u64>::new());
}

#[test]
fn gauntlet_hashtable() {
    concurrent_exercise(HashMap::<u64, u64>::new());
}
