/*
 * Created on Thu Apr 4 2024
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

//! An open-addressed concurrent hash map with bounded linear probing.
//!
//! Collisions are threaded through per-bucket `first`/`next` link offsets: a
//! bucket's `first` is the probe distance to the first entry that *hashes to
//! it*, each entry's `next` the distance to the following one. Deletion
//! tombstones the hash word and never rewrites links, preserving probe
//! chains; tombstones are only purged wholesale when an insert overflow
//! forces a cooperative migration to a bigger table.

#[cfg(test)]
mod tests;

use {
    super::ConcurrentIndex,
    crate::{
        mem::CachePadded,
        sync::{registry, EpochManager, Mutex, ORD_ACQ, ORD_REL, ORD_RLX, ORD_SEQ},
    },
    core::{
        cell::UnsafeCell,
        hash::{BuildHasher, Hash},
        mem::MaybeUninit,
        ptr,
        sync::atomic::{
            fence, AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
        },
    },
    std::collections::hash_map::RandomState,
};

/// hash sentinel: bucket never held an entry
const EMPTY_HASH: u64 = u64::MAX;
/// hash sentinel: bucket held an entry that was deleted; keeps probe chains
/// intact and is never reused until migration
const TOMB_STONE_HASH: u64 = EMPTY_HASH - 1;

/// Storage width of the link offsets. The width bounds the longest probe
/// chain a table will grow before migrating.
pub trait LinkWidth: Copy + 'static {
    type Atomic: Default + Sync + Send;
    const MAX: usize;
    fn load(a: &Self::Atomic, ord: core::sync::atomic::Ordering) -> usize;
    fn store(a: &Self::Atomic, v: usize, ord: core::sync::atomic::Ordering);
}

macro_rules! link_width {
    ($($ty:ty => $atomic:ty),*$(,)?) => {
        $(impl LinkWidth for $ty {
            type Atomic = $atomic;
            const MAX: usize = <$ty>::MAX as usize;
            #[inline(always)]
            fn load(a: &Self::Atomic, ord: core::sync::atomic::Ordering) -> usize {
                a.load(ord) as usize
            }
            #[inline(always)]
            fn store(a: &Self::Atomic, v: usize, ord: core::sync::atomic::Ordering) {
                debug_assert!(v <= <Self as LinkWidth>::MAX);
                a.store(v as $ty, ord);
            }
        })*
    };
}

link_width!(u8 => AtomicU8, u16 => AtomicU16, u32 => AtomicU32);

/// Compile-time tuning knobs
pub trait HashConfig: 'static {
    type Link: LinkWidth;
    /// longest single probe chain before an insert reports overflow
    const LINEAR_SEARCH_LIMIT: usize;
}

pub struct DefHashConfig;

impl HashConfig for DefHashConfig {
    type Link = u8;
    const LINEAR_SEARCH_LIMIT: usize = <u8 as LinkWidth>::MAX;
}

struct Bucket<K, V> {
    hash: AtomicU64,
    kv: UnsafeCell<MaybeUninit<(K, V)>>,
}

impl<K, V> Bucket<K, V> {
    fn empty() -> Self {
        Self {
            hash: AtomicU64::new(EMPTY_HASH),
            kv: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
    #[inline(always)]
    fn is_free(&self) -> bool {
        self.hash.load(ORD_ACQ) == EMPTY_HASH
    }
    #[inline(always)]
    fn has_value(&self) -> bool {
        self.hash.load(ORD_ACQ) < TOMB_STONE_HASH
    }
    /// write the pair, then publish it through a release store on the hash
    unsafe fn emplace(&self, hash: u64, key: K, val: V) {
        (self.kv.get() as *mut (K, V)).write((key, val));
        self.hash.store(hash, ORD_REL);
    }
    #[inline(always)]
    unsafe fn pair(&self) -> *mut (K, V) {
        self.kv.get() as *mut (K, V)
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        // tombstoned pairs were moved out at delete time; only live ones
        // still own their contents
        if self.has_value() {
            unsafe {
                // UNSAFE: initialized iff live
                ptr::drop_in_place(self.pair());
            }
        }
    }
}

#[derive(Default)]
struct PerThreadStats {
    num_values: AtomicUsize,
    num_tomb_stones: AtomicUsize,
}

struct Link<L: LinkWidth> {
    first: L::Atomic,
    next: L::Atomic,
    m: Mutex,
}

impl<L: LinkWidth> Default for Link<L> {
    fn default() -> Self {
        Self {
            first: L::Atomic::default(),
            next: L::Atomic::default(),
            m: Mutex::new(),
        }
    }
}

struct SearchResult<C: HashConfig> {
    hash: u64,
    bucket: usize,
    /// the link field that terminated (or located) the chain; the insert
    /// commit publishes the new bucket through it
    link: *const <C::Link as LinkWidth>::Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertResult {
    New,
    AlreadyPresent,
    Overflow,
}

/// probe outcome; for `New`/`AlreadyPresent` the bucket named by `sres` is
/// returned with its mutex held
struct InsertProbe<C: HashConfig> {
    result: InsertResult,
    bucket_link: usize,
    sres: SearchResult<C>,
}

struct HashTable<K, V, C: HashConfig> {
    num_buckets: usize,
    stats: Box<[CachePadded<PerThreadStats>]>,
    buckets: Box<[Bucket<K, V>]>,
    links: Box<[Link<C::Link>]>,
}

impl<K, V, C> HashTable<K, V, C>
where
    K: Eq,
    C: HashConfig,
{
    fn new(initial_num_buckets: usize) -> Self {
        let num_buckets = initial_num_buckets.max(MINIMUM_CAPACITY).next_power_of_two();
        Self {
            num_buckets,
            stats: (0..registry::MAX_THREADS)
                .map(|_| CachePadded::new(PerThreadStats::default()))
                .collect(),
            buckets: (0..num_buckets).map(|_| Bucket::empty()).collect(),
            links: (0..num_buckets).map(|_| Link::default()).collect(),
        }
    }

    #[inline(always)]
    fn ideal_bucket(&self, hash: u64) -> usize {
        hash as usize & (self.num_buckets - 1)
    }

    #[inline(always)]
    fn step(&self, bucket: usize, link: usize) -> usize {
        (bucket + link) & (self.num_buckets - 1)
    }

    /// candidate match: published hash, then the key behind it
    fn bucket_equals(&self, bucket: usize, hash: u64, key: &K) -> bool {
        self.buckets[bucket].hash.load(ORD_ACQ) == hash
            && unsafe {
                // UNSAFE: an acquire load of a live hash makes the pair
                // visible; tombstoned bits stay comparable until the epoch
                // reclaim drops the moved-out copy
                (*self.buckets[bucket].pair()).0 == *key
            }
    }

    fn search(&self, hash: u64, key: &K) -> (bool, SearchResult<C>) {
        let mut bucket = self.ideal_bucket(hash);
        let mut link: &<C::Link as LinkWidth>::Atomic = &self.links[bucket].first;
        if self.bucket_equals(bucket, hash, key) {
            return (true, SearchResult { hash, bucket, link });
        }
        let mut offset = C::Link::load(link, ORD_ACQ);
        while offset != 0 {
            bucket = self.step(bucket, offset);
            link = &self.links[bucket].next;
            if self.bucket_equals(bucket, hash, key) {
                return (true, SearchResult { hash, bucket, link });
            }
            offset = C::Link::load(link, ORD_ACQ);
        }
        (false, SearchResult { hash, bucket, link })
    }

    /// scan outward from the chain tail for a reusable bucket
    fn free_bucket_for(&self, sres: &SearchResult<C>) -> Option<usize> {
        let mut bucket = sres.bucket;
        let mut link = 0;
        while link <= C::LINEAR_SEARCH_LIMIT && link < self.num_buckets {
            if self.buckets[bucket].is_free() {
                return Some(link);
            }
            link += 1;
            bucket = self.step(sres.bucket, link);
        }
        None
    }

    /// resolve where `key` goes. `New` and `AlreadyPresent` come back with
    /// the target bucket's mutex held; the caller must release it.
    fn probe_insert(&self, hash: u64, key: &K) -> InsertProbe<C> {
        loop {
            let (found, sres) = self.search(hash, key);
            if found {
                self.links[sres.bucket].m.lock();
                if self.buckets[sres.bucket].has_value() {
                    return InsertProbe {
                        result: InsertResult::AlreadyPresent,
                        bucket_link: 0,
                        sres,
                    };
                }
                // tombstoned underneath us; rewalk the chain
                self.links[sres.bucket].m.unlock();
                continue;
            }
            match self.free_bucket_for(&sres) {
                Some(bucket_link) => {
                    let target = self.step(sres.bucket, bucket_link);
                    self.links[target].m.lock();
                    if self.buckets[target].is_free() {
                        self.bump_num_values();
                        return InsertProbe {
                            result: InsertResult::New,
                            bucket_link,
                            sres: SearchResult {
                                hash,
                                bucket: target,
                                link: sres.link,
                            },
                        };
                    }
                    // lost the bucket to a racing insert
                    self.links[target].m.unlock();
                }
                None => {
                    return InsertProbe {
                        result: InsertResult::Overflow,
                        bucket_link: 0,
                        sres,
                    }
                }
            }
        }
    }

    /// fill the probed bucket and splice it into its chain. The probe's
    /// bucket mutex must be held.
    unsafe fn commit_insert(&self, probe: &InsertProbe<C>, key: K, val: V) {
        debug_assert!(probe.result == InsertResult::New);
        self.buckets[probe.sres.bucket].emplace(probe.sres.hash, key, val);
        C::Link::store(&*probe.sres.link, probe.bucket_link, ORD_REL);
    }

    #[inline]
    fn unlock_bucket(&self, bucket: usize) {
        self.links[bucket].m.unlock();
    }

    fn bump_num_values(&self) {
        let v = &self.stats[registry::thread_id()].num_values;
        v.store(v.load(ORD_RLX) + 1, ORD_RLX);
    }

    fn bump_num_tomb_stones(&self) {
        let v = &self.stats[registry::thread_id()].num_tomb_stones;
        v.store(v.load(ORD_RLX) + 1, ORD_RLX);
    }

    fn stat_totals(&self) -> (usize, usize) {
        let mut num_values = 0usize;
        let mut num_tomb_stones = 0usize;
        for slot in self.stats.iter() {
            num_values = num_values.wrapping_add(slot.num_values.load(ORD_RLX));
            num_tomb_stones = num_tomb_stones.wrapping_add(slot.num_tomb_stones.load(ORD_RLX));
        }
        (num_values, num_tomb_stones)
    }
}

pub const MINIMUM_CAPACITY: usize = 4;

/// Concurrent open-addressed hash map. See the module docs for the probing
/// scheme; concurrency is one bucket mutex at a time plus a cooperative
/// migration protocol driven by insert overflow.
pub struct ConcurrentMap<K, V, S = RandomState, C = DefHashConfig>
where
    C: HashConfig,
{
    table: AtomicPtr<HashTable<K, V, C>>,
    is_migration_in_progress: AtomicBool,
    migration_mutex: Mutex,
    num_migrations: AtomicUsize,
    hash_state: S,
    gc: EpochManager<()>,
}

unsafe impl<K, V, S, C> Send for ConcurrentMap<K, V, S, C>
where
    K: Send,
    V: Send,
    S: Send,
    C: HashConfig,
{
}
unsafe impl<K, V, S, C> Sync for ConcurrentMap<K, V, S, C>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    C: HashConfig,
{
}

unsafe fn drop_table<K, V, C: HashConfig>(table: *mut ()) {
    drop(Box::from_raw(table as *mut HashTable<K, V, C>));
}

unsafe fn drop_pair<K, V>(pair: *mut ()) {
    drop(Box::from_raw(pair as *mut (K, V)));
}

impl<K, V, S, C> ConcurrentMap<K, V, S, C>
where
    K: Hash + Eq + Clone,
    V: Copy,
    S: BuildHasher,
    C: HashConfig,
{
    pub fn new() -> Self
    where
        S: Default,
    {
        Self::with_capacity_and_hasher(MINIMUM_CAPACITY, S::default())
    }

    pub fn with_capacity(initial_capacity: usize) -> Self
    where
        S: Default,
    {
        Self::with_capacity_and_hasher(initial_capacity, S::default())
    }

    pub fn with_capacity_and_hasher(initial_capacity: usize, hash_state: S) -> Self {
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(HashTable::new(initial_capacity)))),
            is_migration_in_progress: AtomicBool::new(false),
            migration_mutex: Mutex::new(),
            num_migrations: AtomicUsize::new(0),
            hash_state,
            gc: EpochManager::new(),
        }
    }

    /// the user hash truncated below the sentinel range
    fn hash(&self, key: &K) -> u64 {
        let hash = self.hash_state.hash_one(key);
        if hash < TOMB_STONE_HASH {
            hash
        } else {
            0
        }
    }

    #[inline(always)]
    fn current(&self) -> &HashTable<K, V, C> {
        unsafe {
            // UNSAFE: the table pointer is only swapped, never nulled, and
            // readers sit inside an epoch guard
            &*self.table.load(ORD_ACQ)
        }
    }

    pub fn insert(&self, key: K, val: V) -> bool {
        let hash = self.hash(&key);
        loop {
            {
                let _eg = self.gc.pin();
                let ht = self.current();
                let probe = ht.probe_insert(hash, &key);
                if self.is_migration_in_progress.load(ORD_SEQ) {
                    if probe.result != InsertResult::Overflow {
                        ht.unlock_bucket(probe.sres.bucket);
                    }
                } else {
                    match probe.result {
                        InsertResult::New => {
                            unsafe {
                                // UNSAFE: probe handed us the locked bucket
                                ht.commit_insert(&probe, key, val);
                            }
                            ht.unlock_bucket(probe.sres.bucket);
                            return true;
                        }
                        InsertResult::AlreadyPresent => {
                            ht.unlock_bucket(probe.sres.bucket);
                            return false;
                        }
                        InsertResult::Overflow => {
                            drop(_eg);
                            self.migrate_table();
                            continue;
                        }
                    }
                }
            }
            // a migration is (or was) running; wait it out and retry
            self.wait_for_migration_to_end();
        }
    }

    pub fn upsert(&self, key: K, val: V) -> Option<V> {
        let hash = self.hash(&key);
        loop {
            {
                let _eg = self.gc.pin();
                let ht = self.current();
                let probe = ht.probe_insert(hash, &key);
                if self.is_migration_in_progress.load(ORD_SEQ) {
                    if probe.result != InsertResult::Overflow {
                        ht.unlock_bucket(probe.sres.bucket);
                    }
                } else {
                    match probe.result {
                        InsertResult::New => {
                            unsafe {
                                ht.commit_insert(&probe, key, val);
                            }
                            ht.unlock_bucket(probe.sres.bucket);
                            return None;
                        }
                        InsertResult::AlreadyPresent => {
                            let old = unsafe {
                                // UNSAFE: bucket locked and live
                                ptr::replace(
                                    ptr::addr_of_mut!(
                                        (*ht.buckets[probe.sres.bucket].pair()).1
                                    ),
                                    val,
                                )
                            };
                            ht.unlock_bucket(probe.sres.bucket);
                            return Some(old);
                        }
                        InsertResult::Overflow => {
                            drop(_eg);
                            self.migrate_table();
                            continue;
                        }
                    }
                }
            }
            self.wait_for_migration_to_end();
        }
    }

    pub fn search(&self, key: &K) -> Option<V> {
        let _eg = self.gc.pin();
        let ht = self.current();
        let (found, sres) = ht.search(self.hash(key), key);
        found.then(|| unsafe {
            // UNSAFE: found implies a published pair; V: Copy tolerates a
            // racing exchange
            (*ht.buckets[sres.bucket].pair()).1
        })
    }

    pub fn update(&self, key: &K, val: V) -> Option<V> {
        let hash = self.hash(key);
        loop {
            let migration;
            {
                let _eg = self.gc.pin();
                let ht = self.current();
                let (found, sres) = ht.search(hash, key);
                if !found {
                    return None;
                }
                ht.links[sres.bucket].m.lock();
                migration = self.is_migration_in_progress.load(ORD_SEQ);
                if !migration {
                    if ht.buckets[sres.bucket].has_value() {
                        let old = unsafe {
                            // UNSAFE: bucket locked and live
                            ptr::replace(ptr::addr_of_mut!((*ht.buckets[sres.bucket].pair()).1), val)
                        };
                        ht.unlock_bucket(sres.bucket);
                        return Some(old);
                    }
                    // deleted behind our probe; retry
                    ht.unlock_bucket(sres.bucket);
                    continue;
                }
                ht.unlock_bucket(sres.bucket);
            }
            debug_assert!(migration);
            self.wait_for_migration_to_end();
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        loop {
            let migration;
            {
                let _eg = self.gc.pin();
                let ht = self.current();
                let (found, sres) = ht.search(hash, key);
                if !found {
                    return None;
                }
                ht.links[sres.bucket].m.lock();
                migration = self.is_migration_in_progress.load(ORD_SEQ);
                if !migration {
                    if ht.buckets[sres.bucket].has_value() {
                        let bucket = &ht.buckets[sres.bucket];
                        let val = unsafe { (*bucket.pair()).1 };
                        // move the pair out before tombstoning: stale readers
                        // may still compare the zombie key bits, so its owned
                        // storage has to outlive every current epoch
                        let moved = unsafe { Box::into_raw(Box::new(ptr::read(bucket.pair()))) };
                        bucket.hash.store(TOMB_STONE_HASH, ORD_REL);
                        ht.bump_num_tomb_stones();
                        unsafe {
                            // UNSAFE: pair ownership moved into the box
                            self.gc
                                .retire_in_new_epoch(drop_pair::<K, V>, &[moved as *mut ()]);
                        }
                        ht.unlock_bucket(sres.bucket);
                        return Some(val);
                    }
                    ht.unlock_bucket(sres.bucket);
                    continue;
                }
                ht.unlock_bucket(sres.bucket);
            }
            debug_assert!(migration);
            self.wait_for_migration_to_end();
        }
    }

    fn wait_for_migration_to_end(&self) {
        self.migration_mutex.lock();
        self.migration_mutex.unlock();
    }

    fn migrate_table(&self) {
        if self.migration_mutex.try_lock() {
            self.is_migration_in_progress.store(true, ORD_SEQ);
            let mut new_num_buckets =
                (self.len().wrapping_mul(2)).max(MINIMUM_CAPACITY).next_power_of_two();
            while !self.try_migrate_table(new_num_buckets) {
                // a chain still overflowed the bound; take a bigger table
                new_num_buckets *= 2;
            }
            self.is_migration_in_progress.store(false, ORD_SEQ);
            self.num_migrations.fetch_add(1, ORD_RLX);
            self.migration_mutex.unlock();
        } else {
            self.wait_for_migration_to_end();
        }
    }

    fn try_migrate_table(&self, new_num_buckets: usize) -> bool {
        let new_ht: Box<HashTable<K, V, C>> = Box::new(HashTable::new(new_num_buckets));
        let old_ht = self.current();
        log::debug!(
            "hash table migration: {} -> {} buckets",
            old_ht.num_buckets,
            new_num_buckets
        );

        for bucket in 0..old_ht.num_buckets {
            old_ht.links[bucket].m.lock();
            let copied = if old_ht.buckets[bucket].has_value() {
                let (key, val, hash) = unsafe {
                    // UNSAFE: live bucket under its lock
                    let pair = &*old_ht.buckets[bucket].pair();
                    (
                        pair.0.clone(),
                        pair.1,
                        old_ht.buckets[bucket].hash.load(ORD_RLX),
                    )
                };
                let probe = new_ht.probe_insert(hash, &key);
                debug_assert_ne!(probe.result, InsertResult::AlreadyPresent);
                if probe.result == InsertResult::Overflow {
                    false
                } else {
                    unsafe {
                        new_ht.commit_insert(&probe, key, val);
                    }
                    new_ht.unlock_bucket(probe.sres.bucket);
                    true
                }
            } else {
                true
            };
            old_ht.links[bucket].m.unlock();
            if !copied {
                return false;
            }
        }

        let old_ptr = self.table.swap(Box::into_raw(new_ht), ORD_SEQ);
        unsafe {
            // UNSAFE: the old table is unreachable for new operations; in-
            // flight readers are covered by their epoch
            self.gc
                .retire_in_new_epoch(drop_table::<K, V, C>, &[old_ptr as *mut ()]);
        }
        true
    }

    /// Σ values − Σ tombstones over the current table; exact at quiescence
    pub fn len(&self) -> usize {
        fence(ORD_SEQ);
        let (num_values, num_tomb_stones) = self.current().stat_totals();
        num_values.wrapping_sub(num_tomb_stones)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// live entries as a percentage of the bucket count
    pub fn load_factor(&self) -> usize {
        let ht = self.current();
        let (num_values, num_tomb_stones) = ht.stat_totals();
        num_values.wrapping_sub(num_tomb_stones) * 100 / ht.num_buckets
    }

    /// current bucket count (always a power of two)
    pub fn capacity(&self) -> usize {
        self.current().num_buckets
    }

    /// completed table migrations over the map's lifetime
    pub fn num_migrations(&self) -> usize {
        self.num_migrations.load(ORD_RLX)
    }
}

impl<K, V, S, C> Default for ConcurrentMap<K, V, S, C>
where
    K: Hash + Eq + Clone,
    V: Copy,
    S: BuildHasher + Default,
    C: HashConfig,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, C> Drop for ConcurrentMap<K, V, S, C>
where
    C: HashConfig,
{
    fn drop(&mut self) {
        // retired tables and moved-out pairs are independent allocations;
        // the epoch manager drains them when it drops right after this
        let table = *self.table.get_mut();
        if !table.is_null() {
            unsafe {
                // UNSAFE: sole owner at drop
                drop(Box::from_raw(table));
            }
        }
    }
}

impl<K, V, S, C> ConcurrentIndex<K, V> for ConcurrentMap<K, V, S, C>
where
    K: Hash + Eq + Clone,
    V: Copy,
    S: BuildHasher,
    C: HashConfig,
{
    fn insert(&self, key: K, val: V) -> bool {
        ConcurrentMap::insert(self, key, val)
    }
    fn upsert(&self, key: K, val: V) -> Option<V> {
        ConcurrentMap::upsert(self, key, val)
    }
    fn update(&self, key: &K, val: V) -> Option<V> {
        ConcurrentMap::update(self, key, val)
    }
    fn search(&self, key: &K) -> Option<V> {
        ConcurrentMap::search(self, key)
    }
    fn remove(&self, key: &K) -> Option<V> {
        ConcurrentMap::remove(self, key)
    }
    fn len(&self) -> usize {
        ConcurrentMap::len(self)
    }
}
