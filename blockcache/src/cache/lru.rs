use std::{hash::Hasher, sync::Arc};

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use super::{AtomicCacheStats, CacheEntry, CacheStats, Deleter, Entry, Options};
use crate::{
    error::{Error, Result},
    util::{
        atomic::Sequencer,
        slab::{EntryId, EntrySlab},
    },
};

/// Shard counts above this would leave too few hash bits for bucket
/// placement.
const MAX_SHARD_BITS: u32 = 20;

/// A sharded, reference-counted LRU cache mapping opaque byte-string keys to
/// values.
///
/// The cache is split into independent shards, each guarded by its own mutex,
/// selected by the high bits of the key hash. Every public operation hashes
/// the key once, takes exactly one shard lock, and completes without blocking
/// on anything else.
///
/// [`insert`] and [`lookup`] return a [`CacheEntry`] guard holding one
/// reference to the entry. An entry stays alive until it is both unreachable
/// from the cache index (evicted, erased, or replaced) and all guards have
/// been dropped; an entry that is still checked out is a legal eviction
/// candidate, it just outlives its eviction.
///
/// [`insert`]: LruCache::insert
/// [`lookup`]: LruCache::lookup
pub struct LruCache<V: Clone> {
    shards: Vec<Mutex<LruShard<V>>>,
    shard_bits: u32,
    next_id: Sequencer,
    stats: Vec<Arc<AtomicCacheStats>>,
}

impl<V: Clone> LruCache<V> {
    /// Creates a cache with `capacity` total charge units and a shard count
    /// derived from the capacity.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, derive_shard_bits(capacity))
    }

    /// Creates a cache from `options`, validating them first.
    pub fn with_options(options: Options) -> Result<Self> {
        let shard_bits = match options.shard_bits {
            Some(bits) if bits >= MAX_SHARD_BITS => return Err(Error::InvalidArgument),
            Some(bits) => bits,
            None => derive_shard_bits(options.capacity),
        };
        Ok(Self::build(options.capacity, shard_bits))
    }

    fn build(capacity: usize, shard_bits: u32) -> Self {
        let num_shards = 1usize << shard_bits;
        let per_shard = (capacity + num_shards - 1) / num_shards;
        let mut shards = Vec::with_capacity(num_shards);
        let mut stats = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            let shard = LruShard::new(per_shard);
            stats.push(shard.stats.clone());
            shards.push(Mutex::new(shard));
        }
        debug!("lru cache with {num_shards} shards, {per_shard} charge units each");
        Self {
            shards,
            shard_bits,
            next_id: Sequencer::new(),
            stats,
        }
    }

    /// Inserts a key/value pair with the given charge, replacing any entry
    /// already stored under the same key. Always succeeds; if the new entry
    /// pushes the shard over capacity, entries are evicted in LRU order
    /// until usage fits or the shard is empty, which may evict the entry
    /// just inserted.
    ///
    /// The returned guard holds a reference to the new entry.
    pub fn insert(self: &Arc<Self>, key: &[u8], value: V, charge: usize) -> CacheEntry<V> {
        self.insert_impl(key, value, charge, None)
    }

    /// Like [`insert`], with a cleanup action invoked with the entry's key
    /// and value when its last reference is dropped.
    ///
    /// The deleter runs while the owning shard's lock is held, so it must
    /// not call back into the cache.
    ///
    /// [`insert`]: LruCache::insert
    pub fn insert_with_deleter(
        self: &Arc<Self>,
        key: &[u8],
        value: V,
        charge: usize,
        deleter: Deleter<V>,
    ) -> CacheEntry<V> {
        self.insert_impl(key, value, charge, Some(deleter))
    }

    fn insert_impl(
        self: &Arc<Self>,
        key: &[u8],
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> CacheEntry<V> {
        let hash = hash_key(key);
        let idx = self.shard(hash);
        let key = Bytes::copy_from_slice(key);
        let id = {
            let mut shard = self.shards[idx].lock();
            shard.insert(key.clone(), hash, value.clone(), charge, deleter)
        };
        CacheEntry {
            cache: self.clone(),
            shard: idx,
            id,
            key,
            value,
            charge,
        }
    }

    /// Returns a guard for the entry stored under `key`, or `None`. A hit
    /// moves the entry to the most-recently-used end of its shard's ring.
    pub fn lookup(self: &Arc<Self>, key: &[u8]) -> Option<CacheEntry<V>> {
        let hash = hash_key(key);
        let idx = self.shard(hash);
        let hit = self.shards[idx].lock().lookup(key, hash);
        let (id, key, value, charge) = hit?;
        Some(CacheEntry {
            cache: self.clone(),
            shard: idx,
            id,
            key,
            value,
            charge,
        })
    }

    /// Removes the entry stored under `key` from the cache index, if any.
    /// Outstanding guards remain valid; the key is immediately unavailable
    /// to future lookups.
    pub fn erase(&self, key: &[u8]) {
        let hash = hash_key(key);
        let idx = self.shard(hash);
        self.shards[idx].lock().erase(key, hash);
    }

    /// Returns a numeric id that no other call to `new_id` on this cache has
    /// returned or will return, starting at 1. Subsystems sharing one cache
    /// instance use these to partition the key namespace by prefix.
    pub fn new_id(&self) -> u64 {
        self.next_id.next()
    }

    /// Returns the sum of the charges of all entries currently reachable
    /// from the cache index.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.lock().usage).sum()
    }

    /// Returns activity counters aggregated across all shards.
    pub fn stats(&self) -> CacheStats {
        let mut summary = CacheStats::default();
        for s in &self.stats {
            summary = summary.add(&s.snapshot());
        }
        summary
    }

    pub(crate) fn release(&self, shard: usize, id: EntryId) {
        self.shards[shard].lock().release(id);
    }

    #[inline]
    fn shard(&self, hash: u32) -> usize {
        // High bits select the shard, leaving the low bits for bucket
        // placement within the shard's table.
        if self.shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.shard_bits)) as usize
        }
    }
}

fn hash_key(key: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    let hash = hasher.finish();
    ((hash >> 32) ^ hash) as u32
}

fn derive_shard_bits(capacity: usize) -> u32 {
    const MIN_SHARD_SIZE: usize = 32 << 20;
    let mut bits = 0;
    let mut shards = capacity / MIN_SHARD_SIZE;
    while shards > 0 && bits < 6 {
        shards >>= 1;
        bits += 1;
    }
    bits
}

/// One cache shard: a hash table for reachability, an LRU ring for eviction
/// order, and a capacity/usage pair, all mutated under the owning mutex.
struct LruShard<V: Clone> {
    slab: EntrySlab<Entry<V>>,
    table: HandleTable,
    capacity: usize,
    usage: usize,
    // Ring sentinel. `next_lru` of the sentinel is the least-recently-used
    // entry, `prev_lru` the most-recently-used.
    lru: EntryId,
    stats: Arc<AtomicCacheStats>,
}

impl<V: Clone> LruShard<V> {
    fn new(capacity: usize) -> Self {
        let mut slab = EntrySlab::new();
        let lru = slab.insert(Entry::sentinel());
        slab[lru].prev_lru = lru;
        slab[lru].next_lru = lru;
        Self {
            slab,
            table: HandleTable::new(),
            capacity,
            usage: 0,
            lru,
            stats: Arc::new(AtomicCacheStats::default()),
        }
    }

    fn insert(
        &mut self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> EntryId {
        let id = self.slab.insert(Entry::new(key, hash, value, charge, deleter));
        self.lru_append(id);
        self.usage += charge;
        if let Some(old) = self.table.insert(&mut self.slab, id) {
            self.lru_remove(old);
            self.usage -= self.slab[old].charge;
            self.unref(old);
        }
        self.stats.insert.inc();
        self.evict_from_lru();
        id
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> Option<(EntryId, Bytes, V, usize)> {
        let id = self.table.lookup(&self.slab, key, hash);
        if id.is_nil() {
            self.stats.lookup_miss.inc();
            return None;
        }
        self.lru_remove(id);
        self.lru_append(id);
        let e = &mut self.slab[id];
        e.refs += 1;
        self.stats.lookup_hit.inc();
        let value = e.value.clone().unwrap();
        Some((id, e.key.clone(), value, e.charge))
    }

    fn erase(&mut self, key: &[u8], hash: u32) {
        let id = self.table.remove(&mut self.slab, key, hash);
        if !id.is_nil() {
            self.lru_remove(id);
            self.usage -= self.slab[id].charge;
            self.unref(id);
            self.stats.active_evict.inc();
        }
    }

    fn release(&mut self, id: EntryId) {
        self.unref(id);
    }

    /// Drops one reference; at zero the slot is vacated and the deleter
    /// runs. The table's reference must already have been dropped by then.
    fn unref(&mut self, id: EntryId) {
        let e = &mut self.slab[id];
        debug_assert!(e.refs > 0);
        e.refs -= 1;
        if e.refs == 0 {
            debug_assert!(!e.is_in_cache());
            let mut e = self.slab.remove(id);
            if let Some(deleter) = e.deleter.take() {
                let value = e.value.take().unwrap();
                deleter(e.key.as_ref(), value);
            }
        }
    }

    fn evict_from_lru(&mut self) {
        while self.usage > self.capacity {
            let oldest = self.slab[self.lru].next_lru;
            if oldest == self.lru {
                break;
            }
            let key = self.slab[oldest].key.clone();
            let hash = self.slab[oldest].hash;
            trace!("evict entry with charge {}", self.slab[oldest].charge);
            let removed = self.table.remove(&mut self.slab, &key, hash);
            debug_assert_eq!(removed, oldest);
            self.lru_remove(oldest);
            self.usage -= self.slab[oldest].charge;
            self.unref(oldest);
            self.stats.passive_evict.inc();
        }
    }

    /// Splices `id` in just before the sentinel, making it the
    /// most-recently-used entry.
    fn lru_append(&mut self, id: EntryId) {
        let tail = self.slab[self.lru].prev_lru;
        self.slab[id].next_lru = self.lru;
        self.slab[id].prev_lru = tail;
        self.slab[tail].next_lru = id;
        self.slab[self.lru].prev_lru = id;
    }

    fn lru_remove(&mut self, id: EntryId) {
        let prev = self.slab[id].prev_lru;
        let next = self.slab[id].next_lru;
        self.slab[prev].next_lru = next;
        self.slab[next].prev_lru = prev;
        self.slab[id].prev_lru = EntryId::NIL;
        self.slab[id].next_lru = EntryId::NIL;
    }
}

impl<V: Clone> Drop for LruShard<V> {
    fn drop(&mut self) {
        // Guards hold an Arc to the cache, so by the time a shard drops,
        // every remaining entry holds exactly the shard's own reference.
        let mut id = self.slab[self.lru].next_lru;
        while id != self.lru {
            let next = self.slab[id].next_lru;
            debug_assert_eq!(self.slab[id].refs, 1);
            self.slab[id].set_in_cache(false);
            self.unref(id);
            id = next;
        }
        // Only the sentinel remains.
        debug_assert_eq!(self.slab.len(), 1);
    }
}

/// Open-chaining hash table from `(key, hash)` to slab index. Buckets hold
/// chain heads; chains are threaded through the entries' `next_hash` links.
struct HandleTable {
    buckets: Vec<EntryId>,
    elems: usize,
}

const INITIAL_BUCKETS: usize = 16;

impl HandleTable {
    fn new() -> Self {
        Self {
            buckets: vec![EntryId::NIL; INITIAL_BUCKETS],
            elems: 0,
        }
    }

    /// Returns the chain predecessor of the entry matching `key`/`hash`
    /// (NIL when the match heads its bucket) and the matching entry itself
    /// (NIL on no match).
    fn find<V: Clone>(
        &self,
        slab: &EntrySlab<Entry<V>>,
        key: &[u8],
        hash: u32,
    ) -> (EntryId, EntryId) {
        let idx = hash as usize & (self.buckets.len() - 1);
        let mut prev = EntryId::NIL;
        let mut cur = self.buckets[idx];
        while !cur.is_nil() {
            let e = &slab[cur];
            if e.hash == hash && e.key.as_ref() == key {
                break;
            }
            prev = cur;
            cur = e.next_hash;
        }
        (prev, cur)
    }

    fn lookup<V: Clone>(&self, slab: &EntrySlab<Entry<V>>, key: &[u8], hash: u32) -> EntryId {
        self.find(slab, key, hash).1
    }

    /// Adds `id` to the table. If an entry with the same key was present,
    /// it is spliced out in place and returned for disposal.
    fn insert<V: Clone>(
        &mut self,
        slab: &mut EntrySlab<Entry<V>>,
        id: EntryId,
    ) -> Option<EntryId> {
        debug_assert!(self.buckets.len().is_power_of_two());
        let hash = slab[id].hash;
        let key = slab[id].key.clone();
        let idx = hash as usize & (self.buckets.len() - 1);
        let (prev, old) = self.find(slab, &key, hash);
        slab[id].set_in_cache(true);
        if old.is_nil() {
            slab[id].next_hash = EntryId::NIL;
            if prev.is_nil() {
                self.buckets[idx] = id;
            } else {
                slab[prev].next_hash = id;
            }
            self.elems += 1;
            if self.elems > self.buckets.len() {
                // Aim for an average chain length <= 1.
                self.resize(slab);
            }
            None
        } else {
            slab[id].next_hash = slab[old].next_hash;
            if prev.is_nil() {
                self.buckets[idx] = id;
            } else {
                slab[prev].next_hash = id;
            }
            slab[old].set_in_cache(false);
            slab[old].next_hash = EntryId::NIL;
            Some(old)
        }
    }

    /// Splices out and returns the entry matching `key`/`hash`, or NIL.
    fn remove<V: Clone>(
        &mut self,
        slab: &mut EntrySlab<Entry<V>>,
        key: &[u8],
        hash: u32,
    ) -> EntryId {
        let idx = hash as usize & (self.buckets.len() - 1);
        let (prev, cur) = self.find(slab, key, hash);
        if cur.is_nil() {
            return EntryId::NIL;
        }
        let next = slab[cur].next_hash;
        if prev.is_nil() {
            self.buckets[idx] = next;
        } else {
            slab[prev].next_hash = next;
        }
        slab[cur].set_in_cache(false);
        slab[cur].next_hash = EntryId::NIL;
        self.elems -= 1;
        cur
    }

    /// Doubles the bucket count until it reaches the smallest power of two
    /// holding `elems`, then rehashes every chain. Grows, never shrinks.
    fn resize<V: Clone>(&mut self, slab: &mut EntrySlab<Entry<V>>) {
        let mut new_len = self.buckets.len();
        while new_len < self.elems {
            new_len <<= 1;
        }
        let mut new_buckets = vec![EntryId::NIL; new_len];
        let mut count = 0;
        for head in std::mem::take(&mut self.buckets) {
            let mut id = head;
            while !id.is_nil() {
                let next = slab[id].next_hash;
                let idx = slab[id].hash as usize & (new_len - 1);
                slab[id].next_hash = new_buckets[idx];
                new_buckets[idx] = id;
                id = next;
                count += 1;
            }
        }
        debug_assert_eq!(count, self.elems);
        self.buckets = new_buckets;
        trace!("resized handle table to {new_len} buckets");
    }
}
