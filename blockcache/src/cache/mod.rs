use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::util::{atomic::Counter, slab::EntryId};

pub(crate) mod lru;

use lru::LruCache;

/// Cleanup action invoked with an entry's key and value when the last
/// reference to the entry is dropped.
pub type Deleter<V> = Box<dyn FnOnce(&[u8], V) + Send>;

/// A single cached key/value pair plus its bookkeeping: charge, reference
/// count, hash, and the link fields owned by the shard's hash table and LRU
/// ring. Entries live in the owning shard's slab and are addressed by
/// [`EntryId`].
pub(crate) struct Entry<V> {
    key: Bytes,
    hash: u32,
    value: Option<V>,
    charge: usize,
    deleter: Option<Deleter<V>>,

    // One reference for the shard while the entry is reachable from the hash
    // table, plus one per outstanding handle.
    refs: u32,
    flags: EntryFlags,

    // Chain link, owned by the hash table.
    next_hash: EntryId,
    // Ring links, owned by the shard.
    prev_lru: EntryId,
    next_lru: EntryId,
}

bitflags! {
    pub(crate) struct EntryFlags: u8 {
        const IN_CACHE = 0b0000_0001;
    }
}

impl<V> Entry<V> {
    fn new(key: Bytes, hash: u32, value: V, charge: usize, deleter: Option<Deleter<V>>) -> Self {
        Self {
            key,
            hash,
            value: Some(value),
            charge,
            deleter,
            refs: 2,
            flags: EntryFlags::empty(),
            next_hash: EntryId::NIL,
            prev_lru: EntryId::NIL,
            next_lru: EntryId::NIL,
        }
    }

    /// The ring sentinel. Never enters the hash table and never carries a
    /// value or a reference.
    fn sentinel() -> Self {
        Self {
            key: Bytes::new(),
            hash: 0,
            value: None,
            charge: 0,
            deleter: None,
            refs: 0,
            flags: EntryFlags::empty(),
            next_hash: EntryId::NIL,
            prev_lru: EntryId::NIL,
            next_lru: EntryId::NIL,
        }
    }

    #[inline]
    fn is_in_cache(&self) -> bool {
        self.flags.contains(EntryFlags::IN_CACHE)
    }

    #[inline]
    fn set_in_cache(&mut self, in_cache: bool) {
        self.flags.set(EntryFlags::IN_CACHE, in_cache)
    }
}

/// An acquired reference to a cache entry, returned by [`LruCache::insert`]
/// and [`LruCache::lookup`].
///
/// Dropping the guard releases the reference. The entry is deallocated, and
/// its deleter runs, when the last reference is dropped, which may be long
/// after the entry was evicted or erased from the cache index.
pub struct CacheEntry<V: Clone> {
    cache: Arc<LruCache<V>>,
    shard: usize,
    id: EntryId,
    key: Bytes,
    value: V,
    charge: usize,
}

impl<V: Clone> CacheEntry<V> {
    /// Returns the entry's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the entry's value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns the entry's charge against the cache capacity.
    pub fn charge(&self) -> usize {
        self.charge
    }
}

impl<V: Clone> Drop for CacheEntry<V> {
    fn drop(&mut self) {
        self.cache.release(self.shard, self.id);
    }
}

/// Options to configure a cache.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Options {
    /// The total cache capacity, in charge units, split evenly across all
    /// shards.
    ///
    /// Default: 8MB
    pub capacity: usize,

    /// The number of shard-index bits; the cache has `1 << shard_bits`
    /// shards. If `None`, a value is derived from the capacity.
    ///
    /// Default: None
    pub shard_bits: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: 8 << 20,
            shard_bits: None,
        }
    }
}

/// Point-in-time counters of cache activity, aggregated across all shards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub lookup_hit: u64,
    /// Lookups that found nothing.
    pub lookup_miss: u64,
    /// Completed inserts, including same-key replacements.
    pub insert: u64,
    /// Entries removed by an explicit erase.
    pub active_evict: u64,
    /// Entries removed by the capacity-driven eviction pass.
    pub passive_evict: u64,
}

impl CacheStats {
    pub(crate) fn add(&self, o: &CacheStats) -> CacheStats {
        CacheStats {
            lookup_hit: self.lookup_hit + o.lookup_hit,
            lookup_miss: self.lookup_miss + o.lookup_miss,
            insert: self.insert + o.insert,
            active_evict: self.active_evict + o.active_evict,
            passive_evict: self.passive_evict + o.passive_evict,
        }
    }
}

#[derive(Default)]
pub(crate) struct AtomicCacheStats {
    pub(crate) lookup_hit: Counter,
    pub(crate) lookup_miss: Counter,
    pub(crate) insert: Counter,
    pub(crate) active_evict: Counter,
    pub(crate) passive_evict: Counter,
}

impl AtomicCacheStats {
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            lookup_hit: self.lookup_hit.get(),
            lookup_miss: self.lookup_miss.get(),
            insert: self.insert.get(),
            active_evict: self.active_evict.get(),
            passive_evict: self.passive_evict.get(),
        }
    }
}
