//! An in-memory entry cache for embedded key-value storage engines.
//!
//! BlockCache keeps a fixed-capacity, concurrently-accessible mapping from
//! opaque byte-string keys to decoded values, so that hot data blocks are
//! not decompressed and deserialized over and over. The cache is:
//!
//! - Sharded: lock contention is spread across independent partitions, each
//!   with its own mutex, hash table, and LRU ring.
//! - Reference-counted: [`insert`] and [`lookup`] hand out [`CacheEntry`]
//!   guards; an entry evicted while checked out stays readable through its
//!   guards and is freed only when the last one drops.
//! - Strictly LRU: eviction always removes the least-recently-used entry of
//!   the over-budget shard, whether or not it is checked out.
//!
//! ```
//! use std::sync::Arc;
//! use blockcache::LruCache;
//!
//! let cache = Arc::new(LruCache::new(4 << 20));
//! let block = cache.insert(b"table-7/block-3", Arc::new(vec![0u8; 4096]), 4096);
//! assert_eq!(block.value().len(), 4096);
//! drop(block);
//!
//! let block = cache.lookup(b"table-7/block-3").expect("still resident");
//! assert_eq!(block.charge(), 4096);
//! ```
//!
//! [`insert`]: LruCache::insert
//! [`lookup`]: LruCache::lookup

#![warn(missing_docs, unreachable_pub)]

mod cache;
pub use cache::{lru::LruCache, CacheEntry, CacheStats, Deleter, Options};

mod error;
pub use error::{Error, Result};

mod util;
