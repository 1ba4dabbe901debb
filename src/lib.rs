//! tilecache - Tile-Oriented Concurrent Content Cache
//!
//! A cache for computed artifacts (image tiles and arbitrary serializable
//! entries) keyed by a 64-bit content hash, shared across threads and
//! optionally persisted through memory-mapped files.
//!
//! # Guarantees
//!
//! - An expensive computation for a given key runs on at most one thread at
//!   a time; everyone else reuses the cached result or waits for it
//! - Memory stays bounded through least-recently-used eviction that never
//!   blocks producers on payload teardown
//! - Fixed-size storage tiles are allocated and released safely under a
//!   lock/unlock/release protocol
//!
//! # Example
//!
//! ```no_run
//! use tilecache::{Cache, CacheConfig, CacheEntryStatus};
//! # use tilecache::{CacheEntry, ContentHash};
//! # struct Rendered { hash: u64 }
//! # impl CacheEntry for Rendered {
//! #     fn content_hash(&self) -> ContentHash { self.hash }
//! #     fn size_bytes(&self) -> usize { 0 }
//! # }
//!
//! let cache = Cache::create(CacheConfig::volatile()).unwrap();
//! let mut locker = cache.get(Rendered { hash: 0xC0FFEE });
//! match locker.status() {
//!     CacheEntryStatus::Cached => { /* reuse locker.entry() */ }
//!     CacheEntryStatus::MustCompute => {
//!         // compute the value, then publish it
//!         locker.insert_in_cache().unwrap();
//!     }
//!     CacheEntryStatus::ComputationPending => {
//!         locker.wait_for_pending_entry(std::time::Duration::ZERO);
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Buckets, entry lockers, facade, metrics
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//! - [`storage`] - Mapped regions, segment stores and the tile pool

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use cache::{
    tile_size_px, Cache, CacheEntry, CacheEntryLocker, CacheEntryStatus, CacheReportInfo,
    ContentHash, MetricsSnapshot, SegmentReader, SegmentWriter, TileBitDepth, TileIndex,
    TileLock, BUCKET_COUNT, CACHE_DIRECTORY_NAME, TILE_SIZE_BYTES,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
