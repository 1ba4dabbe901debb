//! Backing Storage
//!
//! Memory-mapped regions, the per-bucket segment stores and the fixed-size
//! tile pool. Persistent caches map real files under the cache directory;
//! volatile caches use anonymous mappings with the same code paths.

pub(crate) mod mapped;
pub(crate) mod segment;
pub mod tile_pool;

pub use tile_pool::{TileLock, TilePool, TILE_SIZE_BYTES};
