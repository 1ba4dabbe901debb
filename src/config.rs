//! Cache configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default maximum cache size (8GB)
pub const DEFAULT_MAXIMUM_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default number of tiles allocated up front
pub const DEFAULT_INITIAL_TILE_COUNT: usize = 256;

/// Default number of tiles added per pool growth
pub const DEFAULT_TILE_GROWTH_QUANTUM: usize = 256;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cache size in bytes (entries plus checked-out tile storage)
    pub maximum_size_bytes: u64,
    /// If true, the cache is backed by memory-mapped files under `directory`
    /// and survives process restarts. Only one persistent cache may exist
    /// per process.
    pub persistent: bool,
    /// Base directory for persistent storage. Required when `persistent`.
    pub directory: Option<PathBuf>,
    /// Number of tiles allocated when the pool is created
    pub initial_tile_count: usize,
    /// Minimum number of tiles added when the pool grows
    pub tile_growth_quantum: usize,
    /// Upper bound on the tile pool size. `None` grows until the backing
    /// store itself fails.
    pub maximum_tile_pool_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_size_bytes: DEFAULT_MAXIMUM_SIZE,
            persistent: false,
            directory: None,
            initial_tile_count: DEFAULT_INITIAL_TILE_COUNT,
            tile_growth_quantum: DEFAULT_TILE_GROWTH_QUANTUM,
            maximum_tile_pool_bytes: None,
        }
    }
}

impl CacheConfig {
    /// Configuration for a volatile in-memory cache
    pub fn volatile() -> Self {
        Self::default()
    }

    /// Configuration for a persistent cache rooted at `directory`
    pub fn persistent(directory: impl Into<PathBuf>) -> Self {
        Self {
            persistent: true,
            directory: Some(directory.into()),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.persistent && self.directory.is_none() {
            return Err(crate::error::Error::Config(
                "persistent cache requires a directory".to_string(),
            ));
        }
        if self.tile_growth_quantum == 0 {
            return Err(crate::error::Error::Config(
                "tile_growth_quantum must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
