//! Tile Pool
//!
//! Fixed-size block allocator over a growable [`MappedRegion`]. Every tile
//! occupies [`TILE_SIZE_BYTES`] bytes regardless of the pixel depth stored
//! in it.
//!
//! # Design
//!
//! - Free list of tile indices; allocation pops, release pushes
//! - Pool growth extends the backing region by at least the growth quantum
//! - A [`TileLock`] token holds the pool mutex for the whole window in which
//!   tile buffers are dereferenced; dropping the token is the unlock
//!
//! Because the mutex is not reentrant, calling back into the pool while a
//! `TileLock` is alive on the same thread deadlocks. Release tiles only
//! after the token is gone.

use std::collections::HashSet;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::cache::entry::TileIndex;
use crate::error::{Error, Result};
use crate::storage::mapped::MappedRegion;

/// Byte footprint of one tile, for every bit-depth class
pub const TILE_SIZE_BYTES: usize = 128 * 128;

struct PoolState {
    region: MappedRegion,
    capacity_tiles: u32,
    free: Vec<TileIndex>,
}

/// Fixed-size tile allocator
pub struct TilePool {
    state: Mutex<PoolState>,
    growth_quantum: usize,
    max_bytes: Option<u64>,
}

impl TilePool {
    /// Create a volatile pool over an anonymous mapping
    pub fn volatile(
        initial_tiles: usize,
        growth_quantum: usize,
        max_bytes: Option<u64>,
    ) -> Result<Self> {
        let region = MappedRegion::anonymous(initial_tiles * TILE_SIZE_BYTES)?;
        Ok(Self::from_region(region, growth_quantum, max_bytes, &HashSet::new()))
    }

    /// Open a persistent pool. `allocated` lists tiles owned by recovered
    /// entries; everything else is free.
    pub fn open(
        path: &Path,
        initial_tiles: usize,
        growth_quantum: usize,
        max_bytes: Option<u64>,
        allocated: &HashSet<TileIndex>,
    ) -> Result<Self> {
        let region = MappedRegion::open(path, initial_tiles * TILE_SIZE_BYTES)?;
        Ok(Self::from_region(region, growth_quantum, max_bytes, allocated))
    }

    fn from_region(
        region: MappedRegion,
        growth_quantum: usize,
        max_bytes: Option<u64>,
        allocated: &HashSet<TileIndex>,
    ) -> Self {
        let capacity_tiles = (region.len() / TILE_SIZE_BYTES) as u32;
        let free: Vec<TileIndex> = (0..capacity_tiles)
            .filter(|idx| !allocated.contains(idx))
            .collect();
        debug!(
            capacity_tiles,
            recovered = allocated.len(),
            "tile pool ready"
        );
        Self {
            state: Mutex::new(PoolState {
                region,
                capacity_tiles,
                free,
            }),
            growth_quantum: growth_quantum.max(1),
            max_bytes,
        }
    }

    /// Fetch buffers for `existing` tiles and allocate `num_to_alloc` new
    /// ones, growing the backing store if the free pool is insufficient.
    ///
    /// The returned token holds the pool lock; buffers stay valid until it
    /// is dropped. On error nothing is allocated and the lock is released.
    pub fn retrieve_and_lock(
        &self,
        existing: &[TileIndex],
        num_to_alloc: usize,
    ) -> Result<TileLock<'_>> {
        let mut state = self.state.lock();

        debug_assert!(
            existing.iter().all(|&i| i < state.capacity_tiles),
            "tile index out of range"
        );

        if state.free.len() < num_to_alloc {
            let shortfall = num_to_alloc - state.free.len();
            self.grow(&mut state, shortfall)?;
        }

        let mut allocated = Vec::with_capacity(num_to_alloc);
        for _ in 0..num_to_alloc {
            // grow() guaranteed enough free tiles
            allocated.push(state.free.pop().expect("free pool exhausted after grow"));
        }
        trace!(existing = existing.len(), allocated = allocated.len(), "tiles locked");

        Ok(TileLock {
            guard: state,
            existing: existing.to_vec(),
            allocated,
        })
    }

    fn grow(&self, state: &mut PoolState, shortfall: usize) -> Result<()> {
        let add = shortfall.max(self.growth_quantum);
        let new_capacity = state.capacity_tiles as usize + add;
        let new_bytes = new_capacity * TILE_SIZE_BYTES;

        if let Some(max) = self.max_bytes {
            if new_bytes as u64 > max {
                return Err(Error::AllocationFailed {
                    requested: shortfall,
                    reason: format!("pool limit of {} bytes reached", max),
                });
            }
        }
        state
            .region
            .grow(new_bytes)
            .map_err(|e| Error::AllocationFailed {
                requested: shortfall,
                reason: e.to_string(),
            })?;

        state
            .free
            .extend(state.capacity_tiles..new_capacity as u32);
        state.capacity_tiles = new_capacity as u32;
        debug!(new_capacity, "tile pool grown");
        Ok(())
    }

    /// Return tiles to the free pool. Must not be called while a
    /// [`TileLock`] is held on the same thread.
    pub fn release(&self, indices: &[TileIndex]) {
        let mut state = self.state.lock();
        for &idx in indices {
            debug_assert!(idx < state.capacity_tiles, "tile index out of range");
            debug_assert!(!state.free.contains(&idx), "tile released twice");
            state.free.push(idx);
        }
        trace!(released = indices.len(), "tiles released");
    }

    /// Number of tiles currently free
    pub fn free_tile_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Total number of tiles in the pool
    pub fn capacity_tiles(&self) -> usize {
        self.state.lock().capacity_tiles as usize
    }

    /// Bytes held by checked-out tiles
    pub fn used_bytes(&self) -> u64 {
        let state = self.state.lock();
        (state.capacity_tiles as usize - state.free.len()) as u64 * TILE_SIZE_BYTES as u64
    }

    /// Flush the backing store, blocking until durable
    pub fn flush(&self) -> Result<()> {
        self.state.lock().region.flush()
    }

    /// Schedule a flush of the backing store
    pub fn flush_async(&self) -> Result<()> {
        self.state.lock().region.flush_async()
    }
}

/// Lock token returned by [`TilePool::retrieve_and_lock`].
///
/// Holds the pool mutex; tile buffers borrowed from it become unreachable
/// once the token is dropped, after which the pool may grow and remap.
pub struct TileLock<'a> {
    guard: MutexGuard<'a, PoolState>,
    existing: Vec<TileIndex>,
    allocated: Vec<TileIndex>,
}

impl std::fmt::Debug for TileLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLock")
            .field("existing", &self.existing)
            .field("allocated", &self.allocated)
            .finish()
    }
}

impl TileLock<'_> {
    /// Indices passed in as already owned
    pub fn existing_tiles(&self) -> &[TileIndex] {
        &self.existing
    }

    /// Indices freshly allocated by this call
    pub fn allocated_tiles(&self) -> &[TileIndex] {
        &self.allocated
    }

    fn check(&self, index: TileIndex) {
        debug_assert!(
            self.existing.contains(&index) || self.allocated.contains(&index),
            "tile {} was not retrieved by this lock",
            index
        );
        assert!(
            index < self.guard.capacity_tiles,
            "tile index {} out of range",
            index
        );
    }

    /// Read access to one tile's bytes
    pub fn tile(&self, index: TileIndex) -> &[u8] {
        self.check(index);
        let start = index as usize * TILE_SIZE_BYTES;
        &self.guard.region.as_slice()[start..start + TILE_SIZE_BYTES]
    }

    /// Write access to one tile's bytes
    pub fn tile_mut(&mut self, index: TileIndex) -> &mut [u8] {
        self.check(index);
        let start = index as usize * TILE_SIZE_BYTES;
        &mut self.guard.region.as_mut_slice()[start..start + TILE_SIZE_BYTES]
    }
}

// =============================================================================
// Tests
// =============================================================================
