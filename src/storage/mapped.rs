//! Growable Mapped Region
//!
//! A contiguous byte region backed either by a memory-mapped file
//! (persistent mode) or an anonymous mapping (volatile mode). Growth remaps
//! the region, so callers must not hold references across a grow.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::error::Result;

/// Growable byte region, file-backed or anonymous
pub struct MappedRegion {
    map: MmapMut,
    file: Option<File>,
    len: usize,
}

impl MappedRegion {
    /// Create an anonymous region of `len` bytes
    pub fn anonymous(len: usize) -> Result<Self> {
        let map = MmapOptions::new().len(len.max(1)).map_anon()?;
        Ok(Self {
            map,
            file: None,
            len,
        })
    }

    /// Open or create a file-backed region of at least `min_len` bytes.
    ///
    /// An existing larger file keeps its size, so previously written content
    /// stays mapped.
    pub fn open(path: &Path, min_len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let existing = file.metadata()?.len() as usize;
        let len = existing.max(min_len).max(1);
        if existing < len {
            file.set_len(len as u64)?;
        }
        // Safety: the file is opened read-write by this process and is only
        // resized through grow(), which remaps first.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self {
            map,
            file: Some(file),
            len,
        })
    }

    /// Region length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is backed by a file
    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }

    /// Grow the region to `new_len` bytes. Existing content is preserved;
    /// all previously obtained slices are invalidated.
    pub fn grow(&mut self, new_len: usize) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        debug!(old_len = self.len, new_len, "growing mapped region");
        match &self.file {
            Some(file) => {
                self.map.flush()?;
                file.set_len(new_len as u64)?;
                // Safety: same invariant as open(); the old map is replaced
                // before anyone can observe the resized file.
                self.map = unsafe { MmapOptions::new().map_mut(file)? };
            }
            None => {
                let mut bigger = MmapOptions::new().len(new_len).map_anon()?;
                bigger[..self.len].copy_from_slice(&self.map[..self.len]);
                self.map = bigger;
            }
        }
        self.len = new_len;
        Ok(())
    }

    /// Flush dirty pages to the backing file, blocking until durable.
    /// A no-op for anonymous regions.
    pub fn flush(&self) -> Result<()> {
        if self.file.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Schedule a flush without waiting for completion
    pub fn flush_async(&self) -> Result<()> {
        if self.file.is_some() {
            self.map.flush_async()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len)
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
