//! Background Cleaner
//!
//! Evicting or removing an entry only unlinks it from its bucket; the
//! payload teardown, tile release and segment dead-marking happen on this
//! worker so the calling thread is never charged the destruction cost.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::cache::bucket::{EntryRecord, StoredPayload};
use crate::storage::segment::SegmentStore;
use crate::storage::tile_pool::TilePool;

/// A record unlinked from its bucket, waiting for destruction
pub(crate) struct DetachedEntry {
    pub bucket: usize,
    pub record: EntryRecord,
}

/// Owner handle for the cleaner thread
pub(crate) struct CacheCleaner {
    tx: Option<Sender<Vec<DetachedEntry>>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheCleaner {
    /// Spawn the worker. `stores` is present for persistent caches only.
    pub fn spawn(pool: Arc<TilePool>, stores: Option<Arc<Vec<SegmentStore>>>) -> Self {
        let (tx, rx) = unbounded::<Vec<DetachedEntry>>();
        let handle = std::thread::Builder::new()
            .name("tilecache-cleaner".to_string())
            .spawn(move || run(rx, pool, stores))
            .expect("failed to spawn cleaner thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Hand a batch of detached records to the worker. Never blocks.
    pub fn submit(&self, batch: Vec<DetachedEntry>) {
        if batch.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(batch).is_err() {
                warn!("cleaner thread unavailable, dropping entries without tile release");
            }
        }
    }
}

impl Drop for CacheCleaner {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    rx: Receiver<Vec<DetachedEntry>>,
    pool: Arc<TilePool>,
    stores: Option<Arc<Vec<SegmentStore>>>,
) {
    while let Ok(batch) = rx.recv() {
        let count = batch.len();
        for detached in batch {
            destroy(detached, &pool, stores.as_ref().map(|s| s.as_slice()));
        }
        debug!(count, "cleaned up detached entries");
    }
}

fn destroy(detached: DetachedEntry, pool: &TilePool, stores: Option<&[SegmentStore]>) {
    let record = detached.record;
    if let StoredPayload::Segment { offset } = record.payload {
        if let Some(stores) = stores {
            stores[detached.bucket].mark_dead(offset);
        }
    }
    if !record.tiles.is_empty() {
        pool.release(&record.tiles);
    }
    // Memory payloads drop here, on the worker thread
}

// =============================================================================
// Tests
// =============================================================================
