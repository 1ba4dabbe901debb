//! Cache Entry Locker
//!
//! Per-key coordination object handed out by [`Cache::get`]. At most one
//! locker across all threads is in the `MustCompute` state for a given key
//! at any instant; everyone else either sees the cached value or waits for
//! the producer to publish.
//!
//! A producer that times out other waiters' patience can be displaced: see
//! [`CacheEntryLocker::wait_for_pending_entry`]. When both the displaced
//! producer and its successor publish, the last publisher overwrites.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::cache::bucket::{EntryRecord, StoredPayload};
use crate::cache::cleaner::DetachedEntry;
use crate::cache::entry::{CacheEntry, ContentHash, SegmentReader, SegmentWriter};
use crate::cache::facade::{bucket_index, Cache};
use crate::error::{Error, Result};

/// Status of the entry a locker was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryStatus {
    /// The entry is cached and available now
    Cached,
    /// The entry is absent and this caller was elected to compute it. Call
    /// `insert_in_cache` when the value is ready.
    MustCompute,
    /// Another caller is already computing the entry
    ComputationPending,
}

/// Single-flight handle for one (cache, key) pair
pub struct CacheEntryLocker<E: CacheEntry> {
    cache: Cache,
    hash: ContentHash,
    bucket: usize,
    locker_id: u64,
    status: CacheEntryStatus,
    entry: Arc<E>,
}

enum Classified {
    HitMemory(Arc<dyn Any + Send + Sync>),
    HitSegment(u64),
    Pending,
    Elected,
}

impl<E: CacheEntry> CacheEntryLocker<E> {
    pub(crate) fn create(cache: Cache, entry: E) -> Self {
        let hash = entry.content_hash();
        let locker_id = cache.inner.next_locker_id();
        let mut locker = Self {
            bucket: bucket_index(hash),
            hash,
            locker_id,
            cache,
            status: CacheEntryStatus::MustCompute,
            entry: Arc::new(entry),
        };
        locker.classify(true);
        locker
    }

    /// Current status for this caller
    pub fn status(&self) -> CacheEntryStatus {
        self.status
    }

    /// Hash of the key this locker coordinates
    pub fn content_hash(&self) -> ContentHash {
        self.hash
    }

    /// The entry associated with this locker: the one passed to `get`, or
    /// the canonical cached one after a volatile hit
    pub fn entry(&self) -> &E {
        &self.entry
    }

    /// Shared handle to the process-local entry
    pub fn process_local_entry(&self) -> Arc<E> {
        self.entry.clone()
    }

    /// Mutable access to the process-local entry, for computing the value
    /// in place before `insert_in_cache`. Returns `None` once the entry is
    /// shared with the bucket or another handle.
    pub fn entry_mut(&mut self) -> Option<&mut E> {
        Arc::get_mut(&mut self.entry)
    }

    /// Publish the computed entry.
    ///
    /// Valid only in the `MustCompute` state. Transitions this locker to
    /// `Cached` and wakes every waiter blocked on the key. For persistent
    /// caches the entry is marshalled into the bucket's segment store, so
    /// `to_memory_segment` must be implemented.
    pub fn insert_in_cache(&mut self) -> Result<()> {
        debug_assert_eq!(
            self.status,
            CacheEntryStatus::MustCompute,
            "insert_in_cache called without having been elected producer"
        );
        if self.status != CacheEntryStatus::MustCompute {
            return Err(Error::NotSupported(
                "insert_in_cache is only valid in the MustCompute state",
            ));
        }

        let inner = &self.cache.inner;
        let size = self.entry.size_bytes() as u64;
        let plugin_id = self.entry.plugin_id().to_string();
        let tiles = self.entry.tile_indices();

        let payload = if let Some(stores) = &inner.stores {
            let mut writer = SegmentWriter::new();
            self.entry.to_memory_segment(&mut writer)?;
            let bytes = writer.into_bytes();
            let offset = stores[self.bucket].append(self.hash, size, &plugin_id, &tiles, &bytes)?;
            StoredPayload::Segment { offset }
        } else {
            let shared: Arc<dyn Any + Send + Sync> = self.entry.clone();
            StoredPayload::Memory(shared)
        };

        let record = EntryRecord {
            hash: self.hash,
            size,
            plugin_id,
            tiles,
            last_access: inner.next_tick(),
            payload,
        };

        let bucket = &inner.buckets[self.bucket];
        let displaced = {
            let mut state = bucket.state.lock();
            // The marker may no longer be ours if a waiter took over; we
            // still publish, and whoever publishes last wins the slot.
            if state.in_flight.get(&self.hash) == Some(&self.locker_id) {
                state.in_flight.remove(&self.hash);
            }
            bucket.insert_record(&mut state, record)
        };
        bucket.published.notify_all();

        if let Some(record) = displaced {
            inner.cleaner.submit(vec![DetachedEntry {
                bucket: self.bucket,
                record,
            }]);
        }
        inner.metrics.record_insert();
        self.status = CacheEntryStatus::Cached;
        self.cache.evict_overflow();
        Ok(())
    }

    /// Wait for the in-flight producer to publish.
    ///
    /// Valid only in the `ComputationPending` state. Returns `Cached` once
    /// the value is available. With a zero `timeout` the wait is unbounded;
    /// otherwise, when the timeout elapses without a publication this caller
    /// takes over production and the result is `MustCompute`. The takeover
    /// is the only recovery path from a producer that never publishes.
    pub fn wait_for_pending_entry(&mut self, timeout: Duration) -> CacheEntryStatus {
        debug_assert_eq!(
            self.status,
            CacheEntryStatus::ComputationPending,
            "wait_for_pending_entry called without a pending computation"
        );
        if self.status != CacheEntryStatus::ComputationPending {
            return self.status;
        }

        let inner = self.cache.inner.clone();
        inner.metrics.record_pending_wait();
        let start = Instant::now();

        loop {
            self.classify(false);
            match self.status {
                CacheEntryStatus::Cached => return self.status,
                CacheEntryStatus::MustCompute => {
                    // The producer abandoned the key without publishing
                    inner.metrics.record_takeover();
                    return self.status;
                }
                CacheEntryStatus::ComputationPending => {}
            }

            let bucket = &inner.buckets[self.bucket];
            let mut state = bucket.state.lock();
            // Re-check under the lock so a publication racing with the
            // classification above cannot be missed
            if state.entries.contains_key(&self.hash) || !state.in_flight.contains_key(&self.hash)
            {
                continue;
            }
            if timeout.is_zero() {
                bucket.published.wait(&mut state);
            } else {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    // Producer stalled past the deadline: reassign the key
                    // to this locker
                    state.in_flight.insert(self.hash, self.locker_id);
                    self.status = CacheEntryStatus::MustCompute;
                    inner.metrics.record_takeover();
                    return self.status;
                }
                let _ = bucket.published.wait_for(&mut state, timeout - elapsed);
            }
        }
    }

    /// Classify this locker against the bucket: hit, pending, or elected.
    fn classify(&mut self, record_stats: bool) {
        let inner = self.cache.inner.clone();
        loop {
            let classified = {
                let bucket = &inner.buckets[self.bucket];
                let mut state = bucket.state.lock();
                if let Some(record) = state.entries.get_mut(&self.hash) {
                    record.last_access = inner.next_tick();
                    match &record.payload {
                        StoredPayload::Memory(any) => Classified::HitMemory(any.clone()),
                        StoredPayload::Segment { offset } => Classified::HitSegment(*offset),
                    }
                } else if state.in_flight.contains_key(&self.hash) {
                    Classified::Pending
                } else {
                    state.in_flight.insert(self.hash, self.locker_id);
                    Classified::Elected
                }
            };

            match classified {
                Classified::Pending => {
                    self.status = CacheEntryStatus::ComputationPending;
                    if record_stats {
                        inner.metrics.record_miss();
                    }
                    return;
                }
                Classified::Elected => {
                    self.status = CacheEntryStatus::MustCompute;
                    if record_stats {
                        inner.metrics.record_miss();
                    }
                    return;
                }
                Classified::HitMemory(any) => match any.downcast::<E>() {
                    Ok(shared) => {
                        self.entry = shared;
                        self.status = CacheEntryStatus::Cached;
                        if record_stats {
                            inner.metrics.record_hit();
                        }
                        return;
                    }
                    Err(_) => {
                        // Same hash, different concrete type: discard the
                        // stored record and recompute
                        warn!(hash = self.hash, "cached entry has unexpected type, discarding");
                        self.discard_record(&inner);
                        continue;
                    }
                },
                Classified::HitSegment(offset) => {
                    let stores = inner.stores.as_ref().expect("segment payload without stores");
                    let bytes = match stores[self.bucket].read_payload(offset) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            // The record was evicted or its segment is
                            // unreadable; treat as a miss
                            warn!(hash = self.hash, error = %e, "dropping unreadable cache record");
                            self.discard_record(&inner);
                            continue;
                        }
                    };
                    let deserialized = match Arc::get_mut(&mut self.entry) {
                        Some(target) => {
                            let mut reader = SegmentReader::new(&bytes);
                            target.from_memory_segment(&mut reader)
                        }
                        None => Err(Error::NotSupported("process-local entry is aliased")),
                    };
                    match deserialized {
                        Ok(()) => {
                            self.status = CacheEntryStatus::Cached;
                            if record_stats {
                                inner.metrics.record_hit();
                            }
                            return;
                        }
                        Err(e) => {
                            warn!(hash = self.hash, error = %e, "entry deserialization failed, discarding record");
                            self.discard_record(&inner);
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn discard_record(&self, inner: &Arc<crate::cache::facade::CacheInner>) {
        if let Some(record) = inner.buckets[self.bucket].detach(self.hash) {
            inner.cleaner.submit(vec![DetachedEntry {
                bucket: self.bucket,
                record,
            }]);
        }
    }
}

impl<E: CacheEntry> Drop for CacheEntryLocker<E> {
    fn drop(&mut self) {
        if self.status != CacheEntryStatus::MustCompute {
            return;
        }
        // Abandoned without publishing: hand the key back and wake waiters
        // so one of them can be elected
        let bucket = &self.cache.inner.buckets[self.bucket];
        let mut state = bucket.state.lock();
        if state.in_flight.get(&self.hash) == Some(&self.locker_id) {
            state.in_flight.remove(&self.hash);
            drop(state);
            bucket.published.notify_all();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
