//! Cache Buckets
//!
//! The key space is partitioned into 256 buckets by the top byte of the
//! content hash. Each bucket has its own lock, its own hash index and its
//! own recency ordering, so operations on different hash prefixes never
//! contend.
//!
//! A bucket also tracks the in-flight producer for each key that is being
//! computed, which is what gives lookups their single-flight behavior, and
//! carries the condition variable producers broadcast on when they publish.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cache::entry::{ContentHash, TileIndex};

/// Where a published entry's payload lives
pub(crate) enum StoredPayload {
    /// Canonical in-memory copy, downcast on lookup
    Memory(Arc<dyn Any + Send + Sync>),
    /// Marshalled record in the bucket's segment store
    Segment { offset: u64 },
}

/// Bucket-resident metadata for one published entry
pub(crate) struct EntryRecord {
    pub hash: ContentHash,
    pub size: u64,
    pub plugin_id: String,
    pub tiles: Vec<TileIndex>,
    /// Monotonic access tick, higher is more recent
    pub last_access: u64,
    pub payload: StoredPayload,
}

/// Mutable bucket state, guarded by the bucket mutex
pub(crate) struct BucketState {
    pub entries: HashMap<ContentHash, EntryRecord>,
    /// Keys being computed right now, mapped to the producing locker's id
    pub in_flight: HashMap<ContentHash, u64>,
}

/// One shard of the key space
pub(crate) struct CacheBucket {
    pub state: Mutex<BucketState>,
    /// Broadcast on publication and producer abandonment
    pub published: Condvar,
    size_bytes: AtomicU64,
}

impl CacheBucket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            published: Condvar::new(),
            size_bytes: AtomicU64::new(0),
        }
    }

    /// Bytes held by this bucket's entries
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Number of published entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Insert a record under the given (already locked) state, returning the
    /// displaced record if the hash was present.
    pub fn insert_record(
        &self,
        state: &mut BucketState,
        record: EntryRecord,
    ) -> Option<EntryRecord> {
        self.size_bytes.fetch_add(record.size, Ordering::Relaxed);
        let old = state.entries.insert(record.hash, record);
        if let Some(old) = &old {
            self.size_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }
        old
    }

    /// Remove a record under the given (already locked) state
    pub fn remove_record(
        &self,
        state: &mut BucketState,
        hash: ContentHash,
    ) -> Option<EntryRecord> {
        let removed = state.entries.remove(&hash);
        if let Some(removed) = &removed {
            self.size_bytes.fetch_sub(removed.size, Ordering::Relaxed);
        }
        removed
    }

    /// Detach a record, locking the bucket
    pub fn detach(&self, hash: ContentHash) -> Option<EntryRecord> {
        let mut state = self.state.lock();
        self.remove_record(&mut state, hash)
    }

    /// Detach every record, locking the bucket
    pub fn detach_all(&self) -> Vec<EntryRecord> {
        let mut state = self.state.lock();
        let drained: Vec<EntryRecord> = state.entries.drain().map(|(_, r)| r).collect();
        for record in &drained {
            self.size_bytes.fetch_sub(record.size, Ordering::Relaxed);
        }
        drained
    }

    /// Snapshot eviction candidates as (tick, hash, size) triples
    pub fn collect_candidates(&self) -> Vec<(u64, ContentHash, u64)> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .map(|r| (r.last_access, r.hash, r.size))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
