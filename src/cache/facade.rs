//! Cache Facade
//!
//! Top-level cache object. Owns the 256 buckets, the tile pool, the
//! per-bucket segment stores (persistent mode) and the background cleaner.
//! Lookups route to the owning bucket by the top byte of the content hash.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::cache::bucket::{CacheBucket, EntryRecord, StoredPayload};
use crate::cache::cleaner::{CacheCleaner, DetachedEntry};
use crate::cache::entry::{CacheEntry, ContentHash, TileIndex};
use crate::cache::locker::CacheEntryLocker;
use crate::cache::metrics::{CacheMetrics, CacheReportInfo, MetricsSnapshot};
use crate::cache::{BUCKET_COUNT, CACHE_DIRECTORY_NAME};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::storage::segment::SegmentStore;
use crate::storage::tile_pool::{TileLock, TilePool, TILE_SIZE_BYTES};

/// Only one persistent cache may exist per process
static PERSISTENT_CACHE_LIVE: AtomicBool = AtomicBool::new(false);

/// Tile-oriented content cache, cheap to clone and share across threads
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    pub(crate) buckets: Vec<CacheBucket>,
    pub(crate) stores: Option<Arc<Vec<SegmentStore>>>,
    pub(crate) pool: Arc<TilePool>,
    pub(crate) cleaner: CacheCleaner,
    pub(crate) metrics: CacheMetrics,
    max_size: AtomicU64,
    tick: AtomicU64,
    locker_ids: AtomicU64,
    persistent: bool,
    directory: Option<PathBuf>,
}

impl CacheInner {
    /// Next monotonic access tick for recency ordering
    pub(crate) fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_locker_id(&self) -> u64 {
        self.locker_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if self.persistent {
            PERSISTENT_CACHE_LIVE.store(false, Ordering::SeqCst);
        }
    }
}

impl Cache {
    /// Create a cache from the given configuration.
    ///
    /// At most one persistent cache may be live per process; a second
    /// persistent `create` fails with a configuration error. Volatile
    /// caches can be created freely.
    pub fn create(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        if !config.persistent {
            let pool = Arc::new(TilePool::volatile(
                config.initial_tile_count,
                config.tile_growth_quantum,
                config.maximum_tile_pool_bytes,
            )?);
            let buckets = (0..BUCKET_COUNT).map(|_| CacheBucket::new()).collect();
            let cleaner = CacheCleaner::spawn(pool.clone(), None);
            return Ok(Self {
                inner: Arc::new(CacheInner {
                    buckets,
                    stores: None,
                    pool,
                    cleaner,
                    metrics: CacheMetrics::new(),
                    max_size: AtomicU64::new(config.maximum_size_bytes),
                    tick: AtomicU64::new(0),
                    locker_ids: AtomicU64::new(0),
                    persistent: false,
                    directory: None,
                }),
            });
        }

        if PERSISTENT_CACHE_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Config(
                "a persistent cache already exists in this process".to_string(),
            ));
        }
        let result = Self::create_persistent(&config);
        if result.is_err() {
            PERSISTENT_CACHE_LIVE.store(false, Ordering::SeqCst);
        }
        result
    }

    fn create_persistent(config: &CacheConfig) -> Result<Self> {
        let base = config.directory.as_ref().expect("validated");
        let dir = base.join(CACHE_DIRECTORY_NAME);
        std::fs::create_dir_all(&dir)?;

        let buckets: Vec<CacheBucket> = (0..BUCKET_COUNT).map(|_| CacheBucket::new()).collect();
        let mut stores = Vec::with_capacity(BUCKET_COUNT);
        let mut allocated_tiles: HashSet<TileIndex> = HashSet::new();
        let mut tick = 0u64;
        let mut recovered = 0usize;

        for index in 0..BUCKET_COUNT {
            let path = dir.join(format!("bucket_{:02x}.seg", index));
            let (store, records) = SegmentStore::open(&path, index)?;
            let mut state = buckets[index].state.lock();
            for record in records {
                // A record landing in the wrong bucket file means the file
                // set was tampered with; skip rather than mis-route.
                if bucket_index(record.hash) != index {
                    warn!(index, hash = record.hash, "record in wrong bucket, skipping");
                    continue;
                }
                allocated_tiles.extend(record.tiles.iter().copied());
                buckets[index].insert_record(
                    &mut state,
                    EntryRecord {
                        hash: record.hash,
                        size: record.size,
                        plugin_id: record.plugin_id,
                        tiles: record.tiles,
                        last_access: tick,
                        payload: StoredPayload::Segment {
                            offset: record.offset,
                        },
                    },
                );
                tick += 1;
                recovered += 1;
            }
            drop(state);
            stores.push(store);
        }
        debug!(recovered, "persistent cache opened");

        let pool = Arc::new(TilePool::open(
            &dir.join("tiles.bin"),
            config.initial_tile_count,
            config.tile_growth_quantum,
            config.maximum_tile_pool_bytes,
            &allocated_tiles,
        )?);
        let stores = Arc::new(stores);
        let cleaner = CacheCleaner::spawn(pool.clone(), Some(stores.clone()));

        Ok(Self {
            inner: Arc::new(CacheInner {
                buckets,
                stores: Some(stores),
                pool,
                cleaner,
                metrics: CacheMetrics::new(),
                max_size: AtomicU64::new(config.maximum_size_bytes),
                tick: AtomicU64::new(tick),
                locker_ids: AtomicU64::new(0),
                persistent: true,
                directory: Some(dir),
            }),
        })
    }

    /// Whether entries are backed by memory-mapped files
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent
    }

    /// Directory holding the bucket and tile files, persistent mode only
    pub fn cache_directory(&self) -> Option<&Path> {
        self.inner.directory.as_deref()
    }

    /// Look up the cache for the entry's key.
    ///
    /// The returned locker tells the caller whether the value is already
    /// cached, must be computed by this caller, or is being computed by
    /// someone else. On a volatile hit the locker's process-local entry is
    /// replaced by the canonical cached one; on a persistent hit the stored
    /// bytes are deserialized into the passed entry.
    pub fn get<E: CacheEntry>(&self, entry: E) -> CacheEntryLocker<E> {
        CacheEntryLocker::create(self.clone(), entry)
    }

    /// Existence probe, cheaper than `get` because no entry is materialized
    pub fn has_cache_entry_for_hash(&self, hash: ContentHash) -> bool {
        let bucket = &self.inner.buckets[bucket_index(hash)];
        bucket.state.lock().entries.contains_key(&hash)
    }

    /// Fetch buffers for `existing` tiles and allocate `num_to_alloc` new
    /// ones, growing the tile pool if needed.
    ///
    /// The token holds the pool lock; drop it (or call [`Cache::unlock_tiles`])
    /// before calling [`Cache::release_tiles`], or the thread deadlocks on
    /// the pool mutex. Entry marshalling implementations must never call
    /// tile operations; they are not handed any type that could.
    pub fn retrieve_and_lock_tiles<E: CacheEntry>(
        &self,
        entry: &E,
        existing: &[TileIndex],
        num_to_alloc: usize,
    ) -> Result<TileLock<'_>> {
        trace!(
            hash = entry.content_hash(),
            existing = existing.len(),
            num_to_alloc,
            "retrieving tiles"
        );
        self.inner.pool.retrieve_and_lock(existing, num_to_alloc)
    }

    /// Release the token returned by `retrieve_and_lock_tiles`. Equivalent
    /// to dropping it; buffers obtained from the token are invalid after
    /// this call.
    pub fn unlock_tiles(&self, lock: TileLock<'_>) {
        drop(lock);
    }

    /// Mark tiles free for reuse. Call only after the tile lock is gone.
    pub fn release_tiles<E: CacheEntry>(&self, entry: &E, indices: &[TileIndex]) {
        trace!(
            hash = entry.content_hash(),
            released = indices.len(),
            "releasing tiles"
        );
        self.inner.pool.release(indices);
    }

    /// Evict least-recently-used entries until at least `n_bytes_to_free`
    /// bytes are reclaimed.
    ///
    /// Entries are unlinked synchronously but destroyed on the cleaner
    /// thread, so this returns before the memory is actually reusable.
    pub fn evict_lru_entries(&self, n_bytes_to_free: u64) {
        let mut candidates: Vec<(u64, usize, ContentHash, u64)> = Vec::new();
        for (index, bucket) in self.inner.buckets.iter().enumerate() {
            for (tick, hash, size) in bucket.collect_candidates() {
                candidates.push((tick, index, hash, size));
            }
        }
        candidates.sort_unstable_by_key(|&(tick, ..)| tick);

        let mut freed = 0u64;
        let mut batch = Vec::new();
        for (_, index, hash, _) in candidates {
            if freed >= n_bytes_to_free {
                break;
            }
            if let Some(record) = self.inner.buckets[index].detach(hash) {
                freed += record.size + record.tiles.len() as u64 * TILE_SIZE_BYTES as u64;
                self.inner.metrics.record_eviction(record.size);
                batch.push(DetachedEntry {
                    bucket: index,
                    record,
                });
            }
        }
        if !batch.is_empty() {
            debug!(evicted = batch.len(), freed, "evicting LRU entries");
            self.inner.cleaner.submit(batch);
        }
    }

    /// Maximum cache size in bytes
    pub fn maximum_cache_size(&self) -> u64 {
        self.inner.max_size.load(Ordering::Relaxed)
    }

    /// Change the maximum cache size. Shrinking below the current size
    /// evicts the excess.
    pub fn set_maximum_cache_size(&self, size: u64) {
        self.inner.max_size.store(size, Ordering::Relaxed);
        let current = self.current_size();
        if current > size {
            self.evict_lru_entries(current - size);
        }
    }

    /// Bytes currently held: published entries plus checked-out tiles
    pub fn current_size(&self) -> u64 {
        let entries: u64 = self.inner.buckets.iter().map(|b| b.size_bytes()).sum();
        entries + self.inner.pool.used_bytes()
    }

    /// Number of published entries across all buckets
    pub fn entry_count(&self) -> usize {
        self.inner.buckets.iter().map(|b| b.len()).sum()
    }

    /// Evict pending overflow after an insert pushed past the maximum
    pub(crate) fn evict_overflow(&self) {
        let max = self.maximum_cache_size();
        let current = self.current_size();
        if current > max {
            self.evict_lru_entries(current - max);
        }
    }

    /// Evict everything. Keys currently being computed are unaffected;
    /// their producers will publish into the emptied buckets.
    pub fn clear(&self) {
        let mut batch = Vec::new();
        for (index, bucket) in self.inner.buckets.iter().enumerate() {
            for record in bucket.detach_all() {
                batch.push(DetachedEntry {
                    bucket: index,
                    record,
                });
            }
            if let Some(stores) = &self.inner.stores {
                stores[index].reset();
            }
        }
        debug!(cleared = batch.len(), "cache cleared");
        self.inner.cleaner.submit(batch);
    }

    /// Remove one entry, bypassing LRU ordering
    pub fn remove_entry<E: CacheEntry>(&self, entry: &E) {
        let hash = entry.content_hash();
        let bucket = &self.inner.buckets[bucket_index(hash)];
        if let Some(record) = bucket.detach(hash) {
            self.inner.metrics.record_removal();
            self.inner.cleaner.submit(vec![DetachedEntry {
                bucket: bucket_index(hash),
                record,
            }]);
        }
    }

    /// Remove every entry attributed to the given plugin identity
    pub fn remove_all_entries_for_plugin(&self, plugin_id: &str) {
        let mut batch = Vec::new();
        for (index, bucket) in self.inner.buckets.iter().enumerate() {
            let mut state = bucket.state.lock();
            let hashes: Vec<ContentHash> = state
                .entries
                .values()
                .filter(|r| r.plugin_id == plugin_id)
                .map(|r| r.hash)
                .collect();
            for hash in hashes {
                if let Some(record) = bucket.remove_record(&mut state, hash) {
                    self.inner.metrics.record_removal();
                    batch.push(DetachedEntry {
                        bucket: index,
                        record,
                    });
                }
            }
        }
        debug!(plugin_id, removed = batch.len(), "removed plugin entries");
        self.inner.cleaner.submit(batch);
    }

    /// Flush memory-mapped state to disk. The synchronous variant blocks
    /// until durable; the asynchronous one only schedules the writeback.
    /// A no-op for volatile caches.
    pub fn flush_on_disk(&self, asynchronous: bool) -> Result<()> {
        let Some(stores) = &self.inner.stores else {
            return Ok(());
        };
        for store in stores.iter() {
            if asynchronous {
                store.flush_async()?;
            } else {
                store.flush()?;
            }
        }
        if asynchronous {
            self.inner.pool.flush_async()
        } else {
            self.inner.pool.flush()
        }
    }

    /// Per-plugin entry and byte counts, recomputed by scanning buckets
    pub fn get_memory_stats(&self) -> HashMap<String, CacheReportInfo> {
        let mut stats: HashMap<String, CacheReportInfo> = HashMap::new();
        for bucket in &self.inner.buckets {
            let state = bucket.state.lock();
            for record in state.entries.values() {
                let info = stats.entry(record.plugin_id.clone()).or_default();
                info.n_entries += 1;
                info.n_bytes += record.size;
            }
        }
        stats
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Bucket index for a hash: its top byte, in [0, 255]
    pub fn bucket_index_for_hash(hash: ContentHash) -> usize {
        bucket_index(hash)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("persistent", &self.inner.persistent)
            .field("entries", &self.entry_count())
            .field("current_size", &self.current_size())
            .finish()
    }
}

#[inline]
pub(crate) fn bucket_index(hash: ContentHash) -> usize {
    (hash >> 56) as usize
}
