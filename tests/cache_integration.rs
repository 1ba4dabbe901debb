//! Tile Cache Integration Tests
//!
//! End-to-end tests across threads and process-restart boundaries:
//! - Single-flight computation and publication wake-ups
//! - Timeout-driven producer takeover
//! - Persistent round-trips through memory-mapped storage
//! - LRU eviction and capacity accounting
//! - Tile lock/unlock/release pairing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use tilecache::{
    Cache, CacheConfig, CacheEntry, CacheEntryStatus, ContentHash, SegmentReader, SegmentWriter,
    TileIndex, TILE_SIZE_BYTES,
};

/// Persistent caches are a process-wide singleton; tests touching one take
/// this gate so they never overlap.
static PERSISTENT_GATE: Mutex<()> = Mutex::new(());

// =============================================================================
// Test Entry Type
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct RenderedTile {
    hash: u64,
    plugin: String,
    pixels: Vec<u8>,
    tiles: Vec<TileIndex>,
}

impl RenderedTile {
    fn new(hash: u64, pixels: &[u8]) -> Self {
        Self {
            hash,
            plugin: "org.example.Render".to_string(),
            pixels: pixels.to_vec(),
            tiles: Vec::new(),
        }
    }

    fn probe(hash: u64) -> Self {
        Self::new(hash, &[])
    }

    fn for_plugin(hash: u64, plugin: &str, pixels: &[u8]) -> Self {
        Self {
            plugin: plugin.to_string(),
            ..Self::new(hash, pixels)
        }
    }
}

impl CacheEntry for RenderedTile {
    fn content_hash(&self) -> ContentHash {
        self.hash
    }

    fn size_bytes(&self) -> usize {
        self.pixels.len()
    }

    fn plugin_id(&self) -> &str {
        &self.plugin
    }

    fn tile_indices(&self) -> Vec<TileIndex> {
        self.tiles.clone()
    }

    fn to_memory_segment(&self, writer: &mut SegmentWriter) -> tilecache::Result<()> {
        writer.write_u16(self.plugin.len() as u16);
        writer.write_bytes(self.plugin.as_bytes());
        writer.write_u32(self.tiles.len() as u32);
        for &tile in &self.tiles {
            writer.write_u32(tile);
        }
        writer.write_u32(self.pixels.len() as u32);
        writer.write_bytes(&self.pixels);
        Ok(())
    }

    fn from_memory_segment(&mut self, reader: &mut SegmentReader<'_>) -> tilecache::Result<()> {
        let plugin_len = reader.read_u16()? as usize;
        self.plugin = String::from_utf8_lossy(reader.read_bytes(plugin_len)?).into_owned();
        let tile_count = reader.read_u32()? as usize;
        self.tiles = (0..tile_count)
            .map(|_| reader.read_u32())
            .collect::<tilecache::Result<_>>()?;
        let pixel_len = reader.read_u32()? as usize;
        self.pixels = reader.read_bytes(pixel_len)?.to_vec();
        Ok(())
    }
}

fn volatile_cache() -> Cache {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Cache::create(CacheConfig::volatile()).unwrap()
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

// =============================================================================
// Single-Flight Computation
// =============================================================================

#[test]
fn test_racing_getters_elect_exactly_one_producer() {
    let cache = volatile_cache();
    let hash = 0x11u64 << 56 | 42;
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let elections = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let elections = elections.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let mut locker = cache.get(RenderedTile::new(hash, b""));
                match locker.status() {
                    CacheEntryStatus::MustCompute => {
                        elections.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        locker.entry_mut().unwrap().pixels = b"computed-once".to_vec();
                        locker.insert_in_cache().unwrap();
                        locker.entry().pixels.clone()
                    }
                    CacheEntryStatus::ComputationPending => {
                        let status = locker.wait_for_pending_entry(Duration::ZERO);
                        assert_matches!(status, CacheEntryStatus::Cached);
                        locker.entry().pixels.clone()
                    }
                    CacheEntryStatus::Cached => locker.entry().pixels.clone(),
                }
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), b"computed-once");
    }
    assert_eq!(elections.load(Ordering::SeqCst), 1);
}

#[test]
fn test_waiter_wakes_with_producers_value() {
    let cache = volatile_cache();
    let hash = 0x22u64 << 56 | 7;

    let mut producer = cache.get(RenderedTile::new(hash, b"the-value"));
    assert_matches!(producer.status(), CacheEntryStatus::MustCompute);

    let waiter_cache = cache.clone();
    let waiter = std::thread::spawn(move || {
        let mut locker = waiter_cache.get(RenderedTile::probe(hash));
        assert_matches!(locker.status(), CacheEntryStatus::ComputationPending);
        let status = locker.wait_for_pending_entry(Duration::ZERO);
        assert_matches!(status, CacheEntryStatus::Cached);
        locker.entry().pixels.clone()
    });

    // Let the waiter block, then publish
    std::thread::sleep(Duration::from_millis(30));
    producer.insert_in_cache().unwrap();

    assert_eq!(waiter.join().unwrap(), b"the-value");
}

#[test]
fn test_timeout_takeover_produces_and_publishes() {
    let cache = volatile_cache();
    let hash = 0x33u64 << 56 | 9;

    // Thread A claims the key and never publishes
    let stalled = cache.get(RenderedTile::new(hash, b"never-published"));
    assert_matches!(stalled.status(), CacheEntryStatus::MustCompute);

    // Thread B times out, takes over and publishes its own value
    let taker_cache = cache.clone();
    let taker = std::thread::spawn(move || {
        let mut locker = taker_cache.get(RenderedTile::new(hash, b"recovered"));
        assert_matches!(locker.status(), CacheEntryStatus::ComputationPending);
        let status = locker.wait_for_pending_entry(Duration::from_millis(50));
        assert_matches!(status, CacheEntryStatus::MustCompute);
        locker.insert_in_cache().unwrap();
    });
    taker.join().unwrap();

    // Thread C sees the takeover's value
    let reader = cache.get(RenderedTile::probe(hash));
    assert_matches!(reader.status(), CacheEntryStatus::Cached);
    assert_eq!(reader.entry().pixels, b"recovered");

    assert_eq!(cache.metrics().takeovers, 1);
    drop(stalled);
}

#[test]
fn test_existence_probe() {
    let cache = volatile_cache();
    let hash = 0x44u64 << 56 | 1;
    assert!(!cache.has_cache_entry_for_hash(hash));

    let mut locker = cache.get(RenderedTile::new(hash, b"x"));
    assert!(!cache.has_cache_entry_for_hash(hash));
    locker.insert_in_cache().unwrap();
    assert!(cache.has_cache_entry_for_hash(hash));
}

// =============================================================================
// Eviction and Capacity
// =============================================================================

#[test]
fn test_evict_lru_entries_frees_oldest_first() {
    let cache = volatile_cache();

    let mut hashes = Vec::new();
    for i in 0..10u64 {
        let hash = (i << 56) | 0x100;
        let mut locker = cache.get(RenderedTile::new(hash, &[0u8; 1000]));
        locker.insert_in_cache().unwrap();
        hashes.push(hash);
    }
    assert_eq!(cache.entry_count(), 10);

    // Touch the first entry so it becomes the most recently used
    let refreshed = cache.get(RenderedTile::probe(hashes[0]));
    assert_matches!(refreshed.status(), CacheEntryStatus::Cached);

    cache.evict_lru_entries(3000);

    assert!(cache.entry_count() <= 7);
    assert!(cache.has_cache_entry_for_hash(hashes[0]), "refreshed entry evicted");
    assert!(!cache.has_cache_entry_for_hash(hashes[1]), "oldest entry survived");
}

#[test]
fn test_eviction_reduces_reported_size() {
    let cache = volatile_cache();
    for i in 0..5u64 {
        let mut locker = cache.get(RenderedTile::new((i << 56) | 5, &[0u8; 4096]));
        locker.insert_in_cache().unwrap();
    }
    let before = cache.current_size();
    assert_eq!(before, 5 * 4096);

    cache.evict_lru_entries(8192);
    assert!(
        wait_until(Duration::from_secs(2), || {
            cache.current_size() <= before - 8192
        }),
        "size did not drop after eviction"
    );
}

#[test]
fn test_shrinking_maximum_evicts_excess() {
    let cache = Cache::create(CacheConfig {
        maximum_size_bytes: 1 << 20,
        ..CacheConfig::volatile()
    })
    .unwrap();

    for i in 0..8u64 {
        let mut locker = cache.get(RenderedTile::new((i << 56) | 8, &[0u8; 1024]));
        locker.insert_in_cache().unwrap();
    }
    assert_eq!(cache.current_size(), 8 * 1024);

    cache.set_maximum_cache_size(4 * 1024);
    assert!(cache.current_size() <= 4 * 1024);
}

#[test]
fn test_insert_past_maximum_triggers_eviction() {
    let cache = Cache::create(CacheConfig {
        maximum_size_bytes: 4 * 1024,
        ..CacheConfig::volatile()
    })
    .unwrap();

    for i in 0..8u64 {
        let mut locker = cache.get(RenderedTile::new((i << 56) | 3, &[0u8; 1024]));
        locker.insert_in_cache().unwrap();
    }
    assert!(cache.current_size() <= 4 * 1024);
    assert!(cache.metrics().evictions > 0);
}

#[test]
fn test_clear_removes_everything() {
    let cache = volatile_cache();
    for i in 0..4u64 {
        let mut locker = cache.get(RenderedTile::new((i << 56) | 2, b"data"));
        locker.insert_in_cache().unwrap();
    }
    cache.clear();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.current_size(), 0);
}

#[test]
fn test_remove_entry_bypasses_lru() {
    let cache = volatile_cache();
    let entry = RenderedTile::new(0x55u64 << 56, b"data");
    let mut locker = cache.get(entry.clone());
    locker.insert_in_cache().unwrap();

    cache.remove_entry(&entry);
    assert!(!cache.has_cache_entry_for_hash(entry.hash));
}

#[test]
fn test_remove_all_entries_for_plugin() {
    let cache = volatile_cache();
    let mut a = cache.get(RenderedTile::for_plugin(1 << 56, "org.example.Blur", b"aa"));
    a.insert_in_cache().unwrap();
    let mut b = cache.get(RenderedTile::for_plugin(2 << 56, "org.example.Blur", b"bb"));
    b.insert_in_cache().unwrap();
    let mut c = cache.get(RenderedTile::for_plugin(3 << 56, "org.example.Grade", b"cc"));
    c.insert_in_cache().unwrap();

    cache.remove_all_entries_for_plugin("org.example.Blur");

    assert_eq!(cache.entry_count(), 1);
    assert!(cache.has_cache_entry_for_hash(3 << 56));
}

#[test]
fn test_memory_stats_group_by_plugin() {
    let cache = volatile_cache();
    for i in 0..3u64 {
        let mut locker = cache.get(RenderedTile::for_plugin(
            (i << 56) | 1,
            "org.example.Blur",
            &[0u8; 100],
        ));
        locker.insert_in_cache().unwrap();
    }
    let mut locker = cache.get(RenderedTile::for_plugin(7 << 56, "org.example.Grade", &[0u8; 50]));
    locker.insert_in_cache().unwrap();

    let stats = cache.get_memory_stats();
    assert_eq!(stats["org.example.Blur"].n_entries, 3);
    assert_eq!(stats["org.example.Blur"].n_bytes, 300);
    assert_eq!(stats["org.example.Grade"].n_entries, 1);
    assert_eq!(stats["org.example.Grade"].n_bytes, 50);
}

// =============================================================================
// Tile Protocol
// =============================================================================

#[test]
fn test_tile_lock_unlock_release_pairing() {
    let cache = volatile_cache();
    let entry = RenderedTile::new(0x66u64 << 56, b"");
    let free_before = cache.current_size();

    let mut taken = Vec::new();
    for _ in 0..3 {
        let lock = cache.retrieve_and_lock_tiles(&entry, &[], 2).unwrap();
        let indices = lock.allocated_tiles().to_vec();
        cache.unlock_tiles(lock);
        cache.release_tiles(&entry, &indices);
        taken.push(indices);
    }

    // Full pairing leaves the accounted size unchanged
    assert_eq!(cache.current_size(), free_before);
}

#[test]
fn test_tile_data_written_through_lock_window() {
    let cache = volatile_cache();
    let entry = RenderedTile::new(0x77u64 << 56, b"");

    let index = {
        let mut lock = cache.retrieve_and_lock_tiles(&entry, &[], 1).unwrap();
        let index = lock.allocated_tiles()[0];
        lock.tile_mut(index)[..4].copy_from_slice(&[1, 2, 3, 4]);
        cache.unlock_tiles(lock);
        index
    };

    let lock = cache.retrieve_and_lock_tiles(&entry, &[index], 0).unwrap();
    assert_eq!(&lock.tile(index)[..4], &[1, 2, 3, 4]);
    assert_eq!(lock.tile(index).len(), TILE_SIZE_BYTES);
    cache.unlock_tiles(lock);
    cache.release_tiles(&entry, &[index]);
}

#[test]
fn test_unreleased_tiles_count_toward_size() {
    let cache = volatile_cache();
    let entry = RenderedTile::new(0x78u64 << 56, b"");

    let lock = cache.retrieve_and_lock_tiles(&entry, &[], 2).unwrap();
    cache.unlock_tiles(lock);

    // Unlocked but never released: still checked out
    assert_eq!(cache.current_size(), 2 * TILE_SIZE_BYTES as u64);
}

#[test]
fn test_evicting_entry_releases_its_tiles() {
    let cache = volatile_cache();
    let mut entry = RenderedTile::new(0x79u64 << 56, b"pixels");

    let lock = cache.retrieve_and_lock_tiles(&entry, &[], 2).unwrap();
    entry.tiles = lock.allocated_tiles().to_vec();
    cache.unlock_tiles(lock);

    let mut locker = cache.get(entry);
    locker.insert_in_cache().unwrap();
    drop(locker);

    cache.evict_lru_entries(u64::MAX);
    assert!(
        wait_until(Duration::from_secs(2), || cache.current_size() == 0),
        "tiles owned by the evicted entry were not released"
    );
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_persistent_round_trip_across_reopen() {
    let _gate = PERSISTENT_GATE.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let hash = 0x99u64 << 56 | 0xBEEF;

    {
        let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
        let mut locker = cache.get(RenderedTile::new(hash, b"persisted-pixels"));
        assert_matches!(locker.status(), CacheEntryStatus::MustCompute);
        locker.insert_in_cache().unwrap();
        cache.flush_on_disk(false).unwrap();
    }

    let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
    assert!(cache.has_cache_entry_for_hash(hash));

    let locker = cache.get(RenderedTile::probe(hash));
    assert_matches!(locker.status(), CacheEntryStatus::Cached);
    assert_eq!(locker.entry().pixels, b"persisted-pixels");
    assert_eq!(locker.entry().plugin, "org.example.Render");
}

#[test]
fn test_persistent_tiles_recovered_on_reopen() {
    let _gate = PERSISTENT_GATE.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let hash = 0x9Au64 << 56 | 1;
    let tile_index;

    {
        let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
        let mut entry = RenderedTile::new(hash, b"meta");

        let mut lock = cache.retrieve_and_lock_tiles(&entry, &[], 1).unwrap();
        tile_index = lock.allocated_tiles()[0];
        lock.tile_mut(tile_index).fill(0xEE);
        cache.unlock_tiles(lock);

        entry.tiles = vec![tile_index];
        let mut locker = cache.get(entry);
        locker.insert_in_cache().unwrap();
        cache.flush_on_disk(false).unwrap();
    }

    let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
    let locker = cache.get(RenderedTile::probe(hash));
    assert_matches!(locker.status(), CacheEntryStatus::Cached);
    assert_eq!(locker.entry().tiles, vec![tile_index]);

    // The recovered entry still owns its tile and the pixels survived
    let probe = RenderedTile::probe(hash);
    let lock = cache.retrieve_and_lock_tiles(&probe, &[tile_index], 0).unwrap();
    assert!(lock.tile(tile_index).iter().all(|&b| b == 0xEE));
    cache.unlock_tiles(lock);

    // A fresh allocation must not hand the owned tile out again
    let lock = cache.retrieve_and_lock_tiles(&probe, &[], 3).unwrap();
    assert!(!lock.allocated_tiles().contains(&tile_index));
}

#[test]
fn test_persistent_eviction_survives_reopen() {
    let _gate = PERSISTENT_GATE.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let keep = 0x9Bu64 << 56 | 1;
    let evict = 0x9Cu64 << 56 | 2;

    {
        let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
        let mut locker = cache.get(RenderedTile::new(evict, b"old"));
        locker.insert_in_cache().unwrap();
        let mut locker = cache.get(RenderedTile::new(keep, b"new"));
        locker.insert_in_cache().unwrap();

        let entry = RenderedTile::probe(evict);
        cache.remove_entry(&entry);
        assert_eq!(cache.entry_count(), 1);
        cache.flush_on_disk(false).unwrap();
        // Dropping the cache joins the cleaner, which marks the removed
        // record dead in its segment before the reopen below
    }

    let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
    assert!(cache.has_cache_entry_for_hash(keep));
    assert!(!cache.has_cache_entry_for_hash(evict));
}

#[test]
fn test_only_one_persistent_cache_per_process() {
    let _gate = PERSISTENT_GATE.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();

    let first = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
    assert!(Cache::create(CacheConfig::persistent(dir.path())).is_err());

    // Volatile caches are unrestricted alongside it
    let _volatile = Cache::create(CacheConfig::volatile()).unwrap();

    drop(first);
    // After the first is gone a new persistent cache may be created
    let _second = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
}

#[test]
fn test_persistent_cache_layout() {
    let _gate = PERSISTENT_GATE.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();

    let cache = Cache::create(CacheConfig::persistent(dir.path())).unwrap();
    let cache_dir = cache.cache_directory().unwrap().to_path_buf();
    assert!(cache_dir.ends_with("Cache"));
    assert!(cache_dir.join("tiles.bin").exists());
    assert!(cache_dir.join("bucket_00.seg").exists());
    assert!(cache_dir.join("bucket_ff.seg").exists());
}
