//! Property-Based Tests for Bucket Routing and Storage
//!
//! Uses proptest to verify structural invariants across a wide range of
//! inputs.
//!
//! # Test Properties
//!
//! 1. **Routing**: every hash maps to exactly one bucket, the top byte
//! 2. **Segment Roundtrip**: append(record) → scan/read = record
//! 3. **Tile Conservation**: allocate + release leaves the free pool intact

#![cfg(test)]

use proptest::prelude::*;

use crate::cache::facade::bucket_index;
use crate::cache::BUCKET_COUNT;
use crate::storage::segment::SegmentStore;
use crate::storage::tile_pool::TilePool;

// =============================================================================
// Routing Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_bucket_index_in_range(hash in any::<u64>()) {
        let index = bucket_index(hash);
        prop_assert!(index < BUCKET_COUNT);
    }

    #[test]
    fn prop_bucket_index_is_top_byte(hash in any::<u64>()) {
        prop_assert_eq!(bucket_index(hash), (hash >> 56) as usize);
    }

    #[test]
    fn prop_bucket_index_deterministic(hash in any::<u64>()) {
        prop_assert_eq!(bucket_index(hash), bucket_index(hash));
    }
}

// =============================================================================
// Segment Store Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_segment_roundtrip(
        hash in any::<u64>(),
        size in any::<u64>(),
        plugin in "[a-z.]{0,24}",
        tiles in prop::collection::vec(any::<u32>(), 0..8),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket.seg");
        let offset;
        {
            let (store, _) = SegmentStore::open(&path, 0).unwrap();
            offset = store.append(hash, size, &plugin, &tiles, &payload).unwrap();
            let read = store.read_payload(offset).unwrap();
            prop_assert_eq!(read.as_ref(), payload.as_slice());
            store.flush().unwrap();
        }

        let (store, records) = SegmentStore::open(&path, 0).unwrap();
        prop_assert_eq!(records.len(), 1);
        prop_assert_eq!(records[0].hash, hash);
        prop_assert_eq!(records[0].size, size);
        prop_assert_eq!(&records[0].plugin_id, &plugin);
        prop_assert_eq!(&records[0].tiles, &tiles);
        let read = store.read_payload(records[0].offset).unwrap();
        prop_assert_eq!(read.as_ref(), payload.as_slice());
    }
}

// =============================================================================
// Tile Pool Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_tiles_conserved(rounds in prop::collection::vec(1usize..16, 1..8)) {
        let pool = TilePool::volatile(8, 8, None).unwrap();
        let initial_free = pool.free_tile_count();
        let mut grown = 0usize;

        for count in rounds {
            let indices: Vec<_> = {
                let lock = pool.retrieve_and_lock(&[], count).unwrap();
                lock.allocated_tiles().to_vec()
            };
            grown = pool.capacity_tiles() - initial_free;
            pool.release(&indices);
        }

        // Every tile handed out came back; growth only adds free tiles
        prop_assert_eq!(pool.free_tile_count(), initial_free + grown);
        prop_assert_eq!(pool.used_bytes(), 0);
    }
}
