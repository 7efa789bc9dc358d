//! Garbage collection integration tests.
//!
//! Tests verify:
//! - Memory pressure reclaims the farthest tiles first
//! - Current tiles survive every kind of eviction
//! - Collection converges below the low watermarks

use bytes::Bytes;
use proptest::prelude::*;

use tile_delta_cache::{GcWatermarks, TileCoordinate, TileStore};

use super::test_utils::{engine_with, keyframe_frame, keyframe_payload, test_config, tile, view_at};

const RED: [u8; 4] = [255, 0, 0, 255];

// =============================================================================
// Engine-Level Collection
// =============================================================================

#[test]
fn test_memory_pressure_eviction_order() {
    // Every solid red keyframe compresses to the same size.
    let size = keyframe_payload(RED).len() - 1;
    let mut config = test_config();
    config.gc = GcWatermarks {
        high_delta_bytes: 5 * size,
        low_delta_bytes: 3 * size,
        high_tile_count: 1000,
        low_tile_count: 900,
    };
    let mut engine = engine_with(config);
    engine.update();

    // The view's expanded range ends at column 3, so column i is i - 3 away.
    for i in 4..10 {
        engine.on_message(keyframe_frame(i, 0, i as u32, RED));
    }
    assert_eq!(engine.store().non_current_raw_bytes(), 6 * size);

    engine.garbage_collect();

    for i in 4..7 {
        assert!(engine.store().get(&tile(i, 0)).unwrap().has_keyframe(), "column {i} kept");
    }
    for i in 7..10 {
        let t = engine.store().get(&tile(i, 0)).unwrap();
        assert!(!t.has_keyframe(), "column {i} reclaimed");
        assert_eq!(t.wire_id, 0);
    }
    assert_eq!(engine.store().non_current_raw_bytes(), 3 * size);
    assert_eq!(engine.counters().gc_reclaimed_tiles, 3);
}

#[test]
fn test_discard_all_keeps_current_tiles() {
    let mut engine = engine_with(test_config());
    engine.update();
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.on_message(keyframe_frame(1, 0, 2, RED));
    engine.on_message(keyframe_frame(12, 12, 3, RED));
    engine.on_message(keyframe_frame(13, 12, 4, RED));

    engine.discard_all_cache();

    for c in [tile(0, 0), tile(1, 0)] {
        let t = engine.store().get(&c).unwrap();
        assert!(t.has_keyframe());
        assert!(t.bitmap().is_some());
    }
    assert!(!engine.store().contains(&tile(12, 12)));
    assert!(!engine.store().contains(&tile(13, 12)));
    assert!(engine.store().iter().all(|(_, t)| t.is_current()));
}

#[test]
fn test_prune_after_scrolling_away() {
    let mut config = test_config();
    config.gc = GcWatermarks::discard_all();
    let mut engine = engine_with(config);
    engine.update();
    engine.on_message(keyframe_frame(0, 0, 1, RED));

    // Scroll far away without fetching, then re-rank and collect.
    engine.set_view(view_at(10, 10));
    let bounds = engine.view().pixel_bounds;
    engine.get_missing_tiles(&bounds, 10, true);
    engine.prune_tiles();

    assert!(!engine.store().contains(&tile(0, 0)));
}

#[test]
fn test_remove_tile_refuses_current_content() {
    let mut store = TileStore::default();
    let c = TileCoordinate::new(0, 0, 10, 0, 0);
    let t = store.get_or_create(c);
    t.append_chunk(Bytes::from_static(b"kf"), true).unwrap();
    t.distance_from_view = 0;

    assert!(store.remove_tile(&c).is_none());
    assert!(store.contains(&c));

    store.get_mut(&c).unwrap().distance_from_view = 3;
    assert!(store.remove_tile(&c).is_some());
}

// =============================================================================
// Properties
// =============================================================================

fn build_store(tiles: &[(u64, usize)]) -> TileStore {
    let mut store = TileStore::default();
    for (n, &(distance, len)) in tiles.iter().enumerate() {
        let c = TileCoordinate::from_index(n as i32, 0, 256, 10, 0, 0);
        let t = store.get_or_create(c);
        t.append_chunk(Bytes::from(vec![0u8; len]), true).unwrap();
        t.distance_from_view = distance;
    }
    store
}

proptest! {
    #[test]
    fn prop_current_tiles_survive_gc(
        tiles in proptest::collection::vec((0u64..6, 1usize..400), 1..60),
        high in 0usize..4000,
        count in 0usize..40,
    ) {
        let mut store = build_store(&tiles);
        let current: Vec<TileCoordinate> = store
            .iter()
            .filter(|(_, t)| t.is_current())
            .map(|(c, _)| *c)
            .collect();

        store.garbage_collect(&GcWatermarks {
            high_delta_bytes: high,
            low_delta_bytes: high / 2,
            high_tile_count: count,
            low_tile_count: count / 2,
        });

        for c in &current {
            let t = store.get(c);
            prop_assert!(t.is_some_and(|t| t.has_keyframe()));
        }
    }

    #[test]
    fn prop_gc_converges_below_low_watermarks(
        tiles in proptest::collection::vec((0u64..20, 1usize..400), 1..60),
        high in 0usize..4000,
        count in 0usize..40,
    ) {
        let mut store = build_store(&tiles);
        let watermarks = GcWatermarks {
            high_delta_bytes: high,
            low_delta_bytes: high / 2,
            high_tile_count: count,
            low_tile_count: count / 2,
        };
        let bytes_before = store.non_current_raw_bytes();
        let count_before = store.len();

        store.garbage_collect(&watermarks);

        let reclaimable = store
            .iter()
            .filter(|(_, t)| !t.is_current() && t.has_keyframe())
            .count();
        if bytes_before > watermarks.high_delta_bytes {
            prop_assert!(store.non_current_raw_bytes() <= watermarks.low_delta_bytes || reclaimable == 0);
        }

        let non_current = store.iter().filter(|(_, t)| !t.is_current()).count();
        if count_before > watermarks.high_tile_count {
            prop_assert!(store.len() <= watermarks.low_tile_count || non_current == 0);
        }
    }

    #[test]
    fn prop_memory_pass_reclaims_farthest_first(
        tiles in proptest::collection::vec((1u64..20, 1usize..400), 1..60),
        high in 0usize..4000,
    ) {
        let mut store = build_store(&tiles);
        store.garbage_collect(&GcWatermarks {
            high_delta_bytes: high,
            low_delta_bytes: high / 2,
            high_tile_count: usize::MAX,
            low_tile_count: usize::MAX,
        });

        let nearest_reclaimed = store
            .iter()
            .filter(|(_, t)| !t.has_keyframe())
            .map(|(_, t)| t.distance_from_view)
            .min();
        let farthest_kept = store
            .iter()
            .filter(|(_, t)| t.has_keyframe())
            .map(|(_, t)| t.distance_from_view)
            .max();
        if let (Some(reclaimed), Some(kept)) = (nearest_reclaimed, farthest_kept) {
            prop_assert!(reclaimed >= kept);
        }
    }
}
