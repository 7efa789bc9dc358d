//! Tile lifecycle integration tests.
//!
//! Tests verify:
//! - Keyframes create tiles and queue acknowledgements
//! - Deltas rebuild pixels on top of the last decoded image
//! - Deltas without a keyframe schedule a keyframe re-fetch
//! - Invalidation marks tiles stale until a newer wire id arrives

use bytes::Bytes;
use tile_delta_cache::TileCoordinate;

use super::test_utils::{
    delta_frame, engine, frame, invalidate_frame, keyframe_frame, pixel, span_ops, tile,
    tile_header, unchanged_frame, view_at,
};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];

// =============================================================================
// Keyframes
// =============================================================================

#[test]
fn test_fresh_tile_lifecycle() {
    let mut engine = engine();
    assert!(engine.store().is_empty());

    engine.on_message(keyframe_frame(0, 0, 7, RED));

    let coords = TileCoordinate::new(0, 0, 10, 0, 0);
    assert_eq!(engine.store().len(), 1);
    let t = engine.store().get(&coords).unwrap();
    assert!(t.has_keyframe());
    assert!(!t.needs_fetch());
    assert_eq!(t.wire_id, 7);
    assert_eq!(engine.queued_acknowledgements(), &[7]);
}

#[test]
fn test_keyframe_for_visible_tile_is_painted() {
    let mut engine = engine();
    engine.update();
    engine.host_mut().take_sent();

    engine.on_message(keyframe_frame(1, 1, 3, RED));

    let coords = tile(1, 1);
    assert_eq!(pixel(&engine, &coords, 0, 0), RED);
    assert_eq!(pixel(&engine, &coords, 3, 3), RED);
    assert!(engine.store().get(&coords).unwrap().is_ready());
    assert_eq!(engine.host().events.dirty, 1);
}

#[test]
fn test_off_view_keyframe_stays_compressed() {
    let mut engine = engine();
    engine.update();

    engine.on_message(keyframe_frame(10, 10, 3, RED));

    let t = engine.store().get(&tile(10, 10)).unwrap();
    assert!(t.has_keyframe());
    assert!(t.bitmap().is_none());
    assert!(!t.is_current());
}

#[test]
fn test_all_tiles_loaded_fires_once() {
    let mut engine = engine();
    engine.update();
    let pending = engine.empty_tile_count();
    assert!(pending > 0);

    let coords: Vec<TileCoordinate> = engine
        .store()
        .iter()
        .filter(|(_, t)| t.is_current())
        .map(|(c, _)| *c)
        .collect();
    for (n, c) in coords.iter().enumerate() {
        let (i, j) = c.index(super::test_utils::TS);
        engine.on_message(keyframe_frame(i64::from(i), i64::from(j), n as u32 + 1, GREEN));
    }

    assert_eq!(engine.empty_tile_count(), 0);
    assert_eq!(engine.host().events.all_tiles_loaded, 1);
}

// =============================================================================
// Deltas
// =============================================================================

#[test]
fn test_delta_applies_on_decoded_image() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.on_message(delta_frame(0, 0, 2, &span_ops(2, 1, BLUE, 2)));

    let coords = tile(0, 0);
    assert_eq!(pixel(&engine, &coords, 1, 2), BLUE);
    assert_eq!(pixel(&engine, &coords, 2, 2), BLUE);
    assert_eq!(pixel(&engine, &coords, 3, 2), RED);

    let t = engine.store().get(&coords).unwrap();
    assert_eq!(t.raw_deltas().len(), 2);
    assert!(t.is_ready());
    assert_eq!(t.counters.delta_count, 1);
    assert_eq!(engine.queued_acknowledgements(), &[1, 2]);
}

#[test]
fn test_deltas_on_hidden_tile_replay_when_it_becomes_visible() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(8, 8, 1, RED));
    engine.on_message(delta_frame(8, 8, 2, &span_ops(0, 0, BLUE, 1)));
    assert!(engine.store().get(&tile(8, 8)).unwrap().bitmap().is_none());

    engine.set_view(view_at(8, 8));
    engine.update();

    let coords = tile(8, 8);
    assert_eq!(pixel(&engine, &coords, 0, 0), BLUE);
    assert_eq!(pixel(&engine, &coords, 1, 0), RED);

    // Counted on arrival, not again when rebuilt from the log.
    let counters = engine.store().get(&coords).unwrap().counters;
    assert_eq!(counters.load_count, 1);
    assert_eq!(counters.delta_count, 1);
}

#[test]
fn test_unchanged_delta_only_moves_wire_id() {
    let mut engine = engine();
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.on_message(unchanged_frame(0, 0, 2));

    let t = engine.store().get(&tile(0, 0)).unwrap();
    assert_eq!(t.wire_id, 2);
    assert_eq!(t.raw_deltas().len(), 1);
    assert_eq!(t.counters.update_count, 1);
    assert_eq!(engine.counters().null_delta_updates, 1);
    assert_eq!(engine.queued_acknowledgements(), &[1, 2]);
}

#[test]
fn test_delta_without_keyframe() {
    let mut engine = engine();
    engine.on_message(delta_frame(0, 0, 4, &span_ops(0, 0, BLUE, 1)));

    let coords = tile(0, 0);
    let t = engine.store().get(&coords).unwrap();
    assert_eq!(t.counters.gc_errors, 1);
    assert!(!t.has_keyframe());
    assert!(t.bitmap().is_none());
    assert_eq!(t.wire_id, 0);
    assert_eq!(engine.fetch_keyframe_queue(), &[coords]);
}

#[test]
fn test_lost_keyframes_are_refetched_on_flush() {
    let mut engine = engine();
    engine.on_message(delta_frame(2, 0, 4, &span_ops(0, 0, BLUE, 1)));
    engine.flush_acknowledgements();

    let sent = engine.host().sent.clone();
    assert_eq!(sent[0], "tileprocessed wids=4");
    assert!(sent[1].starts_with("tilecombine nviewid=0 part=0 width=4 height=4 tileposx=120 tileposy=0 oldwid=0"));
    assert!(engine.fetch_keyframe_queue().is_empty());
}

#[test]
fn test_corrupt_keyframe_is_refetched() {
    let mut engine = engine();
    engine.update();
    engine.on_message(frame(&tile_header("tile", 0, 0, 1), b"Znot zstd"));

    let coords = tile(0, 0);
    assert_eq!(engine.counters().decode_errors, 1);
    assert!(!engine.store().get(&coords).unwrap().has_keyframe());
    assert_eq!(engine.fetch_keyframe_queue(), &[coords]);
}

#[test]
fn test_preview_bypasses_cache() {
    let mut engine = engine();
    let header = "tile: nviewid=0 part=2 width=120 height=90 tileposx=0 tileposy=0 tilewidth=9000 tileheight=6750 wid=11 id=slide-2";
    engine.on_message(frame(header, &[0x89, b'P', b'N', b'G']));

    assert!(engine.store().is_empty());
    assert_eq!(engine.host().previews.len(), 1);
    assert_eq!(engine.host().previews[0].id, "slide-2");
    assert_eq!(engine.host().previews[0].part, 2);
    assert_eq!(engine.queued_acknowledgements(), &[11]);
}

#[test]
fn test_garbage_frames_are_counted_and_ignored() {
    let mut engine = engine();
    engine.on_message(Bytes::from_static(b"status: ok"));
    engine.on_message(Bytes::new());

    assert_eq!(engine.counters().messages, 2);
    assert_eq!(engine.counters().protocol_errors, 2);
    assert!(engine.store().is_empty());
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_invalidate_then_refetch() {
    let mut engine = engine();
    engine.on_message(keyframe_frame(0, 0, 5, RED));
    let coords = tile(0, 0);

    engine.invalidate_tile(&coords, 5);
    let t = engine.store().get(&coords).unwrap();
    assert_eq!(t.invalid_from, 5);
    assert!(t.needs_fetch());

    engine.on_message(keyframe_frame(0, 0, 6, BLUE));
    assert!(!engine.store().get(&coords).unwrap().needs_fetch());
}

#[test]
fn test_invalidation_message_requests_stale_tiles() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(1, 0, 5, RED));
    engine.host_mut().take_sent();

    engine.on_message(invalidate_frame(1, 0, 5));

    let coords = tile(1, 0);
    let t = engine.store().get(&coords).unwrap();
    assert!(t.needs_fetch());
    // Stale pixels stay on screen until the new tile arrives.
    assert!(t.bitmap().is_some());

    let sent = engine.host().sent_with_prefix("tilecombine");
    assert!(sent.iter().any(|m| m.contains("oldwid=5")));
}

#[test]
fn test_invalidating_empty_tile_removes_it() {
    let mut engine = engine();
    engine.update();
    let coords = tile(0, 0);
    assert!(engine.store().contains(&coords));

    engine.invalidate_tile(&coords, 0);
    assert!(!engine.store().contains(&coords));
}

#[test]
fn test_refresh_in_background_keeps_pixels() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(0, 0, 5, RED));

    engine.refresh_tiles_in_background();

    let t = engine.store().get(&tile(0, 0)).unwrap();
    assert_eq!(t.wire_id, 0);
    assert!(t.needs_fetch());
    assert!(t.bitmap().is_some());
}
