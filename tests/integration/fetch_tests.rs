//! Fetch planning integration tests.
//!
//! Tests verify:
//! - `tilecombine` requests cover the view plus its margin
//! - Requests are throttled and deduplicated while scrolling
//! - Border, adjacent and part prefetching request the right tiles

use std::time::{Duration, Instant};

use tile_delta_cache::{DocKind, PanDirection, RecordingHost, TileEngine, TwipsRect};

use super::test_utils::{engine, engine_with, keyframe_frame, test_config, tile, view_at, TS};

const GREY: [u8; 4] = [128, 128, 128, 255];

fn tilecombines(engine: &mut TileEngine<RecordingHost>) -> Vec<String> {
    engine
        .host_mut()
        .take_sent()
        .into_iter()
        .filter(|m| m.starts_with("tilecombine"))
        .collect()
}

/// Deliver a keyframe for every current tile.
fn load_current_tiles(engine: &mut TileEngine<RecordingHost>) {
    let coords: Vec<_> = engine
        .store()
        .iter()
        .filter(|(_, t)| t.is_current())
        .map(|(c, _)| *c)
        .collect();
    for (n, c) in coords.iter().enumerate() {
        let (i, j) = c.index(TS);
        engine.on_message(keyframe_frame(i64::from(i), i64::from(j), n as u32 + 1, GREY));
    }
}

// =============================================================================
// Viewport Requests
// =============================================================================

#[test]
fn test_update_requests_view_and_margin() {
    let mut engine = engine();
    engine.update();

    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0],
        "tilecombine nviewid=0 part=0 width=4 height=4 \
         tileposx=0,60,120,180,0,60,120,180,0,60,120,180,0,60,120,180 \
         tileposy=0,0,0,0,60,60,60,60,120,120,120,120,180,180,180,180 \
         oldwid=0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0 tilewidth=60 tileheight=60"
    );
    assert_eq!(engine.store().len(), 16);
    assert_eq!(engine.empty_tile_count(), 16);
    assert_eq!(engine.counters().requests_sent, 1);
}

#[test]
fn test_pan_direction_doubles_margin() {
    let mut engine = engine();
    let mut view = view_at(0, 0);
    view.pan_direction = PanDirection::new(1, 0);
    engine.set_view(view);
    engine.update();

    // Columns 0..=4 (margin 2 to the right), rows 0..=3.
    assert_eq!(engine.store().len(), 20);
    assert!(engine.store().contains(&tile(4, 3)));
    assert!(!engine.store().contains(&tile(0, 4)));
}

#[test]
fn test_shrink_for_dehydration_drops_margin() {
    let mut engine = engine();
    engine.set_shrink_for_dehydration(true);
    engine.update();
    assert_eq!(engine.store().len(), 9);
}

#[test]
fn test_requests_are_throttled() {
    let mut engine = engine();
    engine.update();
    assert_eq!(tilecombines(&mut engine).len(), 1);

    engine.update();
    assert!(tilecombines(&mut engine).is_empty());

    engine.invalidate_tile(&tile(0, 0), 0);
    engine.update();
    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("tileposx=0 tileposy=0 "));
}

#[test]
fn test_scrolling_requests_each_tile_once() {
    let mut config = test_config();
    config.request_throttle_ms = 0;

    let mut engine = engine_with(config.clone());
    engine.update();
    engine.update();
    assert_eq!(tilecombines(&mut engine).len(), 2);

    let mut engine = engine_with(config);
    let mut view = view_at(0, 0);
    view.move_in_progress = true;
    engine.set_view(view);
    engine.update();
    engine.update();
    assert_eq!(tilecombines(&mut engine).len(), 1);
}

#[test]
fn test_stale_tile_sends_old_wire_id() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(0, 0, 9, GREY));
    engine.host_mut().take_sent();

    engine.invalidate_tile(&tile(0, 0), 9);
    engine.update();
    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("oldwid=9 "));
}

#[test]
fn test_change_part_fetches_in_one_request() {
    let mut engine = engine();
    engine.update();
    engine.host_mut().take_sent();

    let mut view = view_at(0, 0);
    view.part = 1;
    engine.set_view(view);
    engine.update_on_change_part();

    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("tilecombine nviewid=0 part=1 "));
    assert_eq!(engine.empty_tile_count(), 16);
}

#[test]
fn test_predict_and_visible_coords() {
    let mut engine = engine();
    assert_eq!(engine.predict_tiles_to_slurp(), 9);

    engine.update();
    engine.on_message(keyframe_frame(0, 0, 1, GREY));
    assert_eq!(engine.predict_tiles_to_slurp(), 8);

    let visible = engine.visible_coord_list(&TwipsRect::new(0, 0, 120, 120));
    assert_eq!(visible, vec![tile(0, 0), tile(1, 0), tile(0, 1), tile(1, 1)]);
}

#[test]
fn test_touch_for_paint_counts_misses() {
    let mut engine = engine();
    engine.update();
    assert!(engine.touch_for_paint(&tile(0, 0)).is_none());
    assert_eq!(
        engine.store().get(&tile(0, 0)).unwrap().counters.missing_content,
        1
    );

    engine.on_message(keyframe_frame(0, 0, 1, GREY));
    assert!(engine.touch_for_paint(&tile(0, 0)).is_some());
}

// =============================================================================
// Prefetch
// =============================================================================

#[test]
fn test_border_prefetch_walks_outwards() {
    let mut engine = engine();
    engine.set_view(view_at(4, 4));
    engine.update();
    load_current_tiles(&mut engine);
    assert_eq!(engine.empty_tile_count(), 0);
    engine.host_mut().take_sent();

    engine.pre_fetch_tiles(true);

    // Visible 4..=6 (9 tiles) gives an editor a budget of 3. The first ring
    // (3..=7) is already loaded, so the pass starts on the top of 2..=8.
    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("tileposx=120,180,240 tileposy=120,120,120 "));
    assert!(engine.store().contains(&tile(2, 2)));
    assert!(engine.store().contains(&tile(4, 2)));
    assert!(!engine.store().get(&tile(2, 2)).unwrap().is_current());
}

#[test]
fn test_border_prefetch_waits_for_visible_tiles() {
    let mut engine = engine();
    engine.set_view(view_at(4, 4));
    engine.update();
    engine.host_mut().take_sent();

    engine.pre_fetch_tiles(true);
    assert!(tilecombines(&mut engine).is_empty());
}

#[test]
fn test_adjacent_prefetch_requests_next_screen() {
    let mut engine = engine();
    engine.update();
    engine.host_mut().take_sent();

    let mut view = view_at(0, 0);
    view.pan_direction = PanDirection::new(0, 1);
    engine.set_view(view);

    engine.prefetch_adjacent();

    // The next screen down covers rows 2..=4, widened to 1..=6 with the
    // doubled margin below. Rows 1..=3 were just requested and are throttled.
    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains(
        "tileposx=0,60,120,180,0,60,120,180,0,60,120,180 \
         tileposy=240,240,240,240,300,300,300,300,360,360,360,360 "
    ));
    assert!(engine.store().contains(&tile(0, 6)));
    assert!(!engine.store().contains(&tile(0, 7)));
}

#[test]
fn test_adjacent_prefetch_without_pan_stays_on_view() {
    let mut engine = engine();
    engine.update();
    engine.host_mut().take_sent();

    engine.prefetch_adjacent();

    // Everything around the view was just requested and is throttled.
    assert!(tilecombines(&mut engine).is_empty());
    assert!(!engine.store().contains(&tile(0, 4)));
    assert_eq!(engine.store().len(), 16);
}

#[test]
fn test_part_prefetch_after_timer() {
    let mut engine = engine();
    let mut view = view_at(0, 0);
    view.doc_kind = DocKind::Presentation;
    view.part_count = 3;
    engine.set_view(view);
    engine.update();
    engine.host_mut().take_sent();
    assert!(engine.next_timer_deadline().is_some());

    engine.poll_timers(Instant::now() + Duration::from_secs(1));

    let sent = tilecombines(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("tilecombine nviewid=0 part=1 "));
    assert!(engine.store().iter().all(|(c, _)| c.part == 0));
}

#[test]
fn test_last_part_has_nothing_to_prefetch() {
    let mut engine = engine();
    let mut view = view_at(0, 0);
    view.doc_kind = DocKind::Presentation;
    view.part = 2;
    view.part_count = 3;
    engine.set_view(view);
    engine.update();
    engine.host_mut().take_sent();

    engine.poll_timers(Instant::now() + Duration::from_secs(1));
    assert!(tilecombines(&mut engine).is_empty());
}

#[test]
fn test_poll_timers_flushes_acknowledgements() {
    let mut engine = engine();
    engine.on_message(keyframe_frame(0, 0, 4, GREY));
    engine.poll_timers(Instant::now());

    assert_eq!(
        engine.host().sent_with_prefix("tileprocessed"),
        vec!["tileprocessed wids=4"]
    );
    assert_eq!(engine.counters().acknowledgements_sent, 1);
}
