//! Decompression worker and transaction integration tests.
//!
//! Tests verify:
//! - Batches decoded on the worker thread are installed on completion
//! - Every transaction callback runs exactly once, including when the
//!   worker goes away mid-batch
//! - The engine falls back to inline decoding after a worker failure
//! - Drawing pauses while visible tiles are rebuilt and resumes afterwards

use proptest::prelude::*;

use tile_delta_cache::{RecordingHost, Transport};

use super::test_utils::{engine, engine_with, keyframe_frame, pixel, test_config, tile, view_at};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn worker_engine() -> tile_delta_cache::TileEngine<RecordingHost> {
    let mut config = test_config();
    config.use_worker = true;
    engine_with(config)
}

fn callbacks_run(host: &RecordingHost) -> Vec<String> {
    let mut ran: Vec<String> = host
        .sent
        .iter()
        .filter(|m| m.starts_with("cb"))
        .cloned()
        .collect();
    ran.sort();
    ran
}

// =============================================================================
// Worker Thread
// =============================================================================

#[tokio::test]
async fn test_worker_decodes_visible_tile() {
    let mut engine = worker_engine();
    assert!(engine.worker_enabled());
    engine.update();

    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.wait_for_worker().await;

    assert_eq!(pixel(&engine, &tile(0, 0), 2, 2), RED);
    assert!(engine.store().get(&tile(0, 0)).unwrap().is_ready());
    assert!(engine.worker_enabled());
}

#[tokio::test]
async fn test_callback_waits_for_batch() {
    let mut engine = worker_engine();
    engine.update();

    engine.begin_transaction();
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.end_transaction_with(|host: &mut RecordingHost| host.send_message("cb0"));
    assert!(callbacks_run(engine.host()).is_empty());

    engine.wait_for_worker().await;
    assert_eq!(callbacks_run(engine.host()), vec!["cb0"]);
}

#[tokio::test]
async fn test_callbacks_drain_when_worker_dies() {
    let mut engine = worker_engine();
    engine.update();

    engine.begin_transaction();
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    engine.end_transaction_with(|host: &mut RecordingHost| host.send_message("cb0"));

    // Second batch waits behind the first.
    engine.begin_transaction();
    engine.on_message(keyframe_frame(1, 0, 2, BLUE));
    engine.end_transaction_with(|host: &mut RecordingHost| host.send_message("cb1"));

    engine.worker_mut().unwrap().terminate();
    engine.wait_for_worker().await;

    assert_eq!(callbacks_run(engine.host()), vec!["cb0", "cb1"]);
    assert!(!engine.worker_enabled());
    assert_eq!(engine.counters().worker_failures, 1);
    assert!(!engine.stats().worker_enabled);
}

#[tokio::test]
async fn test_inline_decoding_after_worker_failure() {
    let mut engine = worker_engine();
    engine.update();
    engine.worker_mut().unwrap().terminate();

    // Submitting to a stopped worker fails over to inline decoding.
    engine.on_message(keyframe_frame(0, 0, 1, RED));
    assert!(!engine.worker_enabled());

    // Recovery dropped the cache and asked for the view again.
    assert!(engine.host().events.redraws >= 1);
    engine.on_message(keyframe_frame(0, 0, 2, BLUE));
    assert_eq!(pixel(&engine, &tile(0, 0), 0, 0), BLUE);
}

// =============================================================================
// Dehydrated View
// =============================================================================

#[tokio::test]
async fn test_drawing_paused_until_visible_tile_rebuilt() {
    let mut engine = worker_engine();
    engine.update();

    // Arrives while off-view, so it is stored compressed only.
    engine.on_message(keyframe_frame(8, 8, 1, RED));
    assert!(engine.store().get(&tile(8, 8)).unwrap().bitmap().is_none());
    assert_eq!(engine.host().events.pauses, 0);

    engine.set_view(view_at(8, 8));
    engine.update();

    assert_eq!(engine.host().events.pauses, 1);
    assert_eq!(engine.host().events.resumes, 0);
    assert!(engine.is_drawing_paused());
    assert!(engine.host().paused);

    engine.wait_for_worker().await;

    assert_eq!(engine.host().events.resumes, 1);
    assert!(!engine.is_drawing_paused());
    assert!(!engine.host().paused);
    assert_eq!(pixel(&engine, &tile(8, 8), 1, 1), RED);
}

#[test]
fn test_inline_rebuild_pauses_and_resumes_in_one_update() {
    let mut engine = engine();
    engine.update();
    engine.on_message(keyframe_frame(8, 8, 1, BLUE));

    engine.set_view(view_at(8, 8));
    engine.update();

    assert_eq!(engine.host().events.pauses, 1);
    assert_eq!(engine.host().events.resumes, 1);
    assert!(!engine.is_drawing_paused());
    assert_eq!(pixel(&engine, &tile(8, 8), 0, 0), BLUE);
}

// =============================================================================
// Transaction Draining
// =============================================================================

proptest! {
    #[test]
    fn prop_every_callback_runs_once(
        groups in proptest::collection::vec((1usize..4, proptest::collection::vec((0i64..3, 0i64..3), 0..3)), 1..8)
    ) {
        let mut engine = engine();
        engine.update();

        let mut expected = Vec::new();
        let mut wid = 1;
        for (n, (depth, frames)) in groups.iter().enumerate() {
            for _ in 0..*depth {
                engine.begin_transaction();
            }
            for &(i, j) in frames {
                engine.on_message(keyframe_frame(i, j, wid, RED));
                wid += 1;
            }
            for d in 0..*depth {
                let name = format!("cb{n:02}-{d}");
                expected.push(name.clone());
                engine.end_transaction_with(move |host: &mut RecordingHost| host.send_message(&name));
            }
        }
        expected.sort();

        prop_assert_eq!(callbacks_run(engine.host()), expected);
    }
}
