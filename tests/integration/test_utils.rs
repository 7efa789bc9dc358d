//! Test utilities for integration tests.
//!
//! This module provides frame builders for the tile wire protocol and a
//! small engine fixture on top of [`RecordingHost`].

use bytes::Bytes;

use tile_delta_cache::{
    compress_payload, EngineConfig, PixelBounds, RecordingHost, TileCoordinate, TileEngine,
    ViewState,
};

/// Tile size used throughout the integration tests.
pub const TS: i32 = 4;

/// Twips per tile edge for [`TS`].
pub const TILE_TWIPS: i64 = TS as i64 * 15;

pub const TILE_BYTES: usize = (TS * TS * 4) as usize;

// =============================================================================
// Engine Fixture
// =============================================================================

pub fn test_config() -> EngineConfig {
    EngineConfig {
        tile_size: TS as u32,
        use_worker: false,
        ..EngineConfig::default()
    }
}

/// Engine over a 16x16 tile document, viewing the top-left 2x2 tiles.
pub fn engine_with(config: EngineConfig) -> TileEngine<RecordingHost> {
    let mut engine = TileEngine::new(RecordingHost::new(TS, 16, 16), config);
    engine.set_view(view_at(0, 0));
    engine
}

pub fn engine() -> TileEngine<RecordingHost> {
    engine_with(test_config())
}

/// 2x2 tile view whose top-left tile is `(i, j)`.
pub fn view_at(i: i32, j: i32) -> ViewState {
    ViewState {
        pixel_bounds: PixelBounds::from_origin_size(i * TS, j * TS, 2 * TS, 2 * TS),
        ..ViewState::default()
    }
}

/// Coordinates of tile `(i, j)` at zoom 10, part 0.
pub fn tile(i: i32, j: i32) -> TileCoordinate {
    TileCoordinate::from_index(i, j, TS, 10, 0, 0)
}

// =============================================================================
// Payload Builders
// =============================================================================

/// A solid-colour keyframe, zstd-compressed with its `Z` marker.
pub fn keyframe_payload(rgba: [u8; 4]) -> Vec<u8> {
    let raw: Vec<u8> = rgba.iter().copied().cycle().take(TILE_BYTES).collect();
    let mut payload = vec![b'Z'];
    payload.extend_from_slice(&compress_payload(&raw).unwrap());
    payload
}

/// An op-code stream, zstd-compressed with its `D` marker.
pub fn delta_payload(ops: &[u8]) -> Vec<u8> {
    let mut payload = vec![b'D'];
    payload.extend_from_slice(&compress_payload(ops).unwrap());
    payload
}

/// `d` op painting `count` pixels of `rgba` at `(row, col)`, then `t`.
pub fn span_ops(row: u8, col: u8, rgba: [u8; 4], count: u8) -> Vec<u8> {
    let mut ops = vec![b'd', row, col, count];
    for _ in 0..count {
        ops.extend_from_slice(&rgba);
    }
    ops.push(b't');
    ops
}

// =============================================================================
// Frame Builders
// =============================================================================

/// `tile:` or `delta:` header for tile `(i, j)` of part 0.
pub fn tile_header(command: &str, i: i64, j: i64, wid: u32) -> String {
    format!(
        "{command}: nviewid=0 part=0 width={TS} height={TS} tileposx={} tileposy={} tilewidth={TILE_TWIPS} tileheight={TILE_TWIPS} wid={wid}",
        i * TILE_TWIPS,
        j * TILE_TWIPS,
    )
}

pub fn frame(header: &str, payload: &[u8]) -> Bytes {
    let mut bytes = header.as_bytes().to_vec();
    bytes.push(b'\n');
    bytes.extend_from_slice(payload);
    Bytes::from(bytes)
}

pub fn keyframe_frame(i: i64, j: i64, wid: u32, rgba: [u8; 4]) -> Bytes {
    frame(&tile_header("tile", i, j, wid), &keyframe_payload(rgba))
}

pub fn delta_frame(i: i64, j: i64, wid: u32, ops: &[u8]) -> Bytes {
    frame(&tile_header("delta", i, j, wid), &delta_payload(ops))
}

/// Empty delta: the tile did not change.
pub fn unchanged_frame(i: i64, j: i64, wid: u32) -> Bytes {
    frame(&tile_header("delta", i, j, wid), b"D")
}

pub fn invalidate_frame(i: i64, j: i64, wid: u32) -> Bytes {
    Bytes::from(format!(
        "invalidatetiles: part=0 x={} y={} width={TILE_TWIPS} height={TILE_TWIPS} wid={wid}",
        i * TILE_TWIPS,
        j * TILE_TWIPS,
    ))
}

// =============================================================================
// Assertions
// =============================================================================

/// RGBA of the pixel at `(col, row)` of a tile's bitmap.
pub fn pixel(engine: &TileEngine<RecordingHost>, coords: &TileCoordinate, col: u32, row: u32) -> [u8; 4] {
    let bitmap = engine
        .store()
        .get(coords)
        .and_then(|t| t.bitmap())
        .expect("tile has a bitmap");
    bitmap.get_pixel(col, row).0
}
