//! A single cached tile and its rehydration state machine.
//!
//! ```text
//! EMPTY ── chunk ──▶ HAS_KEYFRAME ── rehydrate ──▶ REHYDRATING ── result ──▶ READY
//!                          ▲                            │                     │
//!                          └──────── new chunk ─────────┴─────────────────────┘
//! ```
//!
//! A tile is `READY` when the last id handed to the decoder has come back
//! (`decompressed_id == last_pending_id`). Anything arriving in between
//! leaves it pending and it is rehydrated again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbaImage;
use serde::Serialize;
use tracing::debug;

use crate::error::DeltaError;

use super::coords::TileCoordinate;
use super::delta::{RawDeltaChunk, RawDeltaLog};

/// A realized image ready for painting.
pub type TileBitmap = Arc<RgbaImage>;

/// Distance of a tile that is not part of the current zoom/part/mode.
pub const IRRELEVANT_DISTANCE: u64 = u64::MAX;

// =============================================================================
// Counters
// =============================================================================

/// Per-tile event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TileCounters {
    /// Deltas received since the last keyframe
    pub delta_count: u64,
    /// Unchanged (empty) deltas since the last keyframe
    pub update_count: u64,
    /// Keyframes received
    pub load_count: u64,
    /// Deltas received for a keyframe we had already thrown away
    pub gc_errors: u64,
    /// Paints that found no bitmap
    pub missing_content: u64,
    /// Server invalidations
    pub invalidate_count: u64,
}

// =============================================================================
// Rehydration Slice
// =============================================================================

/// The chunks a tile needs decoded, plus the image to apply them to.
#[derive(Debug, Clone)]
pub struct RehydrationSlice {
    pub chunks: Vec<RawDeltaChunk>,
    /// Last decoded image when the slice does not start with a keyframe
    pub base: Option<Arc<[u8]>>,
    pub first_id: u64,
    pub last_id: u64,
}

// =============================================================================
// Tile
// =============================================================================

/// One cache entry.
///
/// Owned exclusively by the tile store; nothing else holds a `Tile`.
#[derive(Debug)]
pub struct Tile {
    coords: TileCoordinate,
    raw_deltas: RawDeltaLog,
    img_data_cache: Option<Arc<[u8]>>,
    bitmap: Option<TileBitmap>,

    pub counters: TileCounters,

    /// 0 for current tiles, [`IRRELEVANT_DISTANCE`] for other renderings
    pub distance_from_view: u64,

    pub view_id: i32,

    /// Server timestamp of the newest content we hold
    pub wire_id: u32,

    /// Server timestamp of the newest invalidation
    pub invalid_from: u32,

    delta_id: u64,
    last_pending_id: u64,
    decompressed_id: u64,
    last_request: Option<Instant>,
}

impl Tile {
    pub fn new(coords: TileCoordinate) -> Self {
        Self {
            coords,
            raw_deltas: RawDeltaLog::new(),
            img_data_cache: None,
            bitmap: None,
            counters: TileCounters::default(),
            distance_from_view: IRRELEVANT_DISTANCE,
            view_id: 0,
            wire_id: 0,
            invalid_from: 0,
            delta_id: 0,
            last_pending_id: 0,
            decompressed_id: 0,
            last_request: None,
        }
    }

    pub fn coords(&self) -> TileCoordinate {
        self.coords
    }

    pub fn raw_deltas(&self) -> &RawDeltaLog {
        &self.raw_deltas
    }

    pub fn bitmap(&self) -> Option<&TileBitmap> {
        self.bitmap.as_ref()
    }

    pub fn img_data_cache(&self) -> Option<&Arc<[u8]>> {
        self.img_data_cache.as_ref()
    }

    pub fn last_pending_id(&self) -> u64 {
        self.last_pending_id
    }

    pub fn decompressed_id(&self) -> u64 {
        self.decompressed_id
    }

    // -------------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------------

    pub fn is_current(&self) -> bool {
        self.distance_from_view == 0
    }

    pub fn has_keyframe(&self) -> bool {
        !self.raw_deltas.is_empty()
    }

    pub fn has_content(&self) -> bool {
        self.img_data_cache.is_some() || self.has_keyframe() || self.bitmap.is_some()
    }

    /// Stale (invalidated after our newest content) or empty.
    pub fn needs_fetch(&self) -> bool {
        self.invalid_from >= self.wire_id || !self.has_content()
    }

    pub fn is_ready(&self) -> bool {
        self.decompressed_id == self.last_pending_id
    }

    pub fn needs_rehydration(&self) -> bool {
        self.has_keyframe() && (self.img_data_cache.is_none() || !self.is_ready())
    }

    // -------------------------------------------------------------------------
    // Wire Input
    // -------------------------------------------------------------------------

    /// Record a compressed chunk and return its id.
    ///
    /// # Errors
    ///
    /// [`DeltaError::NoBaseImage`] for a delta when no keyframe is retained.
    pub fn append_chunk(&mut self, bytes: Bytes, is_keyframe: bool) -> Result<u64, DeltaError> {
        let id = self.delta_id + 1;
        self.raw_deltas
            .push(RawDeltaChunk::new(bytes, id, is_keyframe))?;
        self.delta_id = id;
        self.last_pending_id = id;

        if is_keyframe {
            self.counters.load_count += 1;
            self.counters.delta_count = 0;
            self.counters.update_count = 0;
        } else {
            self.counters.delta_count += 1;
        }
        Ok(id)
    }

    /// Record an empty delta: content unchanged, only the wire id moves.
    pub fn note_unchanged(&mut self) {
        self.counters.update_count += 1;
    }

    /// Mark stale from `wire_id` onwards, keeping the pixels on screen.
    ///
    /// A zero `wire_id` means "whatever we have now".
    pub fn invalidate(&mut self, wire_id: u32) {
        self.counters.invalidate_count += 1;
        self.allow_fast_request();
        self.invalid_from = if wire_id == 0 { self.wire_id } else { wire_id };
    }

    /// Forget the server's idea of our keyframe so the next fetch sends one.
    pub fn force_keyframe(&mut self) {
        self.wire_id = 0;
        self.invalid_from = 0;
        self.allow_fast_request();
    }

    // -------------------------------------------------------------------------
    // Request Throttling
    // -------------------------------------------------------------------------

    pub fn allow_fast_request(&mut self) {
        self.last_request = None;
    }

    /// True if a request went out less than `throttle` ago.
    pub fn request_throttled(&self, now: Instant, throttle: Duration) -> bool {
        self.last_request
            .is_some_and(|at| now.saturating_duration_since(at) < throttle)
    }

    pub fn mark_requested(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    // -------------------------------------------------------------------------
    // Rehydration
    // -------------------------------------------------------------------------

    /// Chunks still to decode, or `None` if there is nothing to do.
    ///
    /// Continues from the cached image when the log still reaches back to it,
    /// otherwise restarts from the keyframe.
    pub fn rehydration_request(&mut self) -> Option<RehydrationSlice> {
        let first = self.raw_deltas.first_id()?;
        let last = self.raw_deltas.last_id()?;
        self.last_pending_id = last;

        let continues = self.img_data_cache.is_some()
            && self.decompressed_id >= first
            && self.decompressed_id < last;

        let (chunks, base) = if continues {
            let chunks = self.raw_deltas.since(self.decompressed_id);
            if chunks[0].id != self.decompressed_id + 1 && !chunks[0].is_keyframe {
                debug!(
                    key = %self.coords,
                    expected = self.decompressed_id + 1,
                    got = chunks[0].id,
                    "Unusual: discontiguous delta ids"
                );
            }
            (chunks.to_vec(), self.img_data_cache.clone())
        } else if self.img_data_cache.is_none() || self.decompressed_id < first {
            (self.raw_deltas.chunks().to_vec(), None)
        } else {
            return None;
        };

        Some(RehydrationSlice {
            first_id: chunks[0].id,
            last_id: last,
            chunks,
            base,
        })
    }

    /// True if a result covering up to `last_id` is still wanted.
    pub fn wants_result(&self, last_id: u64) -> bool {
        self.decompressed_id < last_id && last_id <= self.last_pending_id
    }

    /// Store a decoded image and return the bitmap to install.
    pub fn accept_decoded(&mut self, last_id: u64, pixels: Vec<u8>, tile_size: u32) -> Option<TileBitmap> {
        let cache: Arc<[u8]> = Arc::from(pixels.as_slice());
        let image = RgbaImage::from_raw(tile_size, tile_size, pixels)?;
        self.img_data_cache = Some(cache);
        self.decompressed_id = last_id;
        Some(Arc::new(image))
    }

    // -------------------------------------------------------------------------
    // Store Hooks
    // -------------------------------------------------------------------------

    /// Swap in a bitmap, returning the old one.
    pub(crate) fn replace_bitmap(&mut self, bitmap: TileBitmap) -> Option<TileBitmap> {
        self.bitmap.replace(bitmap)
    }

    /// Drop decoded pixels; the raw log stays so the tile can be rebuilt.
    pub(crate) fn release_decoded(&mut self) -> Option<TileBitmap> {
        self.img_data_cache = None;
        self.decompressed_id = 0;
        self.last_pending_id = 0;
        self.bitmap.take()
    }

    /// Drop the raw log and return the bytes freed.
    pub(crate) fn clear_raw_deltas(&mut self) -> usize {
        let freed = self.raw_deltas.byte_len();
        self.raw_deltas.clear();
        freed
    }
}

// =============================================================================
// Tests
// =============================================================================
