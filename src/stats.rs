//! Engine statistics.
//!
//! A [`TileStats`] snapshot is cheap to take and serializes to JSON; the
//! `replay` command prints one at the end of a run.

use serde::Serialize;

use crate::tile::TileCounters;

/// Engine-wide event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    /// Frames handled
    pub messages: u64,
    /// Frames that failed to parse
    pub protocol_errors: u64,
    /// Empty deltas applied to a tile with a keyframe
    pub null_delta_updates: u64,
    pub gc_runs: u64,
    pub gc_reclaimed_tiles: u64,
    pub gc_removed_tiles: u64,
    /// Tiles whose chunks could not be decoded
    pub decode_errors: u64,
    pub worker_failures: u64,
    /// `tilecombine` messages sent
    pub requests_sent: u64,
    /// `tileprocessed` messages sent
    pub acknowledgements_sent: u64,
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TileStats {
    pub tiles: usize,
    pub bitmaps: usize,
    pub current_tiles: usize,
    pub raw_delta_bytes: usize,
    pub non_current_raw_delta_bytes: usize,
    pub worker_enabled: bool,
    pub counters: EngineCounters,
    /// Per-tile counters summed over all stored tiles
    pub tile_totals: TileCounters,
}

impl TileStats {
    /// Add one tile's counters to the totals.
    pub fn add_tile_counters(&mut self, counters: &TileCounters) {
        let t = &mut self.tile_totals;
        t.delta_count += counters.delta_count;
        t.update_count += counters.update_count;
        t.load_count += counters.load_count;
        t.gc_errors += counters.gc_errors;
        t.missing_content += counters.missing_content;
        t.invalidate_count += counters.invalidate_count;
    }
}
