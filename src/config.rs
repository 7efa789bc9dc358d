//! Configuration for the tile engine and the `tile-delta-cache` binary.
//!
//! [`EngineConfig`] is the library-side configuration: cache limits, request
//! throttling, prefetch timings. It is plain data with serde support so it can
//! be embedded in a host application's own config file.
//!
//! The binary exposes it through clap. Every engine option is also settable
//! through an environment variable with the `TDC_` prefix:
//!
//! - `TDC_TILE_SIZE` - Tile size in pixels (default: 256)
//! - `TDC_NO_WORKER` - Decode on the calling thread instead of a worker
//! - `TDC_GC_HIGH_MIB` - Raw delta high watermark in MiB (default: 120)
//! - `TDC_GC_LOW_MIB` - Raw delta low watermark in MiB (default: 100)
//! - `TDC_MAX_TILES` - Tile count high watermark (default: 2048)
//! - `TDC_DEBUG_DELTAS` - Trace individual delta op-codes

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::geometry::DocKind;
use crate::tile::{
    GcWatermarks, DEFAULT_BITMAP_HIGH_WATER, DEFAULT_HIGH_DELTA_BYTES, DEFAULT_HIGH_TILE_COUNT,
    DEFAULT_LOW_DELTA_BYTES,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Largest supported tile edge; delta operands are single bytes.
pub const MAX_TILE_SIZE: u32 = 256;

/// Minimum time between two requests for the same tile.
pub const DEFAULT_REQUEST_THROTTLE_MS: u64 = 5000;

/// Idle time before border prefetch starts.
pub const DEFAULT_PREFETCH_IDLE_MS: u64 = 750;

/// Interval between border prefetch passes.
pub const DEFAULT_PREFETCH_INTERVAL_MS: u64 = 250;

/// Delay before the adjacent-area prefetch.
pub const DEFAULT_ADJACENT_DELAY_MS: u64 = 50;

/// Delay before the next-part prefetch.
pub const DEFAULT_PART_DELAY_MS: u64 = 100;

/// Border rings fetched for users who can edit.
pub const DEFAULT_MAX_BORDER_WIDTH_EDIT: u32 = 10;

/// Border rings fetched for read-only viewers.
pub const DEFAULT_MAX_BORDER_WIDTH_READONLY: u32 = 40;

const MIB: usize = 1024 * 1024;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Tunables of a [`TileEngine`](crate::engine::TileEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tile edge in pixels
    pub tile_size: u32,

    pub gc: GcWatermarks,

    /// Realized bitmaps kept before the farthest is reclaimed
    pub bitmap_high_water: usize,

    /// Tiles of margin fetched around the view
    pub view_margin: u32,

    pub request_throttle_ms: u64,
    pub prefetch_idle_ms: u64,
    pub prefetch_interval_ms: u64,
    pub adjacent_delay_ms: u64,
    pub part_delay_ms: u64,

    /// Decode on a dedicated thread
    pub use_worker: bool,

    /// Trace delta op-codes and dump payload prefixes
    pub debug_deltas: bool,

    pub max_border_width_edit: u32,
    pub max_border_width_readonly: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            gc: GcWatermarks::default(),
            bitmap_high_water: DEFAULT_BITMAP_HIGH_WATER,
            view_margin: 1,
            request_throttle_ms: DEFAULT_REQUEST_THROTTLE_MS,
            prefetch_idle_ms: DEFAULT_PREFETCH_IDLE_MS,
            prefetch_interval_ms: DEFAULT_PREFETCH_INTERVAL_MS,
            adjacent_delay_ms: DEFAULT_ADJACENT_DELAY_MS,
            part_delay_ms: DEFAULT_PART_DELAY_MS,
            use_worker: true,
            debug_deltas: false,
            max_border_width_edit: DEFAULT_MAX_BORDER_WIDTH_EDIT,
            max_border_width_readonly: DEFAULT_MAX_BORDER_WIDTH_READONLY,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(format!("tile_size must be between 1 and {}", MAX_TILE_SIZE));
        }

        if self.gc.low_delta_bytes > self.gc.high_delta_bytes {
            return Err("GC low delta watermark must not exceed the high watermark".to_string());
        }
        if self.gc.low_tile_count > self.gc.high_tile_count {
            return Err("GC low tile watermark must not exceed the high watermark".to_string());
        }

        if self.bitmap_high_water == 0 {
            return Err("bitmap_high_water must be greater than 0".to_string());
        }

        if self.prefetch_interval_ms == 0 {
            return Err("prefetch_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn request_throttle(&self) -> Duration {
        Duration::from_millis(self.request_throttle_ms)
    }

    pub fn prefetch_idle(&self) -> Duration {
        Duration::from_millis(self.prefetch_idle_ms)
    }

    pub fn prefetch_interval(&self) -> Duration {
        Duration::from_millis(self.prefetch_interval_ms)
    }

    pub fn adjacent_delay(&self) -> Duration {
        Duration::from_millis(self.adjacent_delay_ms)
    }

    pub fn part_delay(&self) -> Duration {
        Duration::from_millis(self.part_delay_ms)
    }

    /// Border width limit for the given permission.
    pub fn max_border_width(&self, edit_permission: bool) -> u32 {
        if edit_permission {
            self.max_border_width_edit
        } else {
            self.max_border_width_readonly
        }
    }
}

// =============================================================================
// CLI
// =============================================================================

/// Tile delta cache - replay and inspect tile delta streams.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-delta-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    /// Resolve the subcommand, carrying global flags into it.
    pub fn into_command(self) -> Command {
        match self.command {
            Command::Replay(mut config) => {
                config.verbose |= self.verbose;
                Command::Replay(config)
            }
            Command::Inspect(mut config) => {
                config.verbose |= self.verbose;
                Command::Inspect(config)
            }
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Feed a recorded trace of tile messages through an engine and print stats.
    Replay(ReplayConfig),

    /// Decode a keyframe and its deltas into a PNG.
    Inspect(InspectConfig),
}

/// Engine options shared by the subcommands.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Tile size in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "TDC_TILE_SIZE")]
    pub tile_size: u32,

    /// Decode on the calling thread instead of the worker thread.
    #[arg(long, default_value_t = false, env = "TDC_NO_WORKER")]
    pub no_worker: bool,

    /// Raw delta memory high watermark in MiB.
    #[arg(long, default_value_t = DEFAULT_HIGH_DELTA_BYTES / MIB, env = "TDC_GC_HIGH_MIB")]
    pub gc_high_mib: usize,

    /// Raw delta memory low watermark in MiB.
    #[arg(long, default_value_t = DEFAULT_LOW_DELTA_BYTES / MIB, env = "TDC_GC_LOW_MIB")]
    pub gc_low_mib: usize,

    /// Tile count high watermark; the low watermark is 128 below it.
    #[arg(long, default_value_t = DEFAULT_HIGH_TILE_COUNT, env = "TDC_MAX_TILES")]
    pub max_tiles: usize,

    /// Trace individual delta op-codes.
    #[arg(long, default_value_t = false, env = "TDC_DEBUG_DELTAS")]
    pub debug_deltas: bool,
}

impl EngineArgs {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            tile_size: self.tile_size,
            gc: GcWatermarks {
                high_delta_bytes: self.gc_high_mib.saturating_mul(MIB),
                low_delta_bytes: self.gc_low_mib.saturating_mul(MIB),
                high_tile_count: self.max_tiles,
                low_tile_count: self.max_tiles.saturating_sub(128),
            },
            use_worker: !self.no_worker,
            debug_deltas: self.debug_deltas,
            ..EngineConfig::default()
        }
    }
}

/// Document kind as given on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocKindArg {
    #[default]
    Text,
    Spreadsheet,
    Presentation,
    Drawing,
}

impl From<DocKindArg> for DocKind {
    fn from(kind: DocKindArg) -> Self {
        match kind {
            DocKindArg::Text => DocKind::Text,
            DocKindArg::Spreadsheet => DocKind::Spreadsheet,
            DocKindArg::Presentation => DocKind::Presentation,
            DocKindArg::Drawing => DocKind::Drawing,
        }
    }
}

/// Options for `replay`.
#[derive(Args, Debug, Clone)]
pub struct ReplayConfig {
    /// Trace file: one frame per line, `<header>\t<hex payload>`; `#` starts a comment.
    pub trace: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Viewport width in pixels.
    #[arg(long, default_value_t = 1024)]
    pub view_width: i32,

    /// Viewport height in pixels.
    #[arg(long, default_value_t = 768)]
    pub view_height: i32,

    /// Document width in tiles.
    #[arg(long, default_value_t = 16)]
    pub doc_tiles_wide: i64,

    /// Document height in tiles.
    #[arg(long, default_value_t = 64)]
    pub doc_tiles_high: i64,

    /// Zoom level of the view.
    #[arg(long, default_value_t = 10)]
    pub zoom: i32,

    /// Kind of document being viewed.
    #[arg(long, value_enum, default_value_t = DocKindArg::Text)]
    pub doc_kind: DocKindArg,

    /// Pretty-print the JSON report.
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    #[arg(skip)]
    pub verbose: bool,
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.view_width <= 0 || self.view_height <= 0 {
            return Err("viewport must be non-empty".to_string());
        }
        if self.doc_tiles_wide <= 0 || self.doc_tiles_high <= 0 {
            return Err("document must be at least one tile".to_string());
        }
        self.engine.to_engine_config().validate()
    }
}

/// Options for `inspect`.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Chunk files in order; the first must be a keyframe.
    #[arg(required = true)]
    pub chunks: Vec<PathBuf>,

    /// Where to write the decoded tile.
    #[arg(short, long, default_value = "tile.png")]
    pub output: PathBuf,

    /// Tile size in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "TDC_TILE_SIZE")]
    pub tile_size: u32,

    /// Trace individual delta op-codes.
    #[arg(long, default_value_t = false, env = "TDC_DEBUG_DELTAS")]
    pub debug_deltas: bool,

    #[arg(skip)]
    pub verbose: bool,
}

impl InspectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(format!("tile_size must be between 1 and {}", MAX_TILE_SIZE));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
