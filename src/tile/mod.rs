//! Tile cache layer.
//!
//! This module holds the cached state of the document's rendering: one
//! [`Tile`] per coordinate, each carrying the compressed chunks it was built
//! from and, when decoded, the pixels to paint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               TileStore                 │
//! │  HashMap<TileCoordinate, Tile>          │
//! │  bitmap list (nearest → farthest)       │
//! └────────────────────┬────────────────────┘
//!                      │ owns
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │                 Tile                    │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ RawDeltaLog  │  │ decoded pixels  │  │
//! │  │ (keyframe +  │  │ + bitmap        │  │
//! │  │  deltas)     │  │                 │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ decoded by
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             DeltaDecoder                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileCoordinate`]: `(x, y, zoom, part, mode)` identity
//! - [`RawDeltaLog`]: compressed keyframe + deltas for one tile
//! - [`DeltaDecoder`]: zstd/PNG decode and op-code replay
//! - [`Tile`]: one cache entry and its rehydration state
//! - [`TileStore`]: all tiles, bitmap budget and garbage collection

mod coords;
mod delta;
mod entry;
mod store;

pub use coords::{scale_for_zoom, TileCoordinate, BASE_ZOOM};
pub use delta::{
    compress_payload, DeltaDecoder, RawDeltaChunk, RawDeltaLog, OP_COPY_ROW, OP_NEW_SPAN,
    OP_TERMINATE, PNG_MAGIC,
};
pub use entry::{RehydrationSlice, Tile, TileBitmap, TileCounters, IRRELEVANT_DISTANCE};
pub use store::{
    GcReport, GcWatermarks, TileStore, DEFAULT_BITMAP_HIGH_WATER, DEFAULT_HIGH_DELTA_BYTES,
    DEFAULT_HIGH_TILE_COUNT, DEFAULT_LOW_DELTA_BYTES, DEFAULT_LOW_TILE_COUNT,
};
