//! # Tile Delta Cache
//!
//! A client-side tile cache for documents rendered remotely and streamed as
//! compressed tiles.
//!
//! The server sends each tile once as a keyframe, then as small deltas
//! against the previous state of that tile. This library keeps the
//! compressed history per tile, rebuilds ("rehydrates") pixels on demand,
//! decides which tiles to request for the current view, and bounds memory by
//! dropping what is far from the view.
//!
//! ## Features
//!
//! - **Delta rehydration**: zstd keyframes plus a small row/span op-code language
//! - **Transactions**: decode work is batched and handed to a worker thread
//! - **Viewport-driven fetching**: `tilecombine` requests packed into rectangles
//! - **Prefetching**: border rings, the next screen, and the next part
//! - **Bounded memory**: raw delta and tile count watermarks, plus a bitmap budget
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Parsing inbound frames and formatting requests
//! - [`tile`] - Coordinates, delta logs, decoding, the tile store and GC
//! - [`engine`] - The [`TileEngine`], transactions, worker and prefetch
//! - [`host`] - Traits the embedder implements
//! - [`geometry`] - Pixel/twips/tile ranges and view state
//! - [`config`] - CLI and engine configuration
//! - [`stats`] - Counters and JSON-ready snapshots
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tile_delta_cache::{EngineConfig, PixelBounds, RecordingHost, TileEngine, ViewState};
//!
//! let host = RecordingHost::new(256, 16, 64);
//! let mut engine = TileEngine::new(host, EngineConfig::default());
//!
//! engine.set_view(ViewState {
//!     pixel_bounds: PixelBounds::from_origin_size(0, 0, 1024, 768),
//!     ..ViewState::default()
//! });
//! engine.update();
//!
//! // Feed frames as they arrive from the server...
//! engine.on_message(Bytes::from_static(b"invalidatetiles: EMPTY part=0"));
//! engine.poll_worker();
//! engine.flush_acknowledgements();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod host;
pub mod protocol;
pub mod stats;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, Command, EngineConfig, InspectConfig, ReplayConfig};
pub use engine::{
    DecodeBatch, DecodeRequest, DecodeResult, DecompressionWorker, FetchPlanner, PrefetchScheduler,
    PrefetchTask, TileEngine, TransactionCoordinator, WorkerReply,
};
pub use error::{DeltaError, ProtocolError, WorkerError};
pub use geometry::{
    DocKind, PaneFixed, PanDirection, PixelBounds, Point, TileRange, TwipsRect, ViewState,
};
pub use host::{DocumentGeometry, RecordingHost, RenderSink, TileHost, TilePreview, Transport};
pub use protocol::{
    parse_frame, tile_processed, InboundMessage, Invalidation, Payload, TileCombineRequest,
    TileHeader,
};
pub use stats::{EngineCounters, TileStats};
pub use tile::{
    compress_payload, DeltaDecoder, GcReport, GcWatermarks, RawDeltaLog, Tile, TileBitmap,
    TileCoordinate, TileStore,
};
