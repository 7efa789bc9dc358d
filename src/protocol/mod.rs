//! Wire protocol for tile-bearing messages.
//!
//! Inbound frames are parsed into [`InboundMessage`]s; outbound requests are
//! built as [`TileCombineRequest`]s and `tileprocessed` acknowledgements.
//! Nothing here touches the connection itself: frames come in as bytes and
//! requests go out as strings through the host's transport.

mod message;
mod request;

pub use message::{
    parse_frame, InboundMessage, Invalidation, Payload, TileHeader, TileMessageKind,
    DELTA_MARKER, KEYFRAME_MARKER,
};
pub use request::{tile_processed, TileCombineRequest};
