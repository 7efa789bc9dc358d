//! Collaborator traits implemented by the embedding application.
//!
//! The engine never opens a connection, paints a pixel or knows the
//! document's layout. It talks to the outside world through three small
//! traits, bundled as [`TileHost`]:
//!
//! - [`Transport`]: outbound protocol strings
//! - [`RenderSink`]: redraw and status signals
//! - [`DocumentGeometry`]: twips/pixel conversion, split panes, visibility
//!
//! [`RecordingHost`] is a headless implementation that records everything it
//! is told; the `replay` command and the tests drive the engine with it.

use bytes::Bytes;
use serde::Serialize;

use crate::geometry::{PaneFixed, PixelBounds, TwipsRect};
use crate::tile::TileCoordinate;

// =============================================================================
// Traits
// =============================================================================

/// Sends protocol strings to the server.
pub trait Transport {
    fn send_message(&mut self, text: &str);
}

/// A slide-sorter thumbnail that bypassed the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePreview {
    pub id: String,
    pub width: i32,
    pub height: i32,
    pub part: i32,
    pub mode: i32,
    pub image: Bytes,
}

/// Receives paint-related signals.
pub trait RenderSink {
    /// Schedule a repaint of the view.
    fn request_redraw(&mut self);

    /// A visible tile got new content.
    fn mark_dirty(&mut self, _coords: &TileCoordinate) {}

    /// Stop painting until [`RenderSink::resume_drawing`]; visible tiles are
    /// still being rebuilt.
    fn pause_drawing(&mut self) {}

    fn resume_drawing(&mut self) {}

    /// Every requested tile has arrived.
    fn all_tiles_loaded(&mut self) {}

    fn tile_preview(&mut self, _preview: TilePreview) {}
}

/// Document layout queries.
pub trait DocumentGeometry {
    /// Size of one tile in twips.
    fn tile_twips_size(&self) -> (i64, i64);

    /// Size of the whole document in twips.
    fn document_twips_size(&self) -> (i64, i64);

    /// Twips per pixel at the current zoom.
    fn pixels_to_twips(&self) -> f64;

    /// Split the viewport into one bounds per pane.
    fn split_pixel_bounds(&self, bounds: &PixelBounds) -> Vec<PixelBounds> {
        vec![*bounds]
    }

    /// Frozen axes of each pane, in the same order as `split_pixel_bounds`.
    fn pane_properties(&self) -> Vec<PaneFixed> {
        vec![PaneFixed::default()]
    }

    fn is_rectangle_visible(&self, rect: &TwipsRect) -> bool;
}

/// Everything the engine needs from its embedder.
pub trait TileHost: Transport + RenderSink + DocumentGeometry {}

impl<T: Transport + RenderSink + DocumentGeometry> TileHost for T {}

// =============================================================================
// Recording Host
// =============================================================================

/// Counts of render signals received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderEvents {
    pub redraws: u64,
    pub dirty: u64,
    pub pauses: u64,
    pub resumes: u64,
    pub all_tiles_loaded: u64,
    pub previews: u64,
}

/// Headless host with fixed geometry that records outbound traffic.
#[derive(Debug, Clone)]
pub struct RecordingHost {
    pub sent: Vec<String>,
    pub events: RenderEvents,
    pub paused: bool,
    pub previews: Vec<TilePreview>,
    pub tile_twips: (i64, i64),
    pub document_twips: (i64, i64),
    pub twips_per_pixel: f64,
    /// Visible area in twips; `None` treats everything as visible
    pub visible: Option<TwipsRect>,
}

impl RecordingHost {
    /// Twips per pixel at zoom 10 (1440 twips per inch, 96 dpi).
    pub const TWIPS_PER_PIXEL: f64 = 15.0;

    /// A host whose document is `tiles_wide` x `tiles_high` tiles of
    /// `tile_size` pixels.
    pub fn new(tile_size: i32, tiles_wide: i64, tiles_high: i64) -> Self {
        let tile_twips = (tile_size as f64 * Self::TWIPS_PER_PIXEL) as i64;
        Self {
            sent: Vec::new(),
            events: RenderEvents::default(),
            paused: false,
            previews: Vec::new(),
            tile_twips: (tile_twips, tile_twips),
            document_twips: (tile_twips * tiles_wide, tile_twips * tiles_high),
            twips_per_pixel: Self::TWIPS_PER_PIXEL,
            visible: None,
        }
    }

    /// Drain the recorded outbound messages.
    pub fn take_sent(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sent)
    }

    /// Recorded messages starting with `prefix`.
    pub fn sent_with_prefix(&self, prefix: &str) -> Vec<&str> {
        self.sent
            .iter()
            .filter(|m| m.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }
}

impl Transport for RecordingHost {
    fn send_message(&mut self, text: &str) {
        self.sent.push(text.to_string());
    }
}

impl RenderSink for RecordingHost {
    fn request_redraw(&mut self) {
        self.events.redraws += 1;
    }

    fn mark_dirty(&mut self, _coords: &TileCoordinate) {
        self.events.dirty += 1;
    }

    fn pause_drawing(&mut self) {
        self.events.pauses += 1;
        self.paused = true;
    }

    fn resume_drawing(&mut self) {
        self.events.resumes += 1;
        self.paused = false;
    }

    fn all_tiles_loaded(&mut self) {
        self.events.all_tiles_loaded += 1;
    }

    fn tile_preview(&mut self, preview: TilePreview) {
        self.events.previews += 1;
        self.previews.push(preview);
    }
}

impl DocumentGeometry for RecordingHost {
    fn tile_twips_size(&self) -> (i64, i64) {
        self.tile_twips
    }

    fn document_twips_size(&self) -> (i64, i64) {
        self.document_twips
    }

    fn pixels_to_twips(&self) -> f64 {
        self.twips_per_pixel
    }

    fn is_rectangle_visible(&self, rect: &TwipsRect) -> bool {
        self.visible.map_or(true, |v| v.intersects(rect))
    }
}
