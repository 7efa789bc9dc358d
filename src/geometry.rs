//! Plain geometry value types shared by the fetch planner and the host.
//!
//! Pixel coordinates are device pixels at the current zoom; tile ranges are
//! inclusive tile-grid indices; twips rectangles are document space.

use serde::{Deserialize, Serialize};

// =============================================================================
// Points and Bounds
// =============================================================================

/// Integer 2D point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned pixel rectangle, `min` and `max` both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelBounds {
    pub min: Point,
    pub max: Point,
}

impl PixelBounds {
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Bounds of a `width` x `height` viewport whose top-left corner is `(x, y)`.
    pub fn from_origin_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            min: Point::new(x, y),
            max: Point::new(x + width, y + height),
        }
    }

    pub fn width(&self) -> i32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> i32 {
        self.max.y - self.min.y
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Shift the bounds by `(dx, dy)` pixels.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        self.min.x += dx;
        self.min.y += dy;
        self.max.x += dx;
        self.max.y += dy;
    }

    /// Convert to the inclusive range of tiles that the bounds touch.
    pub fn to_tile_range(&self, tile_size: i32) -> TileRange {
        TileRange {
            min: Point::new(
                self.min.x.div_euclid(tile_size),
                self.min.y.div_euclid(tile_size),
            ),
            max: Point::new(
                self.max.x.div_euclid(tile_size),
                self.max.y.div_euclid(tile_size),
            ),
        }
    }
}

// =============================================================================
// Tile Range
// =============================================================================

/// Inclusive rectangle of tile-grid indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TileRange {
    pub min: Point,
    pub max: Point,
}

impl TileRange {
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, i: i32, j: i32) -> bool {
        i >= self.min.x && i <= self.max.x && j >= self.min.y && j <= self.max.y
    }

    /// Grow each side independently (negative values shrink).
    pub fn expand(&self, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            min: Point::new(self.min.x - left, self.min.y - top),
            max: Point::new(self.max.x + right, self.max.y + bottom),
        }
    }

    /// Clamp `other` to lie within `self`.
    pub fn clamp(&self, other: &TileRange) -> TileRange {
        TileRange {
            min: Point::new(
                other.min.x.clamp(self.min.x, self.max.x),
                other.min.y.clamp(self.min.y, self.max.y),
            ),
            max: Point::new(
                other.max.x.clamp(self.min.x, self.max.x),
                other.max.y.clamp(self.min.y, self.max.y),
            ),
        }
    }

    /// Chebyshev distance in tiles from `(i, j)` to this range; 0 when inside.
    pub fn distance_to(&self, i: i32, j: i32) -> u64 {
        let dx = (self.min.x - i).max(i - self.max.x).max(0);
        let dy = (self.min.y - j).max(j - self.max.y).max(0);
        dx.max(dy) as u64
    }

    /// Iterate `(i, j)` row by row.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.min.y..=self.max.y).flat_map(move |j| (self.min.x..=self.max.x).map(move |i| (i, j)))
    }
}

// =============================================================================
// Twips Rectangle
// =============================================================================

/// Document-space rectangle in twips (`x`, `y`, `width`, `height`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwipsRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl TwipsRect {
    pub const fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Open-interval overlap test; rectangles that only share an edge do not intersect.
    pub fn intersects(&self, other: &TwipsRect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

// =============================================================================
// View State
// =============================================================================

/// Last pan direction, each component in `-1..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PanDirection {
    pub dx: i32,
    pub dy: i32,
}

impl PanDirection {
    pub fn new(dx: i32, dy: i32) -> Self {
        Self {
            dx: dx.signum(),
            dy: dy.signum(),
        }
    }
}

/// Which kind of document is being viewed; drives prefetch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    #[default]
    Text,
    Spreadsheet,
    Presentation,
    Drawing,
}

impl DocKind {
    /// Paginated documents get next-part prefetch.
    pub fn is_paginated(&self) -> bool {
        matches!(self, DocKind::Presentation | DocKind::Drawing)
    }
}

/// Whether a split pane is frozen along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaneFixed {
    pub x_fixed: bool,
    pub y_fixed: bool,
}

/// Everything the engine needs to know about the current view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub zoom: i32,
    pub part: i32,
    pub mode: i32,
    /// Viewport in pixels at `zoom`
    pub pixel_bounds: PixelBounds,
    pub doc_kind: DocKind,
    /// Editors prefetch less aggressively than read-only viewers
    pub edit_permission: bool,
    pub part_count: i32,
    /// Direction of part navigation (`-1`, `0` or `1`)
    pub parts_direction: i32,
    pub pan_direction: PanDirection,
    /// True while the user is actively scrolling
    pub move_in_progress: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            zoom: 10,
            part: 0,
            mode: 0,
            pixel_bounds: PixelBounds::default(),
            doc_kind: DocKind::Text,
            edit_permission: true,
            part_count: 1,
            parts_direction: 1,
            pan_direction: PanDirection::default(),
            move_in_progress: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
