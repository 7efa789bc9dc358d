//! Tile identity.
//!
//! A [`TileCoordinate`] names one tile of one rendering of the document:
//! its top-left corner in device pixels at `zoom`, the document part
//! (sheet/slide/page) and the edit mode. It is the key of the tile store and
//! never changes for the lifetime of a tile; a zoom, part or mode switch
//! produces different coordinates, not a mutated tile.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Zoom level at which one pixel corresponds to the document's base scale.
pub const BASE_ZOOM: i32 = 10;

/// Identifies a tile by `(x, y, zoom, part, mode)`.
///
/// `x` and `y` are pixel positions (multiples of the tile size).
/// The string form is the colon-joined `x:y:zoom:part:mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub x: i32,
    pub y: i32,
    pub zoom: i32,
    pub part: i32,
    pub mode: i32,
}

impl TileCoordinate {
    pub const fn new(x: i32, y: i32, zoom: i32, part: i32, mode: i32) -> Self {
        Self {
            x,
            y,
            zoom,
            part,
            mode,
        }
    }

    /// Coordinates of the tile at grid index `(i, j)`.
    pub const fn from_index(i: i32, j: i32, tile_size: i32, zoom: i32, part: i32, mode: i32) -> Self {
        Self::new(i * tile_size, j * tile_size, zoom, part, mode)
    }

    /// Grid index of this tile.
    pub fn index(&self, tile_size: i32) -> (i32, i32) {
        (self.x.div_euclid(tile_size), self.y.div_euclid(tile_size))
    }

    /// Render scale relative to [`BASE_ZOOM`]: `1.2^(zoom - 10)`, rounded to 3 decimals.
    pub fn scale(&self) -> f64 {
        scale_for_zoom(self.zoom)
    }

    /// True when this tile belongs to the given zoom/part/mode rendering.
    pub fn matches_view(&self, zoom: i32, part: i32, mode: i32) -> bool {
        self.zoom == zoom && self.part == part && self.mode == mode
    }
}

/// `1.2^(zoom - 10)` rounded to 3 decimals.
pub fn scale_for_zoom(zoom: i32) -> f64 {
    (1.2f64.powi(zoom - BASE_ZOOM) * 1000.0).round() / 1000.0
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.x, self.y, self.zoom, self.part, self.mode
        )
    }
}

impl FromStr for TileCoordinate {
    type Err = ProtocolError;

    /// Parse the `x:y:zoom:part[:mode]` key form; `mode` defaults to 0.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = key.split(':').collect();
        if fields.len() < 4 || fields.len() > 5 {
            return Err(ProtocolError::InvalidField {
                field: "key",
                value: key.to_string(),
            });
        }

        let parse = |s: &str| -> Result<i32, ProtocolError> {
            s.parse().map_err(|_| ProtocolError::InvalidField {
                field: "key",
                value: key.to_string(),
            })
        };

        let mode = match fields.get(4) {
            Some(m) => parse(m)?,
            None => 0,
        };

        Ok(Self::new(
            parse(fields[0])?,
            parse(fields[1])?,
            parse(fields[2])?,
            parse(fields[3])?,
            mode,
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
