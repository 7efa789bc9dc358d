//! Inbound frame parsing.
//!
//! A frame is an ASCII header line, optionally followed by `\n` and raw
//! bytes. The header is a command (`tile:`, `delta:`, `tilecombine:`,
//! `invalidatetiles:`) followed by space-separated `key=value` fields.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::geometry::TwipsRect;
use crate::tile::{TileCoordinate, PNG_MAGIC};

/// Keyframe wire marker.
pub const KEYFRAME_MARKER: u8 = b'Z';

/// Delta wire marker; on its own it means "unchanged".
pub const DELTA_MARKER: u8 = b'D';

// =============================================================================
// Message Kinds
// =============================================================================

/// Which tile-bearing command a header carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMessageKind {
    Tile,
    Delta,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// A single tile, with its attached bytes if any
    Tile {
        header: TileHeader,
        payload: Payload,
    },
    /// Combined tile header; the tiles themselves arrive one by one
    TileCombine(Vec<TileHeader>),
    /// Server-side invalidation of a document area
    Invalidate(Invalidation),
}

// =============================================================================
// Payload
// =============================================================================

/// Attached tile bytes, classified by their first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No bytes attached
    None,
    /// PNG keyframe (first byte `0x89`)
    Png(Bytes),
    /// zstd keyframe, marker stripped
    Keyframe(Bytes),
    /// zstd delta, marker stripped
    Delta(Bytes),
    /// Empty delta: the tile did not change
    Unchanged,
}

impl Payload {
    /// Classify raw attached bytes.
    ///
    /// Unmarked bytes are a keyframe on `tile:` and a delta on `delta:`.
    pub fn classify(bytes: Bytes, kind: TileMessageKind) -> Self {
        match bytes.first() {
            None => Payload::None,
            Some(&PNG_MAGIC) => Payload::Png(bytes),
            Some(&KEYFRAME_MARKER) => Payload::Keyframe(bytes.slice(1..)),
            Some(&DELTA_MARKER) if bytes.len() == 1 => Payload::Unchanged,
            Some(&DELTA_MARKER) => Payload::Delta(bytes.slice(1..)),
            Some(_) => match kind {
                TileMessageKind::Tile => Payload::Keyframe(bytes),
                TileMessageKind::Delta => Payload::Delta(bytes),
            },
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, Payload::Png(_) | Payload::Keyframe(_))
    }

    /// Compressed bytes to retain, if any.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Png(b) | Payload::Keyframe(b) | Payload::Delta(b) => Some(b),
            Payload::None | Payload::Unchanged => None,
        }
    }
}

// =============================================================================
// Tile Header
// =============================================================================

/// Fields of a `tile:` / `delta:` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileHeader {
    pub kind: TileMessageKind,
    pub view_id: i32,
    pub part: i32,
    pub mode: i32,
    /// Tile size in pixels
    pub width: i32,
    pub height: i32,
    /// Tile position in twips
    pub tile_pos_x: i64,
    pub tile_pos_y: i64,
    /// Tile size in twips
    pub tile_width: i64,
    pub tile_height: i64,
    pub wire_id: u32,
    pub old_wire_id: u32,
    pub zoom: Option<i32>,
    /// Present on preview tiles only
    pub preview_id: Option<String>,
}

impl TileHeader {
    /// Tile coordinates at the given pixel tile size.
    ///
    /// Zoom comes from the header when present, otherwise `view_zoom`.
    pub fn coords(&self, tile_size: i32, view_zoom: i32) -> TileCoordinate {
        let grid = |pos: i64, size: i64| -> i32 {
            if size <= 0 {
                return 0;
            }
            (pos as f64 / size as f64).round() as i32
        };
        TileCoordinate::new(
            grid(self.tile_pos_x, self.tile_width) * tile_size,
            grid(self.tile_pos_y, self.tile_height) * tile_size,
            self.zoom.unwrap_or(view_zoom),
            self.part,
            self.mode,
        )
    }

    pub fn is_preview(&self) -> bool {
        self.preview_id.is_some()
    }

    fn from_fields(kind: TileMessageKind, fields: &Fields<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            view_id: fields.int_or("nviewid", 0)?,
            part: fields.int("part")?,
            mode: fields.int_or("mode", 0)?,
            width: fields.int_or("width", 0)?,
            height: fields.int_or("height", 0)?,
            tile_pos_x: fields.int("tileposx")?,
            tile_pos_y: fields.int("tileposy")?,
            tile_width: fields.int("tilewidth")?,
            tile_height: fields.int("tileheight")?,
            wire_id: fields.int_or("wid", 0)?,
            old_wire_id: fields.int_or("oldwid", 0)?,
            zoom: fields.opt_int("zoom")?,
            preview_id: fields.get("id").map(str::to_string),
        })
    }
}

/// Split a `tilecombine:` header into one header per tile.
fn parse_combine(fields: &Fields<'_>) -> Result<Vec<TileHeader>, ProtocolError> {
    let xs: Vec<i64> = fields.list("tileposx")?;
    let ys: Vec<i64> = fields.list("tileposy")?;
    if xs.len() != ys.len() {
        return Err(ProtocolError::InvalidField {
            field: "tileposy",
            value: format!("{} positions for {} columns", ys.len(), xs.len()),
        });
    }
    let wids: Vec<u32> = match fields.get("wid") {
        Some(_) => fields.list("wid")?,
        None => vec![0; xs.len()],
    };

    let template = TileHeader {
        kind: TileMessageKind::Tile,
        view_id: fields.int_or("nviewid", 0)?,
        part: fields.int("part")?,
        mode: fields.int_or("mode", 0)?,
        width: fields.int_or("width", 0)?,
        height: fields.int_or("height", 0)?,
        tile_pos_x: 0,
        tile_pos_y: 0,
        tile_width: fields.int("tilewidth")?,
        tile_height: fields.int("tileheight")?,
        wire_id: 0,
        old_wire_id: 0,
        zoom: fields.opt_int("zoom")?,
        preview_id: None,
    };

    Ok(xs
        .into_iter()
        .zip(ys)
        .enumerate()
        .map(|(n, (x, y))| TileHeader {
            tile_pos_x: x,
            tile_pos_y: y,
            wire_id: wids.get(n).copied().unwrap_or(0),
            ..template.clone()
        })
        .collect())
}

// =============================================================================
// Invalidation
// =============================================================================

/// An `invalidatetiles:` notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub part: i32,
    pub mode: i32,
    pub rect: TwipsRect,
    pub wire_id: u32,
}

impl Invalidation {
    /// Extent used for `EMPTY` (whole part) invalidations.
    const WHOLE_PART: i64 = i64::MAX / 4;

    fn from_fields(fields: &Fields<'_>) -> Result<Self, ProtocolError> {
        let rect = if fields.has_word("EMPTY") {
            TwipsRect::new(0, 0, Self::WHOLE_PART, Self::WHOLE_PART)
        } else {
            TwipsRect::new(
                fields.int("x")?,
                fields.int("y")?,
                fields.int("width")?,
                fields.int("height")?,
            )
        };
        Ok(Self {
            part: fields.int_or("part", 0)?,
            mode: fields.int_or("mode", 0)?,
            rect,
            wire_id: fields.int_or("wid", 0)?,
        })
    }
}

// =============================================================================
// Frame Parsing
// =============================================================================

/// Parse a raw inbound frame.
///
/// # Errors
///
/// Returns an error for an empty frame, a non-tile command, or a header
/// with missing or malformed fields.
pub fn parse_frame(frame: &Bytes) -> Result<InboundMessage, ProtocolError> {
    let (text, payload) = match frame.iter().position(|&b| b == b'\n') {
        Some(pos) => (&frame[..pos], frame.slice(pos + 1..)),
        None => (&frame[..], Bytes::new()),
    };
    let text = std::str::from_utf8(text).map_err(|_| ProtocolError::InvalidField {
        field: "header",
        value: String::from_utf8_lossy(text).into_owned(),
    })?;
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }

    let (command, rest) = text.split_once(' ').unwrap_or((text, ""));
    let fields = Fields::parse(rest);

    match command {
        "tile:" => {
            let header = TileHeader::from_fields(TileMessageKind::Tile, &fields)?;
            let payload = Payload::classify(payload, TileMessageKind::Tile);
            Ok(InboundMessage::Tile { header, payload })
        }
        "delta:" => {
            let header = TileHeader::from_fields(TileMessageKind::Delta, &fields)?;
            let payload = Payload::classify(payload, TileMessageKind::Delta);
            Ok(InboundMessage::Tile { header, payload })
        }
        "tilecombine:" => Ok(InboundMessage::TileCombine(parse_combine(&fields)?)),
        "invalidatetiles:" => Ok(InboundMessage::Invalidate(Invalidation::from_fields(
            &fields,
        )?)),
        other => Err(ProtocolError::UnknownMessage(other.to_string())),
    }
}

/// `key=value` fields of a header, plus bare words.
struct Fields<'a> {
    values: HashMap<&'a str, &'a str>,
    words: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn parse(text: &'a str) -> Self {
        let mut values = HashMap::new();
        let mut words = Vec::new();
        for token in text.split_whitespace() {
            let token = token.trim_end_matches(',');
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((k, v)) => {
                    values.insert(k, v);
                }
                None => words.push(token),
            }
        }
        Self { values, words }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.values.get(key).copied()
    }

    fn has_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| *w == word)
    }

    fn opt_int<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ProtocolError> {
        self.get(key)
            .map(|v| {
                v.parse().map_err(|_| ProtocolError::InvalidField {
                    field: key,
                    value: v.to_string(),
                })
            })
            .transpose()
    }

    fn int<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, ProtocolError> {
        self.opt_int(key)?.ok_or(ProtocolError::MissingField(key))
    }

    fn int_or<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ProtocolError> {
        Ok(self.opt_int(key)?.unwrap_or(default))
    }

    fn list<T: std::str::FromStr>(&self, key: &'static str) -> Result<Vec<T>, ProtocolError> {
        let value = self.get(key).ok_or(ProtocolError::MissingField(key))?;
        value
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse().map_err(|_| ProtocolError::InvalidField {
                    field: key,
                    value: value.to_string(),
                })
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
