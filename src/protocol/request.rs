//! Outbound request builders.

use std::fmt;

/// A combined fetch for one rectangle of tiles in a single part/mode.
///
/// Renders as:
///
/// ```text
/// tilecombine nviewid=0 part=P [mode=M ]width=W height=H tileposx=x1,x2 tileposy=y1,y2 oldwid=w1,w2 tilewidth=TW tileheight=TH
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombineRequest {
    pub view_id: i32,
    pub part: i32,
    pub mode: i32,
    /// Tile size in pixels
    pub width: i32,
    pub height: i32,
    /// Tile positions in twips
    pub positions: Vec<(i64, i64)>,
    /// Wire id we hold for each tile (0 if none)
    pub old_wire_ids: Vec<u32>,
    /// Tile size in twips
    pub tile_width: i64,
    pub tile_height: i64,
}

impl TileCombineRequest {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }
}

fn join<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

impl fmt::Display for TileCombineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tilecombine nviewid={} part={} ", self.view_id, self.part)?;
        if self.mode != 0 {
            write!(f, "mode={} ", self.mode)?;
        }
        write!(
            f,
            "width={} height={} tileposx={} tileposy={} oldwid={} tilewidth={} tileheight={}",
            self.width,
            self.height,
            join(self.positions.iter().map(|p| p.0)),
            join(self.positions.iter().map(|p| p.1)),
            join(self.old_wire_ids.iter()),
            self.tile_width,
            self.tile_height,
        )
    }
}

/// Build the `tileprocessed` acknowledgement, or `None` if nothing is queued.
pub fn tile_processed(wire_ids: &[u32]) -> Option<String> {
    if wire_ids.is_empty() {
        return None;
    }
    Some(format!("tileprocessed wids={}", join(wire_ids.iter())))
}
