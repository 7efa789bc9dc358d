//! Fetch planning.
//!
//! Turns a pixel viewport into tile coordinates, decides which of them have
//! to be requested, and groups requests into as few `tilecombine` messages as
//! possible. Also owns the state of the border prefetcher: one growing ring
//! of tiles per split pane.
//!
//! The planner never touches the network or the renderer; it only computes.
//! [`TileEngine`](super::TileEngine) drives it and sends what it returns.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::geometry::{DocKind, PaneFixed, PanDirection, PixelBounds, Point, TileRange, ViewState};
use crate::host::DocumentGeometry;
use crate::protocol::TileCombineRequest;
use crate::tile::{TileCoordinate, TileStore, IRRELEVANT_DISTANCE};

// =============================================================================
// Border State
// =============================================================================

/// Prefetch border of one split pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneBorder {
    /// Ring to fetch next, in tile indices; may extend past the document
    pub bounds: TileRange,
    pub x_fixed: bool,
    pub y_fixed: bool,
    /// Rings fetched so far
    pub index: u32,
}

/// Result of one border prefetch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BorderPass {
    pub tiles: Vec<TileCoordinate>,
    /// Every pane's border reached its maximum width or the document edges
    pub done: bool,
    /// Budget ran out with tiles still to fetch
    pub pending: bool,
}

/// View properties the border state was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrefetchProperties {
    zoom: i32,
    part: i32,
    mode: i32,
    pixel_bounds: PixelBounds,
}

// =============================================================================
// Fetch Planner
// =============================================================================

/// Range math, request packing and border prefetch state.
#[derive(Debug)]
pub struct FetchPlanner {
    tile_size: i32,
    view_margin: i32,
    shrink_for_dehydration: bool,
    move_tile_requests: HashSet<TileCoordinate>,
    borders: Option<Vec<PaneBorder>>,
    properties: Option<PrefetchProperties>,
}

impl FetchPlanner {
    pub fn new(tile_size: i32, view_margin: i32) -> Self {
        Self {
            tile_size: tile_size.max(1),
            view_margin: view_margin.max(0),
            shrink_for_dehydration: false,
            move_tile_requests: HashSet::new(),
            borders: None,
            properties: None,
        }
    }

    pub fn tile_size(&self) -> i32 {
        self.tile_size
    }

    /// While set, the current range is not expanded by the margin so fewer
    /// tiles compete for rehydration.
    pub fn set_shrink_for_dehydration(&mut self, shrink: bool) {
        self.shrink_for_dehydration = shrink;
    }

    pub fn shrink_for_dehydration(&self) -> bool {
        self.shrink_for_dehydration
    }

    // -------------------------------------------------------------------------
    // Range Math
    // -------------------------------------------------------------------------

    /// One tile range per split pane.
    pub fn tile_ranges<G: DocumentGeometry + ?Sized>(
        &self,
        geometry: &G,
        bounds: &PixelBounds,
    ) -> Vec<TileRange> {
        geometry
            .split_pixel_bounds(bounds)
            .iter()
            .map(|b| b.to_tile_range(self.tile_size))
            .collect()
    }

    /// Grow a visible range by the margin, twice as much in the pan direction.
    pub fn expanded_range(&self, range: &TileRange, pan: PanDirection) -> TileRange {
        if self.shrink_for_dehydration {
            return *range;
        }
        let m = self.view_margin;
        let bias = |active: bool| if active { 2 * m } else { m };
        range.expand(bias(pan.dx < 0), bias(pan.dy < 0), bias(pan.dx > 0), bias(pan.dy > 0))
    }

    /// Distance in tiles from `coords` to the nearest range.
    ///
    /// Tiles of another zoom/part/mode are [`IRRELEVANT_DISTANCE`] away.
    pub fn distance(
        &self,
        coords: &TileCoordinate,
        zoom: i32,
        part: i32,
        mode: i32,
        ranges: &[TileRange],
    ) -> u64 {
        if !coords.matches_view(zoom, part, mode) {
            return IRRELEVANT_DISTANCE;
        }
        let (i, j) = coords.index(self.tile_size);
        ranges
            .iter()
            .map(|r| r.distance_to(i, j))
            .min()
            .unwrap_or(IRRELEVANT_DISTANCE)
    }

    /// True if the tile's top-left corner lies inside the document.
    pub fn is_valid_tile<G: DocumentGeometry + ?Sized>(
        &self,
        geometry: &G,
        coords: &TileCoordinate,
    ) -> bool {
        if coords.x < 0 || coords.y < 0 {
            return false;
        }
        let p2t = geometry.pixels_to_twips();
        let (doc_w, doc_h) = geometry.document_twips_size();
        coords.x as f64 * p2t <= doc_w as f64 && coords.y as f64 * p2t <= doc_h as f64
    }

    /// Last valid tile index on each axis, or `None` for an empty document.
    pub fn valid_tile_range<G: DocumentGeometry + ?Sized>(&self, geometry: &G) -> Option<TileRange> {
        let p2t = geometry.pixels_to_twips();
        if p2t <= 0.0 {
            return None;
        }
        let (doc_w, doc_h) = geometry.document_twips_size();
        let px_w = (doc_w as f64 / p2t).floor() as i64;
        let px_h = (doc_h as f64 / p2t).floor() as i64;
        if px_w <= 0 || px_h <= 0 {
            return None;
        }
        let ts = i64::from(self.tile_size);
        Some(TileRange::new(
            Point::new(0, 0),
            Point::new(((px_w - 1) / ts) as i32, ((px_h - 1) / ts) as i32),
        ))
    }

    // -------------------------------------------------------------------------
    // Request Packing
    // -------------------------------------------------------------------------

    /// Group coordinates into maximal rectangles, row-major.
    ///
    /// Each rectangle is grown right while its first row is unbroken, then
    /// down while the next row covers the same span. Every input tile ends up
    /// in exactly one rectangle; duplicates are collapsed.
    pub fn pack_rectangles(&self, coords: Vec<TileCoordinate>) -> Vec<Vec<TileCoordinate>> {
        let ts = self.tile_size;
        let mut buckets: BTreeMap<(i32, i32, i32), BTreeSet<(i32, i32)>> = BTreeMap::new();
        for c in coords {
            let (i, j) = c.index(ts);
            buckets.entry((c.zoom, c.part, c.mode)).or_default().insert((j, i));
        }

        let mut rects = Vec::new();
        for ((zoom, part, mode), mut cells) in buckets {
            while let Some(&(j0, i0)) = cells.iter().next() {
                let mut width = 1;
                while cells.contains(&(j0, i0 + width)) {
                    width += 1;
                }
                let mut height = 1;
                while (i0..i0 + width).all(|i| cells.contains(&(j0 + height, i))) {
                    height += 1;
                }

                let mut rect = Vec::with_capacity((width * height) as usize);
                for j in j0..j0 + height {
                    for i in i0..i0 + width {
                        cells.remove(&(j, i));
                        rect.push(TileCoordinate::from_index(i, j, ts, zoom, part, mode));
                    }
                }
                rects.push(rect);
            }
        }
        rects
    }

    /// Build one `tilecombine` per part/mode bucket.
    ///
    /// Tiles requested less than `throttle` ago are left out; the rest are
    /// stamped with `now`.
    pub fn build_tile_combines(
        &self,
        coords: &[TileCoordinate],
        store: &mut TileStore,
        now: Instant,
        throttle: Duration,
        tile_twips: (i64, i64),
    ) -> Vec<TileCombineRequest> {
        let ts = self.tile_size;
        let mut order: Vec<(i32, i32)> = Vec::new();
        let mut buckets: HashMap<(i32, i32), TileCombineRequest> = HashMap::new();
        let mut seen: HashSet<TileCoordinate> = HashSet::new();

        for c in coords {
            if !seen.insert(*c) {
                continue;
            }
            let old_wire_id = match store.get_mut(c) {
                Some(tile) if tile.request_throttled(now, throttle) => {
                    trace!(key = %c, "Requesting too fast, skipped");
                    continue;
                }
                Some(tile) => {
                    tile.mark_requested(now);
                    tile.wire_id
                }
                None => 0,
            };

            let bucket = buckets.entry((c.part, c.mode)).or_insert_with(|| {
                order.push((c.part, c.mode));
                TileCombineRequest {
                    view_id: 0,
                    part: c.part,
                    mode: c.mode,
                    width: ts,
                    height: ts,
                    positions: Vec::new(),
                    old_wire_ids: Vec::new(),
                    tile_width: tile_twips.0,
                    tile_height: tile_twips.1,
                }
            });
            let (i, j) = c.index(ts);
            bucket
                .positions
                .push((i64::from(i) * tile_twips.0, i64::from(j) * tile_twips.1));
            bucket.old_wire_ids.push(old_wire_id);
        }

        order
            .into_iter()
            .filter_map(|key| buckets.remove(&key))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Scroll Dedupe
    // -------------------------------------------------------------------------

    /// Record a request made while scrolling; false if already requested.
    pub fn note_move_request(&mut self, coords: TileCoordinate) -> bool {
        self.move_tile_requests.insert(coords)
    }

    pub fn clear_move_requests(&mut self) {
        self.move_tile_requests.clear();
    }

    // -------------------------------------------------------------------------
    // Adjacent Prefetch
    // -------------------------------------------------------------------------

    /// Viewport shifted one screen in the pan direction, snapped vertically
    /// to the tile grid with a pixel of slack.
    ///
    /// With no recorded pan the area stays on the view itself.
    pub fn adjacent_bounds(&self, bounds: &PixelBounds, pan: PanDirection) -> PixelBounds {
        let ts = self.tile_size;
        let mut b = *bounds;
        b.min.y = b.min.y.div_euclid(ts) * ts - 1;
        b.max.y = (b.max.y + ts - 1).div_euclid(ts) * ts + 1;
        b.translate(b.width() * pan.dx, b.height() * pan.dy);
        b
    }

    /// Half a screen further than [`Self::adjacent_bounds`].
    pub fn further_adjacent_bounds(&self, adjacent: &PixelBounds, pan: PanDirection) -> PixelBounds {
        let mut b = *adjacent;
        b.translate(b.width() / 2 * pan.dx, b.height() / 2 * pan.dy);
        b
    }

    // -------------------------------------------------------------------------
    // Border Prefetch
    // -------------------------------------------------------------------------

    /// Tiles one border pass may request: a quarter of the visible tiles,
    /// four times as many for read-only viewers.
    pub fn max_tiles_to_prefetch(&self, visible: &[TileRange], read_only: bool) -> usize {
        let count: i64 = visible
            .iter()
            .map(|r| {
                i64::from(r.max.x - r.min.x + 1).max(0) * i64::from(r.max.y - r.min.y + 1).max(0)
            })
            .sum();
        let base = (count as usize).div_ceil(4);
        if read_only {
            base * 4
        } else {
            base
        }
    }

    /// Record the view the borders belong to; true if it changed.
    pub fn update_properties(&mut self, view: &ViewState) -> bool {
        let props = PrefetchProperties {
            zoom: view.zoom,
            part: view.part,
            mode: view.mode,
            pixel_bounds: view.pixel_bounds,
        };
        let changed = self.properties != Some(props);
        self.properties = Some(props);
        changed
    }

    pub fn has_borders(&self) -> bool {
        self.borders.is_some()
    }

    pub fn clear_borders(&mut self) {
        self.borders = None;
    }

    /// Start one border per pane, one ring outside the visible range.
    pub fn init_borders(&mut self, visible: &[TileRange], panes: &[PaneFixed]) {
        if self.borders.is_some() {
            return;
        }
        let borders = visible
            .iter()
            .enumerate()
            .map(|(n, range)| {
                let fixed = panes.get(n).copied().unwrap_or_default();
                PaneBorder {
                    bounds: grow_ring(range, fixed),
                    x_fixed: fixed.x_fixed,
                    y_fixed: fixed.y_fixed,
                    index: 0,
                }
            })
            .collect();
        self.borders = Some(borders);
    }

    /// Walk the borders outwards, collecting tiles that `needs_fetch` until
    /// `budget` is spent.
    #[allow(clippy::too_many_arguments)]
    pub fn border_tiles(
        &mut self,
        valid: &TileRange,
        budget: usize,
        max_width: u32,
        zoom: i32,
        part: i32,
        mode: i32,
        mut needs_fetch: impl FnMut(&TileCoordinate) -> bool,
    ) -> BorderPass {
        let ts = self.tile_size;
        let Some(borders) = self.borders.as_mut() else {
            return BorderPass {
                done: true,
                ..BorderPass::default()
            };
        };

        let mut pass = BorderPass::default();
        let mut visited: HashSet<(i32, i32)> = HashSet::new();
        let mut remaining = budget;

        for border in borders.iter_mut() {
            while border.index < max_width {
                let clamped = valid.clamp(&border.bounds);
                let mut ring_pending = false;

                for (i, j) in ring_cells(border, &clamped) {
                    if !visited.insert((i, j)) {
                        continue;
                    }
                    let coords = TileCoordinate::from_index(i, j, ts, zoom, part, mode);
                    if !needs_fetch(&coords) {
                        continue;
                    }
                    if remaining == 0 {
                        ring_pending = true;
                        continue;
                    }
                    remaining -= 1;
                    pass.tiles.push(coords);
                }

                if ring_pending {
                    pass.pending = true;
                    break;
                }
                if clamped == *valid {
                    border.index = max_width;
                    break;
                }
                border.bounds = grow_ring(
                    &border.bounds,
                    PaneFixed {
                        x_fixed: border.x_fixed,
                        y_fixed: border.y_fixed,
                    },
                );
                border.index += 1;
            }
        }

        pass.done = borders.iter().all(|b| b.index >= max_width);
        debug!(
            tiles = pass.tiles.len(),
            done = pass.done,
            pending = pass.pending,
            "Border prefetch pass"
        );
        pass
    }
}

fn grow_ring(range: &TileRange, fixed: PaneFixed) -> TileRange {
    let dx = if fixed.x_fixed { 0 } else { 1 };
    let dy = if fixed.y_fixed { 0 } else { 1 };
    range.expand(dx, dy, dx, dy)
}

/// Cells on the edges of `border` that still lie inside the document.
fn ring_cells(border: &PaneBorder, clamped: &TileRange) -> Vec<(i32, i32)> {
    let b = &border.bounds;
    let mut cells = Vec::new();
    if !border.y_fixed {
        if b.min.y == clamped.min.y {
            cells.extend((clamped.min.x..=clamped.max.x).map(|i| (i, b.min.y)));
        }
        if b.max.y == clamped.max.y {
            cells.extend((clamped.min.x..=clamped.max.x).map(|i| (i, b.max.y)));
        }
    }
    if !border.x_fixed {
        if b.min.x == clamped.min.x {
            cells.extend((clamped.min.y..=clamped.max.y).map(|j| (b.min.x, j)));
        }
        if b.max.x == clamped.max.x {
            cells.extend((clamped.min.y..=clamped.max.y).map(|j| (b.max.x, j)));
        }
    }
    cells
}

/// Adjacent prefetch does a second, further pass for spreadsheets, and for
/// other documents only when the first pass found nothing.
pub fn wants_second_adjacent_pass(kind: DocKind, first_pass_empty: bool) -> bool {
    kind == DocKind::Spreadsheet || first_pass_empty
}

// =============================================================================
// Tests
// =============================================================================
