//! Tile store with distance-ordered bitmap accounting.
//!
//! The store owns every [`Tile`] and keeps a list of the tiles that currently
//! hold a realized bitmap, ordered by distance from the view. The list tail is
//! the first candidate for eviction when too many bitmaps are alive.
//!
//! # Garbage Collection
//!
//! Two passes, both farthest-first and both skipping current tiles:
//!
//! 1. **Memory**: while the compressed bytes held by non-current tiles exceed
//!    the high watermark, strip tiles of their bitmap and raw log (forcing a
//!    keyframe on next fetch) until at or below the low watermark.
//! 2. **Count**: while the store holds more tiles than the high watermark,
//!    remove non-current tiles outright until at or below the low watermark.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::coords::TileCoordinate;
use super::entry::{Tile, TileBitmap};

/// Default high watermark for compressed bytes held by non-current tiles: 120 MiB
pub const DEFAULT_HIGH_DELTA_BYTES: usize = 120 * 1024 * 1024;

/// Default low watermark for compressed bytes: 100 MiB
pub const DEFAULT_LOW_DELTA_BYTES: usize = 100 * 1024 * 1024;

/// Default high watermark for the number of stored tiles
pub const DEFAULT_HIGH_TILE_COUNT: usize = 2048;

/// Default low watermark for the number of stored tiles
pub const DEFAULT_LOW_TILE_COUNT: usize = DEFAULT_HIGH_TILE_COUNT - 128;

/// Default maximum number of realized bitmaps
pub const DEFAULT_BITMAP_HIGH_WATER: usize = 250;

// =============================================================================
// Watermarks
// =============================================================================

/// Garbage collection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcWatermarks {
    pub high_delta_bytes: usize,
    pub low_delta_bytes: usize,
    pub high_tile_count: usize,
    pub low_tile_count: usize,
}

impl Default for GcWatermarks {
    fn default() -> Self {
        Self {
            high_delta_bytes: DEFAULT_HIGH_DELTA_BYTES,
            low_delta_bytes: DEFAULT_LOW_DELTA_BYTES,
            high_tile_count: DEFAULT_HIGH_TILE_COUNT,
            low_tile_count: DEFAULT_LOW_TILE_COUNT,
        }
    }
}

impl GcWatermarks {
    /// All-zero watermarks: evict everything that is not current.
    pub const fn discard_all() -> Self {
        Self {
            high_delta_bytes: 0,
            low_delta_bytes: 0,
            high_tile_count: 0,
            low_tile_count: 0,
        }
    }
}

/// What one garbage collection run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Tiles stripped of their raw log and bitmap
    pub reclaimed_tiles: usize,
    /// Compressed bytes released by the memory pass
    pub freed_bytes: usize,
    /// Tiles removed from the store by the count pass
    pub removed_tiles: usize,
}

// =============================================================================
// Tile Store
// =============================================================================

/// Keyed collection of all tiles.
///
/// Every tile holding a bitmap appears exactly once in the bitmap list;
/// tiles without one do not appear. Current tiles lead the list.
#[derive(Debug)]
pub struct TileStore {
    tiles: HashMap<TileCoordinate, Tile>,
    bitmap_list: Vec<TileCoordinate>,
    bitmap_high_water: usize,
}

impl Default for TileStore {
    fn default() -> Self {
        Self::new(DEFAULT_BITMAP_HIGH_WATER)
    }
}

impl TileStore {
    /// Create an empty store that keeps at most `bitmap_high_water` bitmaps.
    pub fn new(bitmap_high_water: usize) -> Self {
        Self {
            tiles: HashMap::new(),
            bitmap_list: Vec::new(),
            bitmap_high_water: bitmap_high_water.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, coords: &TileCoordinate) -> bool {
        self.tiles.contains_key(coords)
    }

    pub fn get(&self, coords: &TileCoordinate) -> Option<&Tile> {
        self.tiles.get(coords)
    }

    pub fn get_mut(&mut self, coords: &TileCoordinate) -> Option<&mut Tile> {
        self.tiles.get_mut(coords)
    }

    /// Look up a tile, creating an empty one on first reference.
    pub fn get_or_create(&mut self, coords: TileCoordinate) -> &mut Tile {
        self.tiles.entry(coords).or_insert_with(|| {
            trace!(key = %coords, "Creating tile");
            Tile::new(coords)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileCoordinate, &Tile)> {
        self.tiles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TileCoordinate, &mut Tile)> {
        self.tiles.iter_mut()
    }

    pub fn keys(&self) -> Vec<TileCoordinate> {
        self.tiles.keys().copied().collect()
    }

    /// Tiles holding a bitmap, nearest first.
    pub fn bitmap_list(&self) -> &[TileCoordinate] {
        &self.bitmap_list
    }

    pub fn bitmap_count(&self) -> usize {
        self.bitmap_list.len()
    }

    /// Compressed bytes held by all tiles.
    pub fn total_raw_bytes(&self) -> usize {
        self.tiles.values().map(|t| t.raw_deltas().byte_len()).sum()
    }

    /// Compressed bytes held by tiles that are not current.
    pub fn non_current_raw_bytes(&self) -> usize {
        self.tiles
            .values()
            .filter(|t| !t.is_current())
            .map(|t| t.raw_deltas().byte_len())
            .sum()
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    /// Remove a tile from the store.
    ///
    /// A current tile that still has content is kept; it can only be marked
    /// stale.
    pub fn remove_tile(&mut self, coords: &TileCoordinate) -> Option<Tile> {
        if let Some(tile) = self.tiles.get(coords) {
            if tile.is_current() && tile.has_content() {
                debug!(key = %coords, "Refusing to remove current tile");
                return None;
            }
        }
        self.unlist(coords);
        self.tiles.remove(coords)
    }

    /// Remove every tile, current ones included.
    pub fn clear(&mut self) {
        self.tiles.clear();
        self.bitmap_list.clear();
    }

    // -------------------------------------------------------------------------
    // Bitmap Management
    // -------------------------------------------------------------------------

    /// Install a freshly decoded bitmap.
    ///
    /// An existing bitmap is swapped in place. Otherwise, if the bitmap limit
    /// is reached, the farthest non-current bitmap is reclaimed first and the
    /// tile is inserted by distance. Returns `false` if the tile is gone.
    pub fn set_bitmap_on_tile(&mut self, coords: &TileCoordinate, bitmap: TileBitmap) -> bool {
        let Some(tile) = self.tiles.get_mut(coords) else {
            return false;
        };

        if tile.bitmap().is_some() {
            tile.replace_bitmap(bitmap);
            return true;
        }
        let distance = tile.distance_from_view;

        if self.bitmap_list.len() >= self.bitmap_high_water {
            if let Some(tail) = self.bitmap_list.last().copied() {
                let tail_current = self.tiles.get(&tail).is_some_and(|t| t.is_current());
                if !tail_current {
                    trace!(key = %tail, "Bitmap limit reached, reclaiming farthest");
                    self.reclaim_tile_bitmap_memory(&tail);
                }
            }
        }

        if let Some(tile) = self.tiles.get_mut(coords) {
            tile.replace_bitmap(bitmap);
        }

        let at = if distance == 0 {
            0
        } else {
            let tiles = &self.tiles;
            self.bitmap_list.partition_point(|c| {
                tiles.get(c).map_or(0, |t| t.distance_from_view) <= distance
            })
        };
        self.bitmap_list.insert(at, *coords);
        true
    }

    /// Release a tile's bitmap and decoded pixels; its raw log is kept.
    pub fn reclaim_tile_bitmap_memory(&mut self, coords: &TileCoordinate) {
        if let Some(tile) = self.tiles.get_mut(coords) {
            tile.release_decoded();
        }
        self.unlist(coords);
    }

    /// Re-sort the bitmap list after distances changed.
    pub fn resort_bitmap_list(&mut self) {
        let tiles = &self.tiles;
        self.bitmap_list
            .sort_by_key(|c| tiles.get(c).map_or(u64::MAX, |t| t.distance_from_view));
    }

    /// Recompute every tile's distance and re-sort the bitmap list.
    pub fn update_distances(&mut self, mut distance: impl FnMut(&TileCoordinate) -> u64) {
        for (coords, tile) in self.tiles.iter_mut() {
            tile.distance_from_view = distance(coords);
        }
        self.resort_bitmap_list();
    }

    fn unlist(&mut self, coords: &TileCoordinate) {
        if let Some(pos) = self.bitmap_list.iter().position(|c| c == coords) {
            self.bitmap_list.remove(pos);
        }
    }

    // -------------------------------------------------------------------------
    // Garbage Collection
    // -------------------------------------------------------------------------

    /// Bring memory and tile count under the given watermarks.
    pub fn garbage_collect(&mut self, watermarks: &GcWatermarks) -> GcReport {
        let mut report = GcReport::default();

        // Farthest first; ties broken by key so runs are deterministic.
        let mut candidates: Vec<(u64, TileCoordinate)> = self
            .tiles
            .iter()
            .filter(|(_, t)| !t.is_current())
            .map(|(c, t)| (t.distance_from_view, *c))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut bytes = self.non_current_raw_bytes();
        if bytes > watermarks.high_delta_bytes {
            debug!(
                bytes,
                high = watermarks.high_delta_bytes,
                low = watermarks.low_delta_bytes,
                "Raw delta memory over watermark"
            );
            for (_, coords) in &candidates {
                if bytes <= watermarks.low_delta_bytes {
                    break;
                }
                let has_deltas = self
                    .tiles
                    .get(coords)
                    .is_some_and(|t| t.has_keyframe());
                if !has_deltas {
                    continue;
                }

                self.reclaim_tile_bitmap_memory(coords);
                if let Some(tile) = self.tiles.get_mut(coords) {
                    let freed = tile.clear_raw_deltas();
                    tile.force_keyframe();
                    bytes = bytes.saturating_sub(freed);
                    report.freed_bytes += freed;
                    report.reclaimed_tiles += 1;
                }
            }
        }

        if self.tiles.len() > watermarks.high_tile_count {
            debug!(
                count = self.tiles.len(),
                high = watermarks.high_tile_count,
                low = watermarks.low_tile_count,
                "Tile count over watermark"
            );
            for (_, coords) in &candidates {
                if self.tiles.len() <= watermarks.low_tile_count {
                    break;
                }
                self.unlist(coords);
                if self.tiles.remove(coords).is_some() {
                    report.removed_tiles += 1;
                }
            }
        }

        if report != GcReport::default() {
            debug!(
                reclaimed = report.reclaimed_tiles,
                freed = report.freed_bytes,
                removed = report.removed_tiles,
                "Garbage collection finished"
            );
        }
        report
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use image::RgbaImage;
    use std::sync::Arc;

    fn coords(x: i32) -> TileCoordinate {
        TileCoordinate::new(x * 256, 0, 10, 0, 0)
    }

    fn bitmap() -> TileBitmap {
        Arc::new(RgbaImage::new(1, 1))
    }

    fn add(store: &mut TileStore, x: i32, distance: u64, bytes: usize) -> TileCoordinate {
        let c = coords(x);
        let tile = store.get_or_create(c);
        tile.distance_from_view = distance;
        if bytes > 0 {
            tile.append_chunk(Bytes::from(vec![0u8; bytes]), true).unwrap();
        }
        c
    }

    #[test]
    fn test_bitmap_list_ordering() {
        let mut store = TileStore::new(10);
        let far = add(&mut store, 0, 5, 1);
        let near = add(&mut store, 1, 2, 1);
        let current = add(&mut store, 2, 0, 1);

        store.set_bitmap_on_tile(&far, bitmap());
        store.set_bitmap_on_tile(&near, bitmap());
        store.set_bitmap_on_tile(&current, bitmap());

        assert_eq!(store.bitmap_list(), &[current, near, far]);
    }

    #[test]
    fn test_bitmap_swap_in_place() {
        let mut store = TileStore::new(10);
        let c = add(&mut store, 0, 3, 1);
        store.set_bitmap_on_tile(&c, bitmap());
        store.set_bitmap_on_tile(&c, bitmap());
        assert_eq!(store.bitmap_count(), 1);
    }

    #[test]
    fn test_bitmap_high_water_reclaims_tail() {
        let mut store = TileStore::new(2);
        let a = add(&mut store, 0, 1, 1);
        let b = add(&mut store, 1, 9, 1);
        let c = add(&mut store, 2, 4, 1);

        store.set_bitmap_on_tile(&a, bitmap());
        store.set_bitmap_on_tile(&b, bitmap());
        store.set_bitmap_on_tile(&c, bitmap());

        assert_eq!(store.bitmap_list(), &[a, c]);
        let evicted = store.get(&b).unwrap();
        assert!(evicted.bitmap().is_none());
        assert!(evicted.has_keyframe());
        assert_eq!(evicted.decompressed_id(), 0);
    }

    #[test]
    fn test_set_bitmap_on_missing_tile() {
        let mut store = TileStore::default();
        assert!(!store.set_bitmap_on_tile(&coords(7), bitmap()));
        assert_eq!(store.bitmap_count(), 0);
    }

    #[test]
    fn test_remove_tile_spares_current() {
        let mut store = TileStore::default();
        let current = add(&mut store, 0, 0, 10);
        let other = add(&mut store, 1, 3, 10);

        assert!(store.remove_tile(&current).is_none());
        assert!(store.contains(&current));
        assert!(store.remove_tile(&other).is_some());
    }

    #[test]
    fn test_memory_gc_farthest_first() {
        let mut store = TileStore::default();
        add(&mut store, 0, 0, 500);
        let near = add(&mut store, 1, 1, 100);
        let mid = add(&mut store, 2, 2, 100);
        let far = add(&mut store, 3, 3, 100);

        let watermarks = GcWatermarks {
            high_delta_bytes: 250,
            low_delta_bytes: 150,
            high_tile_count: 100,
            low_tile_count: 90,
        };
        let report = store.garbage_collect(&watermarks);

        assert_eq!(report.reclaimed_tiles, 2);
        assert_eq!(report.freed_bytes, 200);
        assert!(!store.get(&far).unwrap().has_keyframe());
        assert!(!store.get(&mid).unwrap().has_keyframe());
        assert!(store.get(&near).unwrap().has_keyframe());
        assert_eq!(store.non_current_raw_bytes(), 100);
    }

    #[test]
    fn test_count_gc_removes_non_current() {
        let mut store = TileStore::default();
        let current = add(&mut store, 0, 0, 0);
        for x in 1..6 {
            add(&mut store, x, x as u64, 0);
        }

        let watermarks = GcWatermarks {
            high_delta_bytes: usize::MAX,
            low_delta_bytes: usize::MAX,
            high_tile_count: 4,
            low_tile_count: 3,
        };
        let report = store.garbage_collect(&watermarks);

        assert_eq!(report.removed_tiles, 3);
        assert_eq!(store.len(), 3);
        assert!(store.contains(&current));
        assert!(store.contains(&coords(1)));
        assert!(store.contains(&coords(2)));
    }

    #[test]
    fn test_discard_all_keeps_current() {
        let mut store = TileStore::default();
        let current = add(&mut store, 0, 0, 10);
        add(&mut store, 1, 1, 10);
        store.set_bitmap_on_tile(&current, bitmap());

        store.garbage_collect(&GcWatermarks::discard_all());

        assert_eq!(store.len(), 1);
        let tile = store.get(&current).unwrap();
        assert!(tile.bitmap().is_some());
        assert!(tile.has_keyframe());
    }
}
