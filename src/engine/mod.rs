//! Tile engine.
//!
//! [`TileEngine`] ties the cache together. It ingests tile frames from the
//! server, decides what to request for the current view, batches decoding in
//! transactions and tells the host what to repaint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              TileEngine                              │
//! │                                                                      │
//! │   on_message() ──▶ protocol ──▶ Tile::append_chunk ──┐               │
//! │                                                      ▼               │
//! │   update() ──▶ FetchPlanner ──▶ tilecombine    TransactionCoordinator│
//! │                    ▲                                 │ DecodeBatch   │
//! │   poll_timers() ── PrefetchScheduler                 ▼               │
//! │                                          DecompressionWorker / inline│
//! │                                                      │               │
//! │                    TileStore ◀── complete_batch() ◀──┘               │
//! │                        │                                             │
//! │                        └── garbage_collect()                         │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ send_message            │ request_redraw / mark_dirty
//!          ▼                         ▼
//!      Transport                 RenderSink            (the host)
//! ```
//!
//! Everything runs on the caller's thread except decoding, which goes to the
//! worker when one is running. Results come back through
//! [`TileEngine::poll_worker`] (or [`TileEngine::wait_for_worker`]), and the
//! host drives prefetching by calling [`TileEngine::poll_timers`].

mod planner;
mod prefetch;
mod transaction;
mod worker;

pub use planner::{wants_second_adjacent_pass, BorderPass, FetchPlanner, PaneBorder};
pub use prefetch::{PrefetchScheduler, PrefetchTask};
pub use transaction::{EndOutcome, TransactionCoordinator};
pub use worker::{
    decode_batch, DecodeBatch, DecodeRequest, DecodeResult, DecompressionWorker, WorkerReply,
    WORKER_THREAD_NAME,
};

use std::collections::HashSet;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::WorkerError;
use crate::geometry::{DocKind, PixelBounds, TileRange, TwipsRect, ViewState};
use crate::host::{TileHost, TilePreview};
use crate::protocol::{parse_frame, tile_processed, InboundMessage, Payload, TileHeader};
use crate::stats::{EngineCounters, TileStats};
use crate::tile::{scale_for_zoom, GcWatermarks, TileBitmap, TileCoordinate, TileStore};

/// Callback run once a transaction's tiles are installed.
pub type TransactionCallback<H> = Box<dyn FnOnce(&mut H)>;

// =============================================================================
// Tile Engine
// =============================================================================

/// Client-side tile cache driven by server messages and the view.
///
/// # Type Parameters
///
/// * `H` - The embedder: transport, render sink and document geometry
///
/// # Example
///
/// ```ignore
/// use tile_delta_cache::{EngineConfig, RecordingHost, TileEngine};
///
/// let host = RecordingHost::new(256, 8, 32);
/// let mut engine = TileEngine::new(host, EngineConfig::default());
///
/// engine.set_view(view);
/// engine.update();                 // sends tilecombine requests
/// engine.on_message(frame);        // tile: / delta: / invalidatetiles:
/// engine.poll_worker();            // installs decoded bitmaps
/// engine.flush_acknowledgements(); // tileprocessed wids=...
/// ```
pub struct TileEngine<H: TileHost> {
    host: H,
    config: EngineConfig,
    view: ViewState,
    store: TileStore,
    transactions: TransactionCoordinator<TransactionCallback<H>>,
    worker: Option<DecompressionWorker>,
    planner: FetchPlanner,
    prefetch: PrefetchScheduler,

    /// Expanded tile ranges of the last current-view pass
    current_ranges: Vec<TileRange>,

    /// Wire ids to acknowledge with `tileprocessed`
    queued_processed: Vec<u32>,

    /// Tiles whose keyframe we lost and must re-request
    fetch_keyframe_queue: Vec<TileCoordinate>,

    /// Current tiles requested but not yet painted
    empty_tiles: HashSet<TileCoordinate>,

    /// Drawing is paused until the visible tiles are rebuilt
    dehydrated_visible: bool,

    counters: EngineCounters,
}

impl<H: TileHost + 'static> TileEngine<H> {
    /// Create an engine, starting the decompression worker if configured.
    ///
    /// A worker that fails to start is logged and decoding happens inline.
    pub fn new(host: H, config: EngineConfig) -> Self {
        let worker = if config.use_worker {
            match DecompressionWorker::spawn() {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!(error = %e, "Decoding tiles inline");
                    None
                }
            }
        } else {
            None
        };

        let tile_size = config.tile_size as i32;
        Self {
            host,
            store: TileStore::new(config.bitmap_high_water),
            transactions: TransactionCoordinator::new(config.tile_size as usize, config.debug_deltas),
            worker,
            planner: FetchPlanner::new(tile_size, config.view_margin as i32),
            prefetch: PrefetchScheduler::new(
                config.prefetch_idle(),
                config.prefetch_interval(),
                config.adjacent_delay(),
                config.part_delay(),
            ),
            view: ViewState::default(),
            current_ranges: Vec::new(),
            queued_processed: Vec::new(),
            fetch_keyframe_queue: Vec::new(),
            empty_tiles: HashSet::new(),
            dehydrated_visible: false,
            counters: EngineCounters::default(),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// Replace the view. Call [`Self::update`] (or
    /// [`Self::update_on_change_part`]) afterwards to fetch for it.
    pub fn set_view(&mut self, view: ViewState) {
        self.view = view;
    }

    pub fn worker_mut(&mut self) -> Option<&mut DecompressionWorker> {
        self.worker.as_mut()
    }

    pub fn worker_enabled(&self) -> bool {
        self.worker.is_some()
    }

    pub fn queued_acknowledgements(&self) -> &[u32] {
        &self.queued_processed
    }

    pub fn fetch_keyframe_queue(&self) -> &[TileCoordinate] {
        &self.fetch_keyframe_queue
    }

    pub fn empty_tile_count(&self) -> usize {
        self.empty_tiles.len()
    }

    pub fn is_drawing_paused(&self) -> bool {
        self.dehydrated_visible
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    fn tile_size(&self) -> i32 {
        self.config.tile_size as i32
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    pub fn begin_transaction(&mut self) {
        self.transactions.begin();
    }

    pub fn end_transaction(&mut self) {
        self.finish_transaction(None);
    }

    /// End a transaction; `callback` runs once its tiles are installed.
    pub fn end_transaction_with(&mut self, callback: impl FnOnce(&mut H) + 'static) {
        self.finish_transaction(Some(Box::new(callback)));
    }

    fn finish_transaction(&mut self, callback: Option<TransactionCallback<H>>) {
        match self.transactions.end(callback) {
            EndOutcome::RunNow(callbacks) => self.run_callbacks(callbacks),
            EndOutcome::Deferred => {}
            EndOutcome::Dispatch(batch) => self.dispatch(batch),
        }
    }

    fn run_callbacks(&mut self, callbacks: Vec<TransactionCallback<H>>) {
        for callback in callbacks {
            callback(&mut self.host);
        }
    }

    /// Hand a batch to the worker, or decode it right here.
    fn dispatch(&mut self, mut batch: DecodeBatch) {
        self.refresh_batch(&mut batch);

        if let Some(worker) = self.worker.as_ref() {
            if !batch.requests.is_empty() {
                if let Err(e) = worker.submit(batch) {
                    self.disable_worker(&e.to_string());
                }
                return;
            }
        }

        let generation = batch.generation;
        let results = decode_batch(batch);
        self.complete_batch(generation, results);
    }

    /// Recompute each slice against the tile's state at dispatch time; the
    /// previous batch may have moved its decoded id on.
    fn refresh_batch(&mut self, batch: &mut DecodeBatch) {
        let store = &mut self.store;
        batch.requests.retain_mut(|req| {
            match store
                .get_mut(&req.coords)
                .and_then(|tile| tile.rehydration_request())
            {
                Some(slice) => {
                    req.slice = slice;
                    true
                }
                None => false,
            }
        });
    }

    /// Install a decoded batch.
    ///
    /// Results for evicted tiles, or superseded by newer chunks, are dropped.
    pub fn complete_batch(&mut self, generation: u64, results: Vec<DecodeResult>) {
        let Some(callbacks) = self.transactions.complete(generation) else {
            return;
        };

        let tile_size = self.config.tile_size;
        let mut ready = Vec::new();
        for result in results {
            let coords = result.coords;
            let Some(tile) = self.store.get_mut(&coords) else {
                continue;
            };
            if !tile.wants_result(result.last_id) {
                trace!(key = %coords, last_id = result.last_id, "Discarding stale decode");
                continue;
            }

            match result.pixels {
                Ok(pixels) => match tile.accept_decoded(result.last_id, pixels, tile_size) {
                    Some(bitmap) => {
                        let is_ready = tile.is_ready();
                        self.store.set_bitmap_on_tile(&coords, bitmap);
                        if is_ready {
                            ready.push(coords);
                        }
                    }
                    None => warn!(key = %coords, "Decoded tile has the wrong size"),
                },
                Err(e) => {
                    warn!(key = %coords, error = %e, "Failed to rebuild tile, re-fetching keyframe");
                    self.counters.decode_errors += 1;
                    self.drop_content_and_refetch(coords);
                }
            }
        }

        for coords in ready {
            self.tile_ready(coords);
        }

        self.run_callbacks(callbacks);
        self.garbage_collect();

        if self.dehydrated_visible && self.visible_tiles_ready() {
            debug!("Visible tiles rehydrated, resuming drawing");
            self.dehydrated_visible = false;
            self.host.resume_drawing();
            self.host.request_redraw();
        }

        if let Some(batch) = self.transactions.next_batch() {
            self.dispatch(batch);
        }
    }

    fn tile_ready(&mut self, coords: TileCoordinate) {
        if self.empty_tiles.remove(&coords) && self.empty_tiles.is_empty() {
            self.host.all_tiles_loaded();
        }
        let rect = self.coords_to_twips(&coords);
        if self.host.is_rectangle_visible(&rect) {
            self.host.mark_dirty(&coords);
        }
    }

    fn visible_tiles_ready(&self) -> bool {
        self.store
            .iter()
            .filter(|(_, t)| t.is_current() && t.has_keyframe())
            .all(|(_, t)| t.is_ready() && t.bitmap().is_some())
    }

    // -------------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------------

    /// Install every batch the worker has finished.
    pub fn poll_worker(&mut self) {
        loop {
            let Some(worker) = self.worker.as_mut() else {
                return;
            };
            match worker.try_recv() {
                Ok(None) => return,
                Ok(Some(reply)) => self.handle_reply(reply),
                Err(e) => self.disable_worker(&e.to_string()),
            }
        }
    }

    /// Wait until no batch is being decoded.
    pub async fn wait_for_worker(&mut self) {
        while self.transactions.in_flight_generation().is_some() {
            let Some(worker) = self.worker.as_mut() else {
                break;
            };
            match worker.recv().await {
                Ok(reply) => self.handle_reply(reply),
                Err(e) => self.disable_worker(&e.to_string()),
            }
        }
    }

    fn handle_reply(&mut self, reply: WorkerReply) {
        match reply {
            WorkerReply::Decoded {
                generation,
                results,
            } => self.complete_batch(generation, results),
            WorkerReply::Failed { generation, reason } => {
                let e = WorkerError::Failed { generation, reason };
                self.disable_worker(&e.to_string());
            }
        }
    }

    /// Tear the worker down for good and recover.
    ///
    /// Outstanding callbacks all run, then everything is re-requested since
    /// the lost batch left tiles in an unknown state.
    fn disable_worker(&mut self, reason: &str) {
        error!(reason, "Decompression worker failed, decoding inline from now on");
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
        self.counters.worker_failures += 1;

        let callbacks = self.transactions.abort_all();
        self.run_callbacks(callbacks);

        if self.dehydrated_visible {
            self.dehydrated_visible = false;
            self.host.resume_drawing();
        }
        self.redraw();
    }

    /// Drop every tile and fetch the view again.
    pub fn redraw(&mut self) {
        self.store.clear();
        self.empty_tiles.clear();
        self.planner.clear_move_requests();
        self.update();
        self.host.request_redraw();
    }

    // -------------------------------------------------------------------------
    // Inbound Messages
    // -------------------------------------------------------------------------

    /// Handle one raw frame from the server.
    pub fn on_message(&mut self, frame: Bytes) {
        self.counters.messages += 1;
        match parse_frame(&frame) {
            Ok(InboundMessage::Tile { header, payload }) => self.on_tile_msg(header, payload),
            Ok(InboundMessage::TileCombine(headers)) => {
                debug!(tiles = headers.len(), "Combined tile response announced");
            }
            Ok(InboundMessage::Invalidate(inv)) => {
                let hit = self.overlap_invalidated_rectangle_with_view(
                    inv.part,
                    inv.mode,
                    inv.wire_id,
                    &inv.rect,
                );
                if hit {
                    self.update();
                }
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed tile message");
                self.counters.protocol_errors += 1;
            }
        }
    }

    /// Ingest one tile or delta.
    pub fn on_tile_msg(&mut self, header: TileHeader, payload: Payload) {
        if let Some(id) = header.preview_id.clone() {
            self.host.tile_preview(TilePreview {
                id,
                width: header.width,
                height: header.height,
                part: header.part,
                mode: header.mode,
                image: payload.bytes().cloned().unwrap_or_default(),
            });
            self.queued_processed.push(header.wire_id);
            return;
        }

        let coords = header.coords(self.tile_size(), self.view.zoom);
        let distance = self.distance_for(&coords);
        self.begin_transaction();

        let created = !self.store.contains(&coords);
        let tile = self.store.get_or_create(coords);
        if created {
            tile.distance_from_view = distance;
        }
        tile.view_id = header.view_id;
        if header.wire_id != 0 && tile.invalid_from == header.wire_id {
            debug!(key = %coords, wire_id = header.wire_id, "Updated wire id matches invalidation");
        }
        tile.wire_id = header.wire_id;

        let mut rehydrate = false;
        match payload {
            Payload::None => {}
            Payload::Unchanged if tile.has_keyframe() => {
                tile.note_unchanged();
                self.counters.null_delta_updates += 1;
            }
            Payload::Unchanged | Payload::Delta(_) if !tile.has_keyframe() => {
                self.delta_without_keyframe(coords);
            }
            Payload::Unchanged => {}
            Payload::Png(bytes) | Payload::Keyframe(bytes) => match tile.append_chunk(bytes, true) {
                Ok(_) => rehydrate = tile.is_current(),
                Err(e) => warn!(key = %coords, error = %e, "Failed to record keyframe"),
            },
            Payload::Delta(bytes) => match tile.append_chunk(bytes, false) {
                Ok(_) => rehydrate = tile.is_current(),
                Err(_) => self.delta_without_keyframe(coords),
            },
        }

        if rehydrate {
            self.rehydrate_tile(coords);
        }
        self.queued_processed.push(header.wire_id);
        self.end_transaction();
    }

    /// The server sent a delta against a keyframe we no longer hold.
    fn delta_without_keyframe(&mut self, coords: TileCoordinate) {
        warn!(key = %coords, "Delta received for a tile without a keyframe");
        if let Some(tile) = self.store.get_mut(&coords) {
            tile.counters.gc_errors += 1;
        }
        self.drop_content_and_refetch(coords);
    }

    fn drop_content_and_refetch(&mut self, coords: TileCoordinate) {
        self.store.reclaim_tile_bitmap_memory(&coords);
        if let Some(tile) = self.store.get_mut(&coords) {
            tile.clear_raw_deltas();
            tile.force_keyframe();
        }
        if !self.fetch_keyframe_queue.contains(&coords) {
            self.fetch_keyframe_queue.push(coords);
        }
    }

    fn rehydrate_tile(&mut self, coords: TileCoordinate) {
        let Some(tile) = self.store.get_mut(&coords) else {
            return;
        };
        if !tile.needs_rehydration() {
            return;
        }
        if let Some(slice) = tile.rehydration_request() {
            self.transactions.enqueue(DecodeRequest { coords, slice });
        }
    }

    /// Send queued acknowledgements and re-request lost keyframes.
    pub fn flush_acknowledgements(&mut self) {
        if let Some(msg) = tile_processed(&self.queued_processed) {
            self.host.send_message(&msg);
            self.queued_processed.clear();
            self.counters.acknowledgements_sent += 1;
        }

        if !self.fetch_keyframe_queue.is_empty() {
            let queue = std::mem::take(&mut self.fetch_keyframe_queue);
            info!(tiles = queue.len(), "Re-fetching prematurely GCd keyframes");
            self.send_tile_combine_request(&queue);
        }
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Mark a tile stale from `wire_id`, or drop it if it holds nothing.
    pub fn invalidate_tile(&mut self, coords: &TileCoordinate, wire_id: u32) {
        let Some(tile) = self.store.get_mut(coords) else {
            return;
        };
        if tile.has_content() {
            tile.invalidate(wire_id);
        } else {
            tile.counters.invalidate_count += 1;
            self.store.remove_tile(coords);
        }
    }

    /// Invalidate every tile of `part`/`mode` overlapping `rect`.
    ///
    /// In spreadsheets, tiles rendered at another zoom are invalidated too.
    /// Returns true if any tile was hit.
    pub fn overlap_invalidated_rectangle_with_view(
        &mut self,
        part: i32,
        mode: i32,
        wire_id: u32,
        rect: &TwipsRect,
    ) -> bool {
        let calc = self.view.doc_kind == DocKind::Spreadsheet;
        let current_scale = scale_for_zoom(self.view.zoom);

        let hits: Vec<TileCoordinate> = self
            .store
            .keys()
            .into_iter()
            .filter(|c| c.part == part && c.mode == mode)
            .filter(|c| {
                self.coords_to_twips(c).intersects(rect) || (calc && c.scale() != current_scale)
            })
            .collect();

        trace!(tiles = hits.len(), wire_id, "Invalidated rectangle");
        for coords in &hits {
            self.invalidate_tile(coords, wire_id);
        }
        !hits.is_empty()
    }

    /// Document-space rectangle of a tile, scaled to the view's zoom.
    pub fn coords_to_twips(&self, coords: &TileCoordinate) -> TwipsRect {
        let (tw, th) = self.host.tile_twips_size();
        let factor = scale_for_zoom(self.view.zoom) / coords.scale();
        let (i, j) = coords.index(self.tile_size());
        let w = tw as f64 * factor;
        let h = th as f64 * factor;
        TwipsRect::new(
            (f64::from(i) * w).round() as i64,
            (f64::from(j) * h).round() as i64,
            w.round() as i64,
            h.round() as i64,
        )
    }

    // -------------------------------------------------------------------------
    // Fetching
    // -------------------------------------------------------------------------

    fn distance_for(&self, coords: &TileCoordinate) -> u64 {
        self.planner.distance(
            coords,
            self.view.zoom,
            self.view.part,
            self.view.mode,
            &self.current_ranges,
        )
    }

    /// Coordinates in and around `bounds` that have to be requested.
    ///
    /// For the current view this also refreshes every tile's distance,
    /// rehydrates tiles that can be rebuilt locally, and pauses drawing if a
    /// visible tile is not ready yet.
    pub fn get_missing_tiles(
        &mut self,
        bounds: &PixelBounds,
        zoom: i32,
        is_current: bool,
    ) -> Vec<TileCoordinate> {
        let (part, mode) = (self.view.part, self.view.mode);
        let ts = self.tile_size();
        let visible = self.planner.tile_ranges(&self.host, bounds);
        let expanded: Vec<TileRange> = visible
            .iter()
            .map(|r| self.planner.expanded_range(r, self.view.pan_direction))
            .collect();

        if is_current {
            let planner = &self.planner;
            self.store
                .update_distances(|c| planner.distance(c, zoom, part, mode, &expanded));
            self.current_ranges = expanded.clone();
            let store = &self.store;
            self.empty_tiles.retain(|c| {
                store
                    .get(c)
                    .is_some_and(|t| t.is_current() && t.bitmap().is_none())
            });
        }

        let mut queue = Vec::new();
        let mut dehydrated = false;
        self.begin_transaction();
        for range in &expanded {
            for (i, j) in range.iter() {
                let coords = TileCoordinate::from_index(i, j, ts, zoom, part, mode);
                if !self.planner.is_valid_tile(&self.host, &coords) {
                    continue;
                }
                match self.store.get(&coords) {
                    None => queue.push(coords),
                    Some(tile) if tile.needs_fetch() => queue.push(coords),
                    Some(_) if is_current => {
                        self.make_tile_current(coords);
                        let not_ready = self.store.get(&coords).is_some_and(|t| !t.is_ready());
                        if not_ready && visible.iter().any(|r| r.contains(i, j)) {
                            dehydrated = true;
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        if dehydrated && !self.dehydrated_visible {
            debug!("Visible tiles need rehydration, pausing drawing");
            self.dehydrated_visible = true;
            self.host.pause_drawing();
        }
        self.end_transaction();
        queue
    }

    fn make_tile_current(&mut self, coords: TileCoordinate) {
        if let Some(tile) = self.store.get_mut(&coords) {
            tile.distance_from_view = 0;
            tile.allow_fast_request();
        }
        self.rehydrate_tile(coords);
    }

    /// Create placeholders for `queue` and request them in packed rectangles.
    ///
    /// Tiles of another part/mode, or that no longer need fetching, are
    /// dropped; while scrolling, tiles already requested are not asked for
    /// again.
    pub fn add_tiles(&mut self, queue: Vec<TileCoordinate>, prefetch: bool) {
        let (part, mode) = (self.view.part, self.view.mode);
        let moving = self.view.move_in_progress;

        let mut to_fetch = Vec::new();
        for coords in queue {
            if coords.part != part || coords.mode != mode {
                continue;
            }
            if self.store.get(&coords).is_some_and(|t| !t.needs_fetch()) {
                continue;
            }
            if moving && !self.planner.note_move_request(coords) {
                continue;
            }
            to_fetch.push(coords);
        }
        if to_fetch.is_empty() {
            return;
        }

        if prefetch {
            self.begin_transaction();
        }
        let mut rehydrating = false;
        for coords in &to_fetch {
            let distance = self.distance_for(coords);
            let created = !self.store.contains(coords);
            let tile = self.store.get_or_create(*coords);
            if created {
                tile.distance_from_view = distance;
            }
            let current = tile.is_current();
            let empty = tile.bitmap().is_none();
            if current && empty {
                self.empty_tiles.insert(*coords);
            }
            if prefetch && current && tile.needs_rehydration() {
                rehydrating = true;
                self.rehydrate_tile(*coords);
            }
        }
        if prefetch {
            if rehydrating {
                self.end_transaction_with(|host: &mut H| host.request_redraw());
            } else {
                self.end_transaction();
            }
        }

        for rect in self.planner.pack_rectangles(to_fetch) {
            self.send_tile_combine_request(&rect);
        }

        if self.view.doc_kind.is_paginated() {
            self.init_prefetch_part_tiles();
        }
    }

    /// Send `tilecombine` requests for `coords`, skipping throttled tiles.
    pub fn send_tile_combine_request(&mut self, coords: &[TileCoordinate]) {
        let requests = self.planner.build_tile_combines(
            coords,
            &mut self.store,
            Instant::now(),
            self.config.request_throttle(),
            self.host.tile_twips_size(),
        );
        if requests.is_empty() {
            debug!(tiles = coords.len(), "Tile request skipped: nothing left after throttling");
            return;
        }
        for request in requests {
            trace!(tiles = request.len(), part = request.part, "Sending tilecombine");
            self.host.send_message(&request.to_string());
            self.counters.requests_sent += 1;
        }
    }

    /// Fetch what the current view is missing and schedule prefetching.
    pub fn update(&mut self) {
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            return;
        }
        if !self.view.move_in_progress {
            self.planner.clear_move_requests();
        }

        let queue = self.get_missing_tiles(&bounds, self.view.zoom, true);
        self.add_tiles(queue, false);

        if matches!(self.view.doc_kind, DocKind::Spreadsheet | DocKind::Text) {
            self.prefetch.schedule_adjacent(Instant::now());
        }
        let changed = self.planner.update_properties(&self.view);
        self.reset_pre_fetching(changed);
    }

    /// Fetch the newly selected part/mode in a single request.
    pub fn update_on_change_part(&mut self) {
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            return;
        }

        let queue = self.get_missing_tiles(&bounds, self.view.zoom, true);
        if !queue.is_empty() {
            for coords in &queue {
                let tile = self.store.get_or_create(*coords);
                tile.distance_from_view = 0;
                if tile.bitmap().is_none() {
                    self.empty_tiles.insert(*coords);
                }
            }
            self.send_tile_combine_request(&queue);
        }

        self.planner.update_properties(&self.view);
        self.reset_pre_fetching(true);
    }

    /// Count of tiles the current view still has to fetch.
    pub fn predict_tiles_to_slurp(&self) -> usize {
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            return 0;
        }
        let ts = self.tile_size();
        let mut missing = HashSet::new();
        for range in self.planner.tile_ranges(&self.host, &bounds) {
            for (i, j) in range.iter() {
                let coords = TileCoordinate::from_index(
                    i,
                    j,
                    ts,
                    self.view.zoom,
                    self.view.part,
                    self.view.mode,
                );
                if !self.planner.is_valid_tile(&self.host, &coords) {
                    continue;
                }
                if self.store.get(&coords).map_or(true, |t| t.needs_fetch()) {
                    missing.insert(coords);
                }
            }
        }
        missing.len()
    }

    /// Stored tiles of the current view overlapping `rect`, row-major.
    pub fn visible_coord_list(&self, rect: &TwipsRect) -> Vec<TileCoordinate> {
        let (zoom, part, mode) = (self.view.zoom, self.view.part, self.view.mode);
        let mut coords: Vec<TileCoordinate> = self
            .store
            .keys()
            .into_iter()
            .filter(|c| c.matches_view(zoom, part, mode))
            .filter(|c| self.coords_to_twips(c).intersects(rect))
            .collect();
        coords.sort_by_key(|c| (c.y, c.x));
        coords
    }

    /// Bitmap to paint for `coords`.
    ///
    /// Counts a miss when there is none, and starts rebuilding the tile if
    /// it has undecoded chunks.
    pub fn touch_for_paint(&mut self, coords: &TileCoordinate) -> Option<TileBitmap> {
        let tile = self.store.get_mut(coords)?;
        let bitmap = tile.bitmap().cloned();
        if bitmap.is_none() {
            tile.counters.missing_content += 1;
        }
        if tile.needs_rehydration() {
            self.begin_transaction();
            self.rehydrate_tile(*coords);
            self.end_transaction();
        }
        bitmap
    }

    /// Keep every tile's pixels but re-request all of them.
    pub fn refresh_tiles_in_background(&mut self) {
        for (_, tile) in self.store.iter_mut() {
            tile.wire_id = 0;
            tile.invalid_from = 0;
            tile.allow_fast_request();
        }
    }

    pub fn set_shrink_for_dehydration(&mut self, shrink: bool) {
        self.planner.set_shrink_for_dehydration(shrink);
    }

    // -------------------------------------------------------------------------
    // Prefetch
    // -------------------------------------------------------------------------

    /// Schedule the next part in the navigation direction.
    pub fn init_prefetch_part_tiles(&mut self) {
        let target = self.view.part + self.view.parts_direction;
        if target < 0 || target >= self.view.part_count || target == self.view.part {
            return;
        }
        self.prefetch
            .schedule_part(Instant::now(), target, self.view.mode);
    }

    /// Request the view's tiles for another part without creating them.
    pub fn prefetch_part(&mut self, part: i32, mode: i32) {
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            return;
        }
        let ts = self.tile_size();
        let mut queue = Vec::new();
        for range in self.planner.tile_ranges(&self.host, &bounds) {
            for (i, j) in range.iter() {
                let coords = TileCoordinate::from_index(i, j, ts, self.view.zoom, part, mode);
                if !self.planner.is_valid_tile(&self.host, &coords) {
                    continue;
                }
                if self.store.get(&coords).map_or(true, |t| t.needs_fetch()) {
                    queue.push(coords);
                }
            }
        }
        if !queue.is_empty() {
            debug!(part, tiles = queue.len(), "Prefetching part");
            self.send_tile_combine_request(&queue);
        }
    }

    /// Request the screen beyond the view in the pan direction.
    pub fn prefetch_adjacent(&mut self) {
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            return;
        }
        let pan = self.view.pan_direction;
        let zoom = self.view.zoom;

        let adjacent = self.planner.adjacent_bounds(&bounds, pan);
        let mut queue = self.get_missing_tiles(&adjacent, zoom, false);
        if wants_second_adjacent_pass(self.view.doc_kind, queue.is_empty()) {
            let further = self.planner.further_adjacent_bounds(&adjacent, pan);
            queue.extend(self.get_missing_tiles(&further, zoom, false));
        }
        self.add_tiles(queue, true);
    }

    /// One border prefetch pass.
    ///
    /// Skipped while visible tiles are still loading. Stops the border timer
    /// once nothing is left to fetch.
    pub fn pre_fetch_tiles(&mut self, force_border_calc: bool) {
        if !self.empty_tiles.is_empty() {
            trace!(empty = self.empty_tiles.len(), "Visible tiles loading, deferring prefetch");
            return;
        }
        let bounds = self.view.pixel_bounds;
        if bounds.is_empty() {
            self.clear_pre_fetch();
            return;
        }

        if self.planner.update_properties(&self.view) || force_border_calc {
            self.planner.clear_borders();
        }
        let visible = self.planner.tile_ranges(&self.host, &bounds);
        if !self.planner.has_borders() {
            let panes = self.host.pane_properties();
            self.planner.init_borders(&visible, &panes);
        }
        let Some(valid) = self.planner.valid_tile_range(&self.host) else {
            self.clear_pre_fetch();
            return;
        };

        let budget = self
            .planner
            .max_tiles_to_prefetch(&visible, !self.view.edit_permission);
        let max_width = self.config.max_border_width(self.view.edit_permission);
        let (zoom, part, mode) = (self.view.zoom, self.view.part, self.view.mode);
        let store = &self.store;
        let pass = self.planner.border_tiles(&valid, budget, max_width, zoom, part, mode, |c| {
            store.get(c).map_or(true, |t| t.needs_fetch())
        });

        if pass.tiles.is_empty() || pass.done {
            self.clear_pre_fetch();
        }
        if !pass.tiles.is_empty() {
            self.add_tiles(pass.tiles, true);
        }
    }

    /// Restart the border prefetch idle timer.
    pub fn reset_pre_fetching(&mut self, reset_border: bool) {
        if reset_border {
            self.planner.clear_borders();
        }
        self.prefetch.reset(Instant::now());
    }

    pub fn clear_pre_fetch(&mut self) {
        self.prefetch.clear();
        self.planner.clear_borders();
    }

    /// Run due prefetch work, install finished batches and flush
    /// acknowledgements.
    pub fn poll_timers(&mut self, now: Instant) {
        self.poll_worker();
        for task in self.prefetch.poll(now) {
            match task {
                PrefetchTask::Border => self.pre_fetch_tiles(false),
                PrefetchTask::Adjacent => self.prefetch_adjacent(),
                PrefetchTask::Part { part, mode } => self.prefetch_part(part, mode),
            }
        }
        self.flush_acknowledgements();
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.prefetch.next_deadline()
    }

    // -------------------------------------------------------------------------
    // Cache Management
    // -------------------------------------------------------------------------

    /// Bring the store under the configured watermarks.
    pub fn garbage_collect(&mut self) {
        let gc = self.config.gc;
        self.collect_with(&gc);
    }

    /// Re-rank tiles against the current view, then collect.
    pub fn prune_tiles(&mut self) {
        let (zoom, part, mode) = (self.view.zoom, self.view.part, self.view.mode);
        let planner = &self.planner;
        let ranges = &self.current_ranges;
        self.store
            .update_distances(|c| planner.distance(c, zoom, part, mode, ranges));
        self.garbage_collect();
    }

    /// Evict everything that is not current.
    pub fn discard_all_cache(&mut self) {
        info!(tiles = self.store.len(), "Discarding tile cache");
        self.collect_with(&GcWatermarks::discard_all());
    }

    fn collect_with(&mut self, watermarks: &GcWatermarks) {
        let report = self.store.garbage_collect(watermarks);
        self.counters.gc_runs += 1;
        self.counters.gc_reclaimed_tiles += report.reclaimed_tiles as u64;
        self.counters.gc_removed_tiles += report.removed_tiles as u64;
        if report.reclaimed_tiles > 0 || report.removed_tiles > 0 {
            debug!(
                reclaimed = report.reclaimed_tiles,
                freed_bytes = report.freed_bytes,
                removed = report.removed_tiles,
                "Garbage collected tiles"
            );
        }
    }

    /// Snapshot of the cache and counters.
    pub fn stats(&self) -> TileStats {
        let mut stats = TileStats {
            tiles: self.store.len(),
            bitmaps: self.store.bitmap_count(),
            current_tiles: self.store.iter().filter(|(_, t)| t.is_current()).count(),
            raw_delta_bytes: self.store.total_raw_bytes(),
            non_current_raw_delta_bytes: self.store.non_current_raw_bytes(),
            worker_enabled: self.worker.is_some(),
            counters: self.counters,
            ..TileStats::default()
        };
        for (_, tile) in self.store.iter() {
            stats.add_tile_counters(&tile.counters);
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================
