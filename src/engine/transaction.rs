//! Transaction batching.
//!
//! Tile updates are grouped so the view is repainted once per logical
//! update instead of once per tile. Transactions nest; decode work queued
//! inside them is dispatched only when the outermost one ends.
//!
//! At most one batch is in flight. Callbacks attached to a transaction run
//! after *that* transaction's batch has been installed, never earlier. A
//! transaction that ends while another batch is still decoding waits for it,
//! so two batches are never decoded against the same stale cached image.

use tracing::{error, warn};

use super::worker::{DecodeBatch, DecodeRequest};

/// What the caller must do after [`TransactionCoordinator::end`].
#[derive(Debug)]
pub enum EndOutcome<C> {
    /// Nothing to decode; run these callbacks now.
    RunNow(Vec<C>),
    /// Still nested, or waiting behind the batch in flight.
    Deferred,
    /// Decode this batch, then call [`TransactionCoordinator::complete`].
    Dispatch(DecodeBatch),
}

/// Nesting counter, pending decode queue and callback buckets.
#[derive(Debug)]
pub struct TransactionCoordinator<C> {
    depth: u32,
    pending: Vec<DecodeRequest>,
    open_callbacks: Vec<C>,
    in_flight: Option<(u64, Vec<C>)>,
    next_generation: u64,
    tile_size: usize,
    debug: bool,
}

impl<C> TransactionCoordinator<C> {
    pub fn new(tile_size: usize, debug: bool) -> Self {
        Self {
            depth: 0,
            pending: Vec::new(),
            open_callbacks: Vec::new(),
            in_flight: None,
            next_generation: 1,
            tile_size,
            debug,
        }
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_generation(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|(generation, _)| *generation)
    }

    /// Queue a decode; a newer request for the same tile replaces the older.
    pub fn enqueue(&mut self, request: DecodeRequest) {
        if self.depth == 0 {
            warn!(key = %request.coords, "Decode queued outside of a transaction");
        }
        match self.pending.iter_mut().find(|r| r.coords == request.coords) {
            Some(existing) => *existing = request,
            None => self.pending.push(request),
        }
    }

    /// Close one level of nesting.
    pub fn end(&mut self, callback: Option<C>) -> EndOutcome<C> {
        if self.depth == 0 {
            error!("Mismatched end_transaction");
            return EndOutcome::RunNow(callback.into_iter().collect());
        }

        self.depth -= 1;
        self.open_callbacks.extend(callback);
        if self.depth > 0 {
            return EndOutcome::Deferred;
        }

        if self.pending.is_empty() {
            return match self.in_flight.as_mut() {
                Some((_, bucket)) => {
                    bucket.append(&mut self.open_callbacks);
                    EndOutcome::Deferred
                }
                None => EndOutcome::RunNow(std::mem::take(&mut self.open_callbacks)),
            };
        }

        if self.in_flight.is_some() {
            return EndOutcome::Deferred;
        }

        EndOutcome::Dispatch(self.dispatch())
    }

    /// Mark a batch as installed and hand back its callbacks.
    pub fn complete(&mut self, generation: u64) -> Option<Vec<C>> {
        match self.in_flight.take() {
            Some((g, callbacks)) if g == generation => Some(callbacks),
            other => {
                warn!(generation, "Unexpectedly received decompressed batch");
                self.in_flight = other;
                None
            }
        }
    }

    /// Batch that was held back behind the previous one, if any.
    pub fn next_batch(&mut self) -> Option<DecodeBatch> {
        if self.depth > 0 || self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        Some(self.dispatch())
    }

    /// Drop all queued work and return every outstanding callback.
    pub fn abort_all(&mut self) -> Vec<C> {
        self.depth = 0;
        self.pending.clear();
        let mut callbacks = match self.in_flight.take() {
            Some((_, bucket)) => bucket,
            None => Vec::new(),
        };
        callbacks.append(&mut self.open_callbacks);
        callbacks
    }

    fn dispatch(&mut self) -> DecodeBatch {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.in_flight = Some((generation, std::mem::take(&mut self.open_callbacks)));
        DecodeBatch {
            generation,
            tile_size: self.tile_size,
            debug: self.debug,
            requests: std::mem::take(&mut self.pending),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
