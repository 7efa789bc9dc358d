//! Raw delta log and the delta application algorithm.
//!
//! Tiles arrive as a compressed keyframe followed by any number of compressed
//! deltas. The raw chunks are retained (cheap, compressed) so that a tile can
//! be rebuilt later without asking the server again.
//!
//! # Payload Formats
//!
//! - **Keyframe**: a zstd frame that inflates to `tile_size * tile_size * 4`
//!   row-major RGBA bytes, or a PNG (first byte `0x89`) of the same size.
//! - **Delta**: a zstd frame that inflates to an op-code stream:
//!
//! ```text
//! 'c' count src_row dest_row        copy `count` rows of the previous frame
//! 'd' dest_row dest_col span <RGBA> overwrite `span` pixels at (col, row)
//! 't'                               end of this delta, the next one follows
//! ```
//!
//! Operands are single bytes. Every delta is applied against a snapshot of
//! the image as it was before that delta started, so `'c'` always reads
//! pre-delta pixels.

use bytes::Bytes;
use image::ImageFormat;
use tracing::{error, trace, warn};

use crate::error::DeltaError;

/// Copy rows from the previous frame.
pub const OP_COPY_ROW: u8 = b'c';

/// Overwrite a run of pixels with literal RGBA data.
pub const OP_NEW_SPAN: u8 = b'd';

/// Terminate the current delta.
pub const OP_TERMINATE: u8 = b't';

/// First byte of a PNG stream.
pub const PNG_MAGIC: u8 = 0x89;

/// Bytes of hex shown when dumping payload prefixes at trace level.
const HEX_DUMP_LIMIT: usize = 32;

// =============================================================================
// Raw Delta Chunk
// =============================================================================

/// One compressed keyframe or delta as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeltaChunk {
    /// Compressed payload (zstd, or PNG for keyframes)
    pub bytes: Bytes,

    /// Per-tile arrival id, strictly increasing
    pub id: u64,

    /// True if this chunk replaces the whole tile
    pub is_keyframe: bool,
}

impl RawDeltaChunk {
    pub fn new(bytes: Bytes, id: u64, is_keyframe: bool) -> Self {
        Self {
            bytes,
            id,
            is_keyframe,
        }
    }
}

// =============================================================================
// Raw Delta Log
// =============================================================================

/// Ordered, append-only log of a tile's compressed chunks.
///
/// The first retained chunk is always a keyframe: pushing a keyframe drops
/// everything before it, and a delta is refused when there is nothing to
/// apply it to.
#[derive(Debug, Clone, Default)]
pub struct RawDeltaLog {
    chunks: Vec<RawDeltaChunk>,
    byte_len: usize,
}

impl RawDeltaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`DeltaError::NoBaseImage`] for a delta on an empty log.
    pub fn push(&mut self, chunk: RawDeltaChunk) -> Result<(), DeltaError> {
        if chunk.is_keyframe {
            self.clear();
        } else if self.chunks.is_empty() {
            return Err(DeltaError::NoBaseImage);
        }

        debug_assert!(
            self.last_id().map_or(true, |last| chunk.id > last),
            "chunk ids must increase"
        );

        self.byte_len += chunk.bytes.len();
        self.chunks.push(chunk);
        Ok(())
    }

    /// Drop every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.byte_len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Total compressed bytes retained.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn chunks(&self) -> &[RawDeltaChunk] {
        &self.chunks
    }

    pub fn first_id(&self) -> Option<u64> {
        self.chunks.first().map(|c| c.id)
    }

    pub fn last_id(&self) -> Option<u64> {
        self.chunks.last().map(|c| c.id)
    }

    /// Chunks with an id strictly greater than `id`.
    pub fn since(&self, id: u64) -> &[RawDeltaChunk] {
        let start = self.chunks.partition_point(|c| c.id <= id);
        &self.chunks[start..]
    }
}

// =============================================================================
// Delta Decoder
// =============================================================================

/// Decompresses raw chunks and replays them into an RGBA buffer.
///
/// Stateless apart from its settings, so one instance can live on the
/// worker thread and another on the owning thread.
#[derive(Debug, Clone, Copy)]
pub struct DeltaDecoder {
    tile_size: usize,
    debug: bool,
}

impl DeltaDecoder {
    pub fn new(tile_size: usize) -> Self {
        Self {
            tile_size,
            debug: false,
        }
    }

    /// Enable per-op-code tracing.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Size of a fully decoded tile in bytes.
    pub fn tile_bytes(&self) -> usize {
        self.tile_size * self.tile_size * 4
    }

    /// Inflate one chunk.
    ///
    /// PNG keyframes are decoded to raw RGBA; everything else is a zstd frame.
    pub fn decode_chunk(&self, chunk: &RawDeltaChunk) -> Result<Vec<u8>, DeltaError> {
        if chunk.is_keyframe && chunk.bytes.first() == Some(&PNG_MAGIC) {
            let img = image::load_from_memory_with_format(&chunk.bytes, ImageFormat::Png)
                .map_err(|e| DeltaError::Png(e.to_string()))?
                .to_rgba8();
            let raw = img.into_raw();
            if raw.len() != self.tile_bytes() {
                return Err(DeltaError::KeyframeSize {
                    expected: self.tile_bytes(),
                    actual: raw.len(),
                });
            }
            return Ok(raw);
        }

        let data = zstd::stream::decode_all(&chunk.bytes[..])
            .map_err(|e| DeltaError::Decompress(e.to_string()))?;

        if self.debug {
            let shown = data.len().min(HEX_DUMP_LIMIT);
            trace!(
                id = chunk.id,
                keyframe = chunk.is_keyframe,
                compressed = chunk.bytes.len(),
                inflated = data.len(),
                hex = %hex::encode(&data[..shown]),
                "Inflated chunk"
            );
        }

        Ok(data)
    }

    /// Rebuild a tile image from `chunks`.
    ///
    /// If the first chunk is a keyframe the image is seeded from it; otherwise
    /// `base` (the last decoded image) is the starting point. Deltas are then
    /// applied in id order. A malformed delta stops processing at that point
    /// and the pixels decoded so far are kept.
    ///
    /// # Errors
    ///
    /// Fails when a chunk cannot be inflated, the keyframe is too short, or
    /// there is no keyframe and no usable `base`.
    pub fn rehydrate(
        &self,
        chunks: &[RawDeltaChunk],
        base: Option<&[u8]>,
    ) -> Result<Vec<u8>, DeltaError> {
        let tile_bytes = self.tile_bytes();

        let mut combined = Vec::new();
        let mut seeded_from_keyframe = false;
        for (n, chunk) in chunks.iter().enumerate() {
            let data = self.decode_chunk(chunk)?;
            if chunk.is_keyframe {
                if n != 0 {
                    warn!(id = chunk.id, "Keyframe in the middle of a delta slice, restarting");
                    combined.clear();
                }
                if data.len() < tile_bytes {
                    return Err(DeltaError::KeyframeSize {
                        expected: tile_bytes,
                        actual: data.len(),
                    });
                }
                seeded_from_keyframe = true;
            }
            combined.extend_from_slice(&data);
        }

        let (mut img, mut offset) = if seeded_from_keyframe {
            (combined[..tile_bytes].to_vec(), tile_bytes)
        } else {
            let base = base.ok_or(DeltaError::NoBaseImage)?;
            if base.len() != tile_bytes {
                return Err(DeltaError::KeyframeSize {
                    expected: tile_bytes,
                    actual: base.len(),
                });
            }
            (base.to_vec(), 0)
        };

        let mut applied = 0usize;
        while offset < combined.len() {
            let delta = &combined[offset..];

            if delta.len() >= tile_bytes {
                warn!(
                    len = delta.len(),
                    tile_bytes, "Unusual delta possibly mis-tagged, suspicious size vs. type"
                );
            }

            let old = img.clone();
            match self.apply_ops(&mut img, delta, &old) {
                Ok(len) => {
                    if self.debug {
                        trace!(chunk = applied, offset, len, "Applied delta");
                    }
                    offset += len;
                    applied += 1;
                }
                Err(e) => {
                    error!(error = %e, offset, "Aborting delta application");
                    break;
                }
            }
        }

        Ok(img)
    }

    /// Apply one op-code stream to `img`, reading copied rows from `old`.
    ///
    /// Returns the number of bytes consumed: up to and including the
    /// terminating `'t'`, or the whole slice if it is not terminated.
    pub fn apply_ops(&self, img: &mut [u8], delta: &[u8], old: &[u8]) -> Result<usize, DeltaError> {
        let width = self.tile_size;
        let height = self.tile_size;
        let row_bytes = width * 4;

        let need = |offset: usize, needed: usize| -> Result<(), DeltaError> {
            if offset + needed > delta.len() {
                Err(DeltaError::Truncated {
                    offset,
                    needed,
                    available: delta.len().saturating_sub(offset),
                })
            } else {
                Ok(())
            }
        };

        let mut i = 0;
        while i < delta.len() {
            match delta[i] {
                OP_COPY_ROW => {
                    need(i, 4)?;
                    let count = delta[i + 1] as usize;
                    let src_row = delta[i + 2] as usize;
                    let dest_row = delta[i + 3] as usize;
                    if self.debug {
                        trace!(at = i, count, src_row, dest_row, "copy rows");
                    }
                    i += 4;

                    if src_row + count > height || dest_row + count > height {
                        return Err(DeltaError::OutOfBounds {
                            row: src_row.max(dest_row),
                            col: 0,
                            span: count,
                        });
                    }
                    let src = src_row * row_bytes;
                    let dest = dest_row * row_bytes;
                    let len = count * row_bytes;
                    img[dest..dest + len].copy_from_slice(&old[src..src + len]);
                }
                OP_NEW_SPAN => {
                    need(i, 4)?;
                    let dest_row = delta[i + 1] as usize;
                    let dest_col = delta[i + 2] as usize;
                    let span = delta[i + 3] as usize;
                    if self.debug {
                        trace!(at = i, dest_row, dest_col, span, "new span");
                    }
                    i += 4;

                    let len = span * 4;
                    need(i, len)?;
                    let offset = dest_row * row_bytes + dest_col * 4;
                    if offset + len > img.len() {
                        return Err(DeltaError::OutOfBounds {
                            row: dest_row,
                            col: dest_col,
                            span,
                        });
                    }
                    img[offset..offset + len].copy_from_slice(&delta[i..i + len]);
                    i += len;
                }
                OP_TERMINATE => return Ok(i + 1),
                code => return Err(DeltaError::UnknownOpcode { offset: i, code }),
            }
        }

        Ok(i)
    }
}

/// zstd-compress a raw keyframe or op-code stream for the wire.
pub fn compress_payload(raw: &[u8]) -> Result<Bytes, DeltaError> {
    zstd::stream::encode_all(raw, 3)
        .map(Bytes::from)
        .map_err(|e| DeltaError::Decompress(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
