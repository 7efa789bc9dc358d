use thiserror::Error;

/// Errors raised while decoding a tile's keyframe or applying its deltas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// Op-code byte that is not part of the delta language
    #[error("Unknown delta op-code 0x{code:02X} at offset {offset}")]
    UnknownOpcode { offset: usize, code: u8 },

    /// Delta stream ends in the middle of an op-code or its operands
    #[error("Truncated delta at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Op-code addresses pixels outside the tile
    #[error("Delta op out of bounds: row {row}, col {col}, span {span}")]
    OutOfBounds { row: usize, col: usize, span: usize },

    /// Decoded keyframe does not cover the whole tile
    #[error("Keyframe size mismatch: expected {expected} bytes, got {actual}")]
    KeyframeSize { expected: usize, actual: usize },

    /// zstd frame could not be decompressed
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// PNG keyframe could not be decoded
    #[error("PNG decode failed: {0}")]
    Png(String),

    /// Deltas were supplied without a keyframe or a cached image to apply them to
    #[error("No base image to apply deltas to")]
    NoBaseImage,
}

/// Errors raised while parsing tile-bearing server messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame does not start with a recognised tile message prefix
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// A mandatory header field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A header field is present but not a valid integer (or list of integers)
    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    /// Frame has no text header at all
    #[error("Empty frame")]
    EmptyFrame,
}

/// Errors from the off-thread decompression worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker thread could not be started
    #[error("Failed to spawn decompression worker: {0}")]
    Spawn(String),

    /// The worker thread has gone away (panicked or was terminated)
    #[error("Decompression worker disconnected")]
    Disconnected,

    /// The worker caught a panic while decoding a batch
    #[error("Decompression worker failed on batch {generation}: {reason}")]
    Failed { generation: u64, reason: String },
}
