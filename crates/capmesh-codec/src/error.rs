//! Codec error types

use thiserror::Error;

/// Errors decoding frames and chunks
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown packet type byte: {0}")]
    UnknownPacketType(u8),

    #[error("Declared payload length {declared} disagrees with frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Chunk count mismatch for packet {0}: expected {1}, chunk declares {2}")]
    ChunkCountMismatch(uuid::Uuid, u16, u16),

    #[error("Chunk index {index} out of range for count {count}")]
    ChunkIndexOutOfRange { index: u16, count: u16 },

    #[error("Zero-size chunk limit")]
    ZeroChunkSize,
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
