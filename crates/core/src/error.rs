//! Error types for the Engram memory store
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Model
//!
//! Every fallible operation returns [`Result<T>`]. The variants mirror the
//! taxonomy surfaced to callers:
//!
//! - **InvalidInput**: schema violations, bad budgets, rejected configs
//! - **NotFound**: the id does not exist in any requested scope
//! - **LockTimeout / Backpressure**: bounded waits that elapsed
//! - **Store**: filesystem and I/O failures
//! - **Codec / Decode**: QR chunk and payload reconstruction failures
//! - **DimensionMismatch**: vector index dimension conflicts
//! - **DependencyMissing**: no transcoder available for the video backend
//! - **Integrity**: checksum mismatch that could not be repaired
//!
//! Retryable failures (lock contention, backpressure) can be identified with
//! [`Error::is_retryable`] so callers can implement backoff loops.

use std::io;
use thiserror::Error;

/// Result type alias for Engram operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the QR chunk codec
///
/// Decoding a frame sequence fails as a whole: a single missing or corrupt
/// chunk makes the payload unrecoverable without re-extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// A chunk index in `0..total_chunks` was never seen
    ChunkMissing,
    /// A chunk was seen but its payload failed validation
    ChunkCorrupt,
    /// The 16-byte chunk header had a bad magic, index, or flag combination
    HeaderInvalid,
}

impl std::fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecErrorKind::ChunkMissing => write!(f, "ChunkMissing"),
            CodecErrorKind::ChunkCorrupt => write!(f, "ChunkCorrupt"),
            CodecErrorKind::HeaderInvalid => write!(f, "HeaderInvalid"),
        }
    }
}

/// Error types for the Engram memory store
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed schema or range validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No item with the given id in any requested scope
    #[error("not found: {0}")]
    NotFound(String),

    /// Advisory lock acquisition exceeded its timeout
    #[error("lock timeout on scope {scope} after {waited_ms}ms")]
    LockTimeout {
        /// Scope whose lock was contended
        scope: String,
        /// Total time spent waiting
        waited_ms: u64,
    },

    /// The encoding queue is over its soft cap and the deadline elapsed
    #[error("backpressure: encoding queue full ({depth}/{cap})")]
    Backpressure {
        /// Current queue depth
        depth: usize,
        /// Configured soft cap
        cap: usize,
    },

    /// I/O error (file operations, subprocess pipes)
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage layer error that is not a direct I/O failure
    #[error("store error: {0}")]
    Store(String),

    /// QR chunk codec failure
    #[error("codec error: {kind}: {detail}")]
    Codec {
        /// Which validation failed
        kind: CodecErrorKind,
        /// Human-readable context
        detail: String,
    },

    /// A payload could not be reconstructed from its frames
    #[error("decode error: {0}")]
    Decode(String),

    /// Vector dimension disagrees with the index's pinned dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension pinned by the first inserted vector
        expected: usize,
        /// Dimension of the offending vector
        actual: usize,
    },

    /// A required external dependency is unavailable
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// Verification failed and automatic repair was not possible
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled or its deadline elapsed
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Construct a codec error
    pub fn codec(kind: CodecErrorKind, detail: impl Into<String>) -> Self {
        Error::Codec {
            kind,
            detail: detail.into(),
        }
    }

    /// Check whether retrying the operation could succeed
    ///
    /// Lock contention and backpressure are transient; everything else
    /// requires intervention or different input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::Backpressure { .. }
        )
    }

    /// Check whether this error means data could not be reconstructed
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Error::Codec { .. } | Error::Decode(_))
    }

    /// Wire-level error code, as surfaced to clients
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "InvalidInput",
            Error::NotFound(_) => "NotFound",
            Error::LockTimeout { .. } => "LockTimeout",
            Error::Backpressure { .. } => "Backpressure",
            Error::Io(_) | Error::Store(_) | Error::Serialization(_) => "StoreError",
            Error::Codec { .. } => "CodecError",
            Error::Decode(_) => "DecodeError",
            Error::DimensionMismatch { .. } => "DimensionMismatch",
            Error::DependencyMissing(_) => "DependencyMissing",
            Error::Integrity(_) => "IntegrityError",
            Error::Cancelled(_) => "Cancelled",
        }
    }
}
