//! Error types for cosmograph-core.

use thiserror::Error;

/// Graph construction error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A segment id array left a segment without members.
    #[error("segment {segment} of `{name}` has no members")]
    EmptySegment { name: &'static str, segment: usize },

    /// A particle without exactly one self-loop in an edge graph.
    #[error("sample {sample}, row {row}: expected one self-loop, found {count}")]
    IncompleteDiagonal { sample: usize, row: usize, count: usize },

    /// Index outside the range it must address.
    #[error("index {index} out of range (bound {bound})")]
    IndexOutOfRange { index: usize, bound: usize },

    /// Malformed or degenerate input data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
