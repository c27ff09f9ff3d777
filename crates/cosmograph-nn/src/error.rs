//! Error types for cosmograph-nn.

use thiserror::Error;

/// Layer, model and training error.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Graph construction error.
    #[error("graph error: {0}")]
    Graph(#[from] cosmograph_core::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
