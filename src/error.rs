//! Error types for soma-decode.

use candle_core::DType;
use thiserror::Error;

/// Result type alias for soma-decode operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for soma-decode.
#[derive(Error, Debug)]
pub enum Error {
    /// A write position falls outside `[0, max_seq_len)`.
    #[error("position {position} out of bounds (max_seq_len {max_seq_len})")]
    PositionOutOfBounds { position: usize, max_seq_len: usize },

    /// Update tensor does not match the cache's allocated dimensions.
    #[error("{tensor} update shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Update tensor dtype differs from the cache dtype.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Slice assignment needs a single ascending contiguous run.
    #[error("positions {positions:?} are not a contiguous run; slice assignment cannot write them")]
    NonContiguousPositions { positions: Vec<usize> },

    /// Empty or duplicated write positions.
    #[error("invalid positions: {0}")]
    InvalidPositions(String),

    /// Layer index outside the layer stack.
    #[error("layer {layer} out of bounds ({num_layers} layers)")]
    LayerOutOfBounds { layer: usize, num_layers: usize },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
