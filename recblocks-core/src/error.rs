//! Error types for tabular block composition

use thiserror::Error;

/// Result type for block composition operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for block composition operations
#[derive(Error, Debug)]
pub enum Error {
    /// A block needing a named bundle got a bare tensor, or the other way round
    #[error("Invalid input kind: expected {expected}, got {got}")]
    InvalidInputKind {
        /// What the operation accepts
        expected: &'static str,
        /// What it actually received
        got: &'static str,
    },

    /// Batch dimensions disagree, or entries cannot be combined
    #[error("Shape inconsistency: {0}")]
    ShapeInconsistency(String),

    /// Two merged bundles produced the same key under `CollisionPolicy::Error`
    #[error("Key collision on '{key}'")]
    KeyCollision {
        /// The duplicated bundle key
        key: String,
    },

    /// A named column is not part of the schema
    #[error("Column not found: {0}")]
    MissingColumn(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed block configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error raised by the tensor backend
    #[error("Tensor error: {0}")]
    Tensor(#[from] ndarray::ShapeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn expected_bundle(got: &'static str) -> Self {
        Error::InvalidInputKind {
            expected: "bundle",
            got,
        }
    }

    pub(crate) fn expected_tensor(got: &'static str) -> Self {
        Error::InvalidInputKind {
            expected: "tensor",
            got,
        }
    }
}
