//! Error types for the layer blocks

use thiserror::Error;

/// Error type for layer construction
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] recblocks_core::Error),

    /// Layer parameters that cannot form a layer
    #[error("Invalid layer: {0}")]
    InvalidLayer(String),

    /// Unknown or inconsistent configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for layer construction
pub type Result<T> = std::result::Result<T, Error>;
