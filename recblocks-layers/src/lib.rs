//! Dense and MLP blocks for tabular recommender models
//!
//! The blocks here consume tensors, or bundles which they concatenate first,
//! so they can be wrapped by [`recblocks_core::TabularBlock`] and selected
//! from a schema like any other block.

#![warn(missing_docs)]

pub mod dense;
pub mod error;
pub mod mlp;

pub use dense::{Activation, Dense};
pub use error::{Error, Result};
pub use mlp::{MlpBlock, MlpConfig, Normalization};
