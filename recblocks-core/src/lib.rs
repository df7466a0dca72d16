//! Declarative composition of tabular blocks for recommender models
//!
//! Models are assembled from blocks that consume and produce either a single
//! tensor or a named bundle of tensors. Blocks select columns ([`Filter`]),
//! reduce bundles to tensors ([`Concat`], [`Stack`], [`AsTabular`], ...),
//! fan inputs out to several blocks ([`Merge`], [`Parallel`]) and chain
//! into flat pipelines ([`Sequential`]). [`TabularBlock`] wraps any block
//! with per-call filtering, side branches and aggregation, and every block
//! can report its output shape without seeing any data.

#![warn(missing_docs)]

pub mod aggregation;
pub mod block;
pub mod bundle;
pub mod error;
pub mod filter;
pub mod merge;
pub mod schema;
pub mod shape;
pub mod tabular;
pub mod tensor;
pub mod transformations;

// Re-export key types for convenience
pub use aggregation::{AsTabular, Aggregation, Concat, CosineSimilarity, ElementwiseSum, Stack};
pub use block::{compose, Block, BlockExt, NoOp, Sequential};
pub use bundle::{BlockValue, CollisionPolicy, TensorBundle, TensorValue};
pub use error::{Error, Result};
pub use filter::Filter;
pub use merge::{Merge, Parallel};
pub use schema::{ColumnSchema, Schema, Tag};
pub use shape::{calculate_batch_size, Dim, EntryShape, Shape, ShapeDescriptor, ShapeSpec};
pub use tabular::{CallOptions, TabularBlock, TabularConfig};
pub use tensor::{RaggedTensor, SparseTensor, Tensor};
pub use transformations::{AsDenseFeatures, AsSparseFeatures, ParseTokenizedText};

static_assertions::assert_impl_all!(TensorBundle: Send, Sync, Clone);
static_assertions::assert_impl_all!(Sequential: Send, Sync);
static_assertions::assert_impl_all!(TabularBlock: Send, Sync);
static_assertions::assert_impl_all!(Schema: Send, Sync, Clone);
