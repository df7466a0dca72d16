//! Named tensor bundles, the unit of data flowing between blocks

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::shape::{EntryShape, Shape, ShapeDescriptor, ShapeSpec};
use crate::tensor::{RaggedTensor, SparseTensor, Tensor};

/// One entry of a bundle
#[derive(Clone, PartialEq)]
pub enum TensorValue {
    /// Dense tensor
    Dense(Tensor),
    /// Multi-valued column stored as values plus row lengths
    Ragged(RaggedTensor),
    /// Sparse tensor
    Sparse(SparseTensor),
    /// Nested bundle
    Nested(TensorBundle),
}

impl TensorValue {
    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            TensorValue::Dense(_) => "dense tensor",
            TensorValue::Ragged(_) => "ragged tensor",
            TensorValue::Sparse(_) => "sparse tensor",
            TensorValue::Nested(_) => "nested bundle",
        }
    }

    /// Borrow the dense tensor, if this is one
    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            TensorValue::Dense(t) => Some(t),
            _ => None,
        }
    }

    /// Leading dimension of this entry
    pub fn batch_size(&self) -> Option<usize> {
        match self {
            TensorValue::Dense(t) => t.shape().first().copied(),
            TensorValue::Ragged(r) => Some(r.batch_size()),
            TensorValue::Sparse(s) => Some(s.dense_shape()[0]),
            TensorValue::Nested(b) => b.batch_size(),
        }
    }

    /// Static shape of this entry
    pub fn entry_shape(&self) -> EntryShape {
        match self {
            TensorValue::Dense(t) => EntryShape::Dense(Shape::known(t.shape())),
            TensorValue::Ragged(r) => EntryShape::Ragged {
                batch: Some(r.batch_size()),
                max_len: Some(r.max_row_length()),
            },
            TensorValue::Sparse(s) => EntryShape::Sparse(Shape::known(&s.dense_shape())),
            TensorValue::Nested(b) => EntryShape::Nested(b.shape_descriptor()),
        }
    }
}

impl fmt::Debug for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorValue::Dense(t) => write!(f, "Tensor{:?}", t.shape()),
            TensorValue::Ragged(r) => r.fmt(f),
            TensorValue::Sparse(s) => s.fmt(f),
            TensorValue::Nested(b) => b.fmt(f),
        }
    }
}

impl From<Tensor> for TensorValue {
    fn from(tensor: Tensor) -> Self {
        TensorValue::Dense(tensor)
    }
}

impl From<RaggedTensor> for TensorValue {
    fn from(ragged: RaggedTensor) -> Self {
        TensorValue::Ragged(ragged)
    }
}

impl From<SparseTensor> for TensorValue {
    fn from(sparse: SparseTensor) -> Self {
        TensorValue::Sparse(sparse)
    }
}

impl From<TensorBundle> for TensorValue {
    fn from(bundle: TensorBundle) -> Self {
        TensorValue::Nested(bundle)
    }
}

/// What happens when two bundles being merged share a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The later bundle's entry replaces the earlier one
    #[default]
    Overwrite,
    /// Fail with [`Error::KeyCollision`]
    Error,
}

/// An insertion-ordered mapping from names to tensors.
///
/// Order matters: aggregators concatenate and stack entries in bundle order.
#[derive(Clone, Default, PartialEq)]
pub struct TensorBundle {
    entries: Vec<(String, TensorValue)>,
}

impl TensorBundle {
    /// Create an empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bundle with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(key, _)| key == name)
    }

    /// Insert an entry, returning the value it replaced.
    ///
    /// A replaced entry keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TensorValue>) -> Option<TensorValue> {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => Some(std::mem::replace(&mut self.entries[index].1, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Builder form of [`TensorBundle::insert`]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<TensorValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up an entry
    pub fn get(&self, name: &str) -> Option<&TensorValue> {
        self.position(name).map(|index| &self.entries[index].1)
    }

    /// Look up a dense entry
    pub fn dense(&self, name: &str) -> Option<&Tensor> {
        self.get(name).and_then(TensorValue::as_dense)
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<TensorValue> {
        self.position(name).map(|index| self.entries.remove(index).1)
    }

    /// Whether an entry exists
    pub fn contains_key(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Entry names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> + '_ {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into the entries `keep` accepts and the rest, both in original order
    pub fn partition(self, keep: impl Fn(&str) -> bool) -> (TensorBundle, TensorBundle) {
        let (kept, rest): (Vec<_>, Vec<_>) =
            self.entries.into_iter().partition(|(key, _)| keep(key));
        (TensorBundle { entries: kept }, TensorBundle { entries: rest })
    }

    /// Union `other` into this bundle.
    ///
    /// With [`CollisionPolicy::Overwrite`] entries from `other` win.
    pub fn union(&mut self, other: TensorBundle, policy: CollisionPolicy) -> Result<()> {
        for (name, value) in other.entries {
            if self.contains_key(&name) {
                if policy == CollisionPolicy::Error {
                    return Err(Error::KeyCollision { key: name });
                }
                debug!(key = %name, "overwriting bundle entry on merge");
            }
            self.insert(name, value);
        }
        Ok(())
    }

    /// Leading dimension of the first dense leaf, falling back to any entry
    pub fn batch_size(&self) -> Option<usize> {
        self.entries
            .iter()
            .find_map(|(_, value)| match value {
                TensorValue::Dense(t) => t.shape().first().copied(),
                TensorValue::Nested(b) => b.batch_size(),
                _ => None,
            })
            .or_else(|| self.entries.iter().find_map(|(_, value)| value.batch_size()))
    }

    /// Fail if entries disagree on their batch dimension
    pub fn validate_batch(&self) -> Result<Option<usize>> {
        self.shape_descriptor().validate_batch()
    }

    /// Static shapes of every entry
    pub fn shape_descriptor(&self) -> ShapeDescriptor {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), value.entry_shape()))
            .collect()
    }
}

impl fmt::Debug for TensorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl<K: Into<String>, V: Into<TensorValue>> FromIterator<(K, V)> for TensorBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bundle = Self::new();
        for (name, value) in iter {
            bundle.insert(name, value);
        }
        bundle
    }
}

impl IntoIterator for TensorBundle {
    type Item = (String, TensorValue);
    type IntoIter = std::vec::IntoIter<(String, TensorValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// What a block accepts and returns: a bare tensor or a named bundle
#[derive(Debug, Clone, PartialEq)]
pub enum BlockValue {
    /// A single dense tensor
    Tensor(Tensor),
    /// A named bundle
    Bundle(TensorBundle),
}

impl BlockValue {
    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            BlockValue::Tensor(_) => "tensor",
            BlockValue::Bundle(_) => "bundle",
        }
    }

    /// Unwrap a bundle or fail with `InvalidInputKind`
    pub fn into_bundle(self) -> Result<TensorBundle> {
        match self {
            BlockValue::Bundle(bundle) => Ok(bundle),
            BlockValue::Tensor(_) => Err(Error::expected_bundle("tensor")),
        }
    }

    /// Unwrap a tensor or fail with `InvalidInputKind`
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            BlockValue::Tensor(tensor) => Ok(tensor),
            BlockValue::Bundle(_) => Err(Error::expected_tensor("bundle")),
        }
    }

    /// Static shape of this value
    pub fn shape_spec(&self) -> ShapeSpec {
        match self {
            BlockValue::Tensor(t) => ShapeSpec::Tensor(Shape::known(t.shape())),
            BlockValue::Bundle(b) => ShapeSpec::Bundle(b.shape_descriptor()),
        }
    }
}

impl From<Tensor> for BlockValue {
    fn from(tensor: Tensor) -> Self {
        BlockValue::Tensor(tensor)
    }
}

impl From<TensorBundle> for BlockValue {
    fn from(bundle: TensorBundle) -> Self {
        BlockValue::Bundle(bundle)
    }
}
