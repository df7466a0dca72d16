//! Static shape descriptors used for shape inference
//!
//! Every block can report the shape it produces for a given input shape
//! without touching any data. The batch dimension is usually unknown while a
//! model is being assembled, so every dimension is an `Option<usize>`.

use std::fmt;

use crate::bundle::CollisionPolicy;
use crate::error::{Error, Result};

/// A single dimension, `None` when unknown
pub type Dim = Option<usize>;

/// Shape of a dense tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<Dim>);

impl Shape {
    /// Create a shape from known dimensions
    pub fn known(dims: &[usize]) -> Self {
        Self(dims.iter().copied().map(Some).collect())
    }

    /// Create a shape whose batch dimension is unknown
    pub fn with_unknown_batch(feature_dims: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(feature_dims.len() + 1);
        dims.push(None);
        dims.extend(feature_dims.iter().copied().map(Some));
        Self(dims)
    }

    /// Leading dimension
    pub fn batch(&self) -> Dim {
        self.0.first().copied().flatten()
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Dimensions
    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// Last dimension
    pub fn last(&self) -> Dim {
        self.0.last().copied().flatten()
    }

    /// Whether both shapes have the same rank and agree on every dimension
    /// known to both
    pub fn compatible_with(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => x == y,
                    _ => true,
                })
    }

    /// Width after flattening everything but the batch dimension
    pub fn flat_width(&self) -> Dim {
        self.0
            .iter()
            .skip(1)
            .try_fold(1usize, |acc, dim| dim.map(|d| acc * d))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match dim {
                Some(d) => write!(f, "{d}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, ")")
    }
}

/// Shape of one bundle entry
#[derive(Debug, Clone, PartialEq)]
pub enum EntryShape {
    /// Dense tensor
    Dense(Shape),

    /// Ragged column; `max_len` comes from schema value counts when known
    Ragged {
        /// Number of rows
        batch: Dim,
        /// Longest possible row
        max_len: Dim,
    },

    /// Sparse tensor
    Sparse(Shape),

    /// Nested bundle
    Nested(ShapeDescriptor),
}

impl EntryShape {
    /// Whether this entry is a plain dense leaf
    pub fn is_leaf(&self) -> bool {
        matches!(self, EntryShape::Dense(_))
    }
}

/// Shapes of every entry in a bundle, in bundle order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeDescriptor {
    entries: Vec<(String, EntryShape)>,
}

impl ShapeDescriptor {
    /// Create an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, shape: EntryShape) -> Option<EntryShape> {
        let name = name.into();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(key, _)| *key == name) {
            return Some(std::mem::replace(existing, shape));
        }
        self.entries.push((name, shape));
        None
    }

    /// Builder form of [`ShapeDescriptor::insert`] for dense entries
    #[must_use]
    pub fn with_dense(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.insert(name, EntryShape::Dense(shape));
        self
    }

    /// Look up an entry
    pub fn get(&self, name: &str) -> Option<&EntryShape> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, shape)| shape)
    }

    /// Whether an entry exists
    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Entry names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntryShape)> + '_ {
        self.entries.iter().map(|(key, shape)| (key.as_str(), shape))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only the entries whose name satisfies `keep`
    #[must_use]
    pub fn retain_keys(mut self, keep: impl Fn(&str) -> bool) -> Self {
        self.entries.retain(|(key, _)| keep(key));
        self
    }

    /// Union `other` into this descriptor, mirroring [`crate::TensorBundle::union`]
    pub fn union(&mut self, other: ShapeDescriptor, policy: CollisionPolicy) -> Result<()> {
        for (name, shape) in other.entries {
            if policy == CollisionPolicy::Error && self.contains_key(&name) {
                return Err(Error::KeyCollision { key: name });
            }
            self.insert(name, shape);
        }
        Ok(())
    }

    /// Reject bundles whose known batch dimensions disagree
    pub fn validate_batch(&self) -> Result<Dim> {
        let mut seen: Option<(String, usize)> = None;
        self.visit_batches(&mut |name, batch| {
            let Some(batch) = batch else {
                return Ok(());
            };
            if let Some((first, size)) = &seen {
                if *size != batch {
                    return Err(Error::ShapeInconsistency(format!(
                        "batch size {batch} of '{name}' disagrees with {size} of '{first}'"
                    )));
                }
            } else {
                seen = Some((name.to_string(), batch));
            }
            Ok(())
        })?;

        Ok(seen.map(|(_, size)| size))
    }

    fn visit_batches(&self, visit: &mut dyn FnMut(&str, Dim) -> Result<()>) -> Result<()> {
        for (name, shape) in &self.entries {
            match shape {
                EntryShape::Dense(s) | EntryShape::Sparse(s) => visit(name, s.batch())?,
                EntryShape::Ragged { batch, .. } => visit(name, *batch)?,
                EntryShape::Nested(inner) => inner.visit_batches(visit)?,
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, EntryShape)> for ShapeDescriptor {
    fn from_iter<I: IntoIterator<Item = (String, EntryShape)>>(iter: I) -> Self {
        let mut descriptor = Self::new();
        for (name, shape) in iter {
            descriptor.insert(name, shape);
        }
        descriptor
    }
}

/// Shape of whatever crosses a block boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeSpec {
    /// A single dense tensor
    Tensor(Shape),

    /// A named bundle
    Bundle(ShapeDescriptor),
}

impl ShapeSpec {
    /// Borrow the bundle descriptor or fail with `InvalidInputKind`
    pub fn as_bundle(&self) -> Result<&ShapeDescriptor> {
        match self {
            ShapeSpec::Bundle(descriptor) => Ok(descriptor),
            ShapeSpec::Tensor(_) => Err(Error::expected_bundle("tensor")),
        }
    }

    /// Borrow the tensor shape or fail with `InvalidInputKind`
    pub fn as_tensor(&self) -> Result<&Shape> {
        match self {
            ShapeSpec::Tensor(shape) => Ok(shape),
            ShapeSpec::Bundle(_) => Err(Error::expected_tensor("bundle")),
        }
    }
}

/// Batch size of a bundle as seen by the aggregators.
///
/// Takes the leading dimension of the first plain dense leaf, looking inside
/// nested bundles; ragged and sparse entries are skipped. Bundle order
/// decides which leaf is used, so this only promises "some leaf's batch".
pub fn calculate_batch_size(descriptor: &ShapeDescriptor) -> Result<Dim> {
    first_leaf(descriptor)
        .map(Shape::batch)
        .ok_or_else(|| Error::ShapeInconsistency("bundle has no dense entries".into()))
}

fn first_leaf(descriptor: &ShapeDescriptor) -> Option<&Shape> {
    descriptor.iter().find_map(|(_, shape)| match shape {
        EntryShape::Dense(s) => Some(s),
        EntryShape::Nested(inner) => first_leaf(inner),
        EntryShape::Ragged { .. } | EntryShape::Sparse(_) => None,
    })
}
