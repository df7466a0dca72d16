//! Aggregators reducing a named bundle to a single tensor
//!
//! Every aggregator walks the bundle in order, descending into nested
//! bundles, and requires dense leaves. Ragged and sparse columns must be
//! converted first (see [`crate::transformations`]).

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::block::Block;
use crate::bundle::{BlockValue, TensorBundle, TensorValue};
use crate::error::{Error, Result};
use crate::shape::{calculate_batch_size, EntryShape, Shape, ShapeDescriptor, ShapeSpec};
use crate::tensor::{flatten_2d, Tensor};

/// Aggregation applied after a tabular block, as configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregation {
    /// Concatenate flattened entries
    Concat {
        /// Axis of the flattened `(batch, features)` view
        axis: isize,
    },
    /// Stack flattened entries along a new axis
    Stack,
    /// Sum entries of identical shape
    ElementwiseSum,
    /// Row-wise cosine similarity of exactly two entries
    CosineSimilarity,
}

impl Aggregation {
    /// Instantiate the aggregator block
    pub fn build(&self) -> Result<Box<dyn Block>> {
        Ok(match *self {
            Aggregation::Concat { axis } => Box::new(Concat::new(axis)?),
            Aggregation::Stack => Box::new(Stack),
            Aggregation::ElementwiseSum => Box::new(ElementwiseSum),
            Aggregation::CosineSimilarity => Box::new(CosineSimilarity),
        })
    }
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "concat" => Ok(Aggregation::Concat { axis: -1 }),
            "stack" => Ok(Aggregation::Stack),
            "sum" | "element-wise-sum" | "elementwise-sum" => Ok(Aggregation::ElementwiseSum),
            "cosine" | "cosine-similarity" => Ok(Aggregation::CosineSimilarity),
            other => Err(Error::InvalidConfig(format!("unknown aggregation '{other}'"))),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Concat { axis } => write!(f, "concat(axis={axis})"),
            Aggregation::Stack => write!(f, "stack"),
            Aggregation::ElementwiseSum => write!(f, "element-wise-sum"),
            Aggregation::CosineSimilarity => write!(f, "cosine"),
        }
    }
}

fn collect_leaves<'a>(bundle: &'a TensorBundle, out: &mut Vec<&'a Tensor>) -> Result<()> {
    for (_, value) in bundle.iter() {
        match value {
            TensorValue::Dense(t) => out.push(t),
            TensorValue::Nested(inner) => collect_leaves(inner, out)?,
            other => {
                return Err(Error::InvalidInputKind {
                    expected: "dense tensor",
                    got: other.kind(),
                })
            }
        }
    }
    Ok(())
}

/// Dense leaves of the bundle in `inputs`, flattened to `(batch, features)`
fn flattened_leaves(inputs: BlockValue) -> Result<Vec<Array2<f32>>> {
    let bundle = inputs.into_bundle()?;
    let mut leaves = Vec::with_capacity(bundle.len());
    collect_leaves(&bundle, &mut leaves)?;

    if leaves.is_empty() {
        return Err(Error::ShapeInconsistency(
            "cannot aggregate an empty bundle".into(),
        ));
    }

    leaves.into_iter().map(flatten_2d).collect()
}

fn collect_leaf_shapes<'a>(descriptor: &'a ShapeDescriptor, out: &mut Vec<&'a Shape>) -> Result<()> {
    for (_, shape) in descriptor.iter() {
        match shape {
            EntryShape::Dense(s) => out.push(s),
            EntryShape::Nested(inner) => collect_leaf_shapes(inner, out)?,
            EntryShape::Ragged { .. } => {
                return Err(Error::InvalidInputKind {
                    expected: "dense tensor",
                    got: "ragged tensor",
                })
            }
            EntryShape::Sparse(_) => {
                return Err(Error::InvalidInputKind {
                    expected: "dense tensor",
                    got: "sparse tensor",
                })
            }
        }
    }
    Ok(())
}

fn leaf_shapes(input_shape: &ShapeSpec) -> Result<(&ShapeDescriptor, Vec<&Shape>)> {
    let descriptor = input_shape.as_bundle()?;
    let mut shapes = Vec::with_capacity(descriptor.len());
    collect_leaf_shapes(descriptor, &mut shapes)?;
    if shapes.is_empty() {
        return Err(Error::ShapeInconsistency(
            "cannot aggregate an empty bundle".into(),
        ));
    }
    Ok((descriptor, shapes))
}

fn into_tensor(array: Array2<f32>) -> BlockValue {
    BlockValue::Tensor(array.into_dyn().into_shared())
}

/// Concatenates the flattened entries of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concat {
    axis: isize,
}

impl Concat {
    /// Concatenate along `axis` of the flattened 2-D view (`-1`/`1` features, `0` batch)
    pub fn new(axis: isize) -> Result<Self> {
        match axis {
            -2..=1 => Ok(Self { axis }),
            _ => Err(Error::InvalidConfig(format!(
                "concat axis {axis} is out of range for flattened (batch, features) tensors"
            ))),
        }
    }

    fn resolved_axis(self) -> usize {
        if self.axis == 0 || self.axis == -2 {
            0
        } else {
            1
        }
    }
}

impl Default for Concat {
    fn default() -> Self {
        Self { axis: -1 }
    }
}

impl Block for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let leaves = flattened_leaves(inputs)?;
        let views: Vec<ArrayView2<'_, f32>> = leaves.iter().map(Array2::view).collect();
        let joined = ndarray::concatenate(Axis(self.resolved_axis()), &views)
            .map_err(|e| Error::ShapeInconsistency(format!("cannot concatenate entries: {e}")))?;
        Ok(into_tensor(joined))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let (descriptor, shapes) = leaf_shapes(input_shape)?;

        let shape = if self.resolved_axis() == 1 {
            descriptor.validate_batch()?;
            let batch = calculate_batch_size(descriptor)?;
            let width = shapes
                .iter()
                .try_fold(0usize, |acc, s| s.flat_width().map(|w| acc + w));
            Shape(vec![batch, width])
        } else {
            let batch = shapes
                .iter()
                .try_fold(0usize, |acc, s| s.batch().map(|b| acc + b));
            Shape(vec![batch, shapes[0].flat_width()])
        };

        Ok(ShapeSpec::Tensor(shape))
    }

    fn config(&self) -> Value {
        json!({ "axis": self.axis })
    }
}

/// Stacks flattened entries into `(batch, entries, features)`.
///
/// Entries must share one feature width; a mismatch is reported when the
/// block runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stack;

impl Block for Stack {
    fn name(&self) -> &str {
        "stack"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let leaves = flattened_leaves(inputs)?;
        let views: Vec<ArrayView2<'_, f32>> = leaves.iter().map(Array2::view).collect();
        let stacked = ndarray::stack(Axis(1), &views)
            .map_err(|e| Error::ShapeInconsistency(format!("cannot stack entries: {e}")))?;
        Ok(BlockValue::Tensor(stacked.into_dyn().into_shared()))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let (descriptor, shapes) = leaf_shapes(input_shape)?;
        descriptor.validate_batch()?;
        let batch = calculate_batch_size(descriptor)?;

        Ok(ShapeSpec::Tensor(Shape(vec![
            batch,
            Some(shapes.len()),
            shapes[0].flat_width(),
        ])))
    }
}

/// Sums entries that all have the same shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementwiseSum;

impl Block for ElementwiseSum {
    fn name(&self) -> &str {
        "element_wise_sum"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let bundle = inputs.into_bundle()?;
        let mut leaves = Vec::with_capacity(bundle.len());
        collect_leaves(&bundle, &mut leaves)?;

        let Some((&first, rest)) = leaves.split_first() else {
            return Err(Error::ShapeInconsistency(
                "cannot aggregate an empty bundle".into(),
            ));
        };

        let mut total = first.to_owned();
        for leaf in rest {
            if leaf.shape() != total.shape() {
                return Err(Error::ShapeInconsistency(format!(
                    "cannot sum entries of shapes {:?} and {:?}",
                    total.shape(),
                    leaf.shape()
                )));
            }
            total += *leaf;
        }

        Ok(BlockValue::Tensor(total.into_shared()))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let (descriptor, shapes) = leaf_shapes(input_shape)?;
        descriptor.validate_batch()?;
        let first = shapes[0];
        if let Some(other) = shapes.iter().find(|s| !s.compatible_with(first)) {
            return Err(Error::ShapeInconsistency(format!(
                "cannot sum entries of shapes {first} and {other}"
            )));
        }
        Ok(ShapeSpec::Tensor(first.clone()))
    }
}

/// Row-wise cosine similarity between exactly two entries, shaped `(batch, 1)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CosineSimilarity;

impl Block for CosineSimilarity {
    fn name(&self) -> &str {
        "cosine_similarity"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let leaves = flattened_leaves(inputs)?;
        let [left, right] = leaves.as_slice() else {
            return Err(Error::ShapeInconsistency(format!(
                "cosine similarity needs exactly two entries, got {}",
                leaves.len()
            )));
        };
        if left.shape() != right.shape() {
            return Err(Error::ShapeInconsistency(format!(
                "cannot compare entries of shapes {:?} and {:?}",
                left.shape(),
                right.shape()
            )));
        }

        let mut out = Array2::<f32>::zeros((left.nrows(), 1));
        for (i, (a, b)) in left.outer_iter().zip(right.outer_iter()).enumerate() {
            let norm = a.dot(&a).sqrt() * b.dot(&b).sqrt();
            out[[i, 0]] = if norm > f32::EPSILON { a.dot(&b) / norm } else { 0.0 };
        }

        Ok(into_tensor(out))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let (descriptor, shapes) = leaf_shapes(input_shape)?;
        if shapes.len() != 2 {
            return Err(Error::ShapeInconsistency(format!(
                "cosine similarity needs exactly two entries, got {}",
                shapes.len()
            )));
        }
        if let (Some(left), Some(right)) = (shapes[0].flat_width(), shapes[1].flat_width()) {
            if left != right {
                return Err(Error::ShapeInconsistency(format!(
                    "cannot compare entries of widths {left} and {right}"
                )));
            }
        }
        descriptor.validate_batch()?;
        let batch = calculate_batch_size(descriptor)?;
        Ok(ShapeSpec::Tensor(Shape(vec![batch, Some(1)])))
    }
}

/// Wraps a single tensor as a one-entry bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsTabular {
    output_name: String,
}

impl AsTabular {
    /// Name the tensor `output_name`
    pub fn new(output_name: impl Into<String>) -> Self {
        Self {
            output_name: output_name.into(),
        }
    }

    /// Name given to the wrapped tensor
    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

impl Block for AsTabular {
    fn name(&self) -> &str {
        "as_tabular"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let tensor = inputs.into_tensor()?;
        Ok(BlockValue::Bundle(
            TensorBundle::new().with(self.output_name.clone(), tensor),
        ))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let shape = input_shape.as_tensor()?.clone();
        Ok(ShapeSpec::Bundle(
            ShapeDescriptor::new().with_dense(self.output_name.clone(), shape),
        ))
    }

    fn config(&self) -> Value {
        json!({ "output_name": self.output_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{tensor_from_vec, RaggedTensor};
    use test_case::test_case;

    fn filled(batch: usize, width: usize, fill: f32) -> Tensor {
        tensor_from_vec(vec![fill; batch * width], &[batch, width]).unwrap()
    }

    #[test]
    fn test_concat_widths_add_up() {
        let bundle = TensorBundle::new()
            .with("a", filled(3, 4, 1.0))
            .with("b", filled(3, 6, 2.0));
        let spec = bundle.shape_descriptor();

        let out = Concat::default()
            .call(bundle.into(), false)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.shape(), &[3, 10]);
        assert_eq!(out[[0, 3]], 1.0);
        assert_eq!(out[[0, 4]], 2.0);

        let inferred = Concat::default()
            .output_shape(&ShapeSpec::Bundle(spec))
            .unwrap();
        assert_eq!(inferred, ShapeSpec::Tensor(Shape::known(&[3, 10])));
    }

    #[test]
    fn test_concat_flattens_higher_rank_entries() {
        let cube = tensor_from_vec(vec![0.0; 2 * 2 * 3], &[2, 2, 3]).unwrap();
        let bundle = TensorBundle::new()
            .with("seq", cube)
            .with("nested", TensorBundle::new().with("x", filled(2, 1, 0.0)));

        let out = Concat::default()
            .call(bundle.into(), false)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.shape(), &[2, 7]);
    }

    #[test]
    fn test_concat_shape_keeps_unknown_batch() {
        let descriptor = ShapeDescriptor::new()
            .with_dense("a", Shape::with_unknown_batch(&[4]))
            .with_dense("b", Shape::with_unknown_batch(&[6]));
        let inferred = Concat::default()
            .output_shape(&ShapeSpec::Bundle(descriptor))
            .unwrap();
        assert_eq!(inferred, ShapeSpec::Tensor(Shape(vec![None, Some(10)])));
    }

    #[test]
    fn test_concat_rejects_out_of_range_axis() {
        assert!(matches!(Concat::new(2), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_stack_equal_widths() {
        let bundle = TensorBundle::new()
            .with("a", filled(5, 8, 1.0))
            .with("b", filled(5, 8, 2.0));
        let spec = ShapeSpec::Bundle(bundle.shape_descriptor());

        let out = Stack.call(bundle.into(), false).unwrap().into_tensor().unwrap();
        assert_eq!(out.shape(), &[5, 2, 8]);
        assert_eq!(out[[0, 1, 0]], 2.0);
        assert_eq!(
            Stack.output_shape(&spec).unwrap(),
            ShapeSpec::Tensor(Shape::known(&[5, 2, 8]))
        );
    }

    #[test]
    fn test_stack_unequal_widths_is_a_shape_error() {
        let bundle = TensorBundle::new()
            .with("a", filled(5, 8, 1.0))
            .with("b", filled(5, 4, 2.0));
        assert!(matches!(
            Stack.call(bundle.into(), false),
            Err(Error::ShapeInconsistency(_))
        ));
    }

    #[test_case(Box::new(Concat::default()) ; "concat")]
    #[test_case(Box::new(Stack) ; "stack")]
    #[test_case(Box::new(ElementwiseSum) ; "sum")]
    #[test_case(Box::new(CosineSimilarity) ; "cosine")]
    fn test_aggregators_reject_bare_tensor(block: Box<dyn Block>) {
        let err = block.call(filled(2, 2, 0.0).into(), false).unwrap_err();
        assert!(matches!(err, Error::InvalidInputKind { expected: "bundle", .. }));
    }

    #[test]
    fn test_aggregators_reject_ragged_entries() {
        let bundle = TensorBundle::new()
            .with("a", filled(2, 2, 0.0))
            .with("genres", RaggedTensor::from_rows(&[vec![1.0], vec![2.0]]));
        assert!(matches!(
            Concat::default().call(bundle.into(), false),
            Err(Error::InvalidInputKind { got: "ragged tensor", .. })
        ));
    }

    #[test]
    fn test_elementwise_sum() {
        let bundle = TensorBundle::new()
            .with("a", filled(2, 3, 1.0))
            .with("b", filled(2, 3, 2.5));
        let out = ElementwiseSum
            .call(bundle.into(), false)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert!(out.iter().all(|&v| (v - 3.5).abs() < 1e-6));
    }

    #[test]
    fn test_shape_inference_rejects_what_call_rejects() {
        let bundle = TensorBundle::new()
            .with("a", filled(2, 2, 1.0))
            .with("b", filled(2, 3, 1.0));
        let spec = ShapeSpec::Bundle(bundle.shape_descriptor());

        let blocks: [Box<dyn Block>; 2] = [Box::new(ElementwiseSum), Box::new(CosineSimilarity)];
        for block in blocks {
            assert!(block.call(bundle.clone().into(), false).is_err());
            assert!(matches!(
                block.output_shape(&spec),
                Err(Error::ShapeInconsistency(_))
            ));
        }

        let unknown_batch = ShapeSpec::Bundle(
            ShapeDescriptor::new()
                .with_dense("a", Shape::with_unknown_batch(&[3]))
                .with_dense("b", Shape::known(&[2, 3])),
        );
        assert_eq!(
            ElementwiseSum.output_shape(&unknown_batch).unwrap(),
            ShapeSpec::Tensor(Shape::with_unknown_batch(&[3]))
        );
    }

    #[test]
    fn test_cosine_similarity() {
        let user = tensor_from_vec(vec![1.0, 0.0, 1.0, 1.0], &[2, 2]).unwrap();
        let item = tensor_from_vec(vec![1.0, 0.0, -1.0, -1.0], &[2, 2]).unwrap();
        let bundle = TensorBundle::new().with("user", user).with("item", item);

        let out = CosineSimilarity
            .call(bundle.into(), false)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert!((out[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((out[[1, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_as_tabular() {
        let tensor = filled(2, 4, 1.0);
        let out = AsTabular::new("user")
            .call(tensor.clone().into(), false)
            .unwrap()
            .into_bundle()
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["user"]);
        assert_eq!(out.dense("user"), Some(&tensor));

        let bundle = TensorBundle::new().with("user", tensor);
        assert!(matches!(
            AsTabular::new("user").call(bundle.into(), false),
            Err(Error::InvalidInputKind { expected: "tensor", .. })
        ));
    }

    #[test_case("concat", Aggregation::Concat { axis: -1 })]
    #[test_case("Stack", Aggregation::Stack)]
    #[test_case("element-wise-sum", Aggregation::ElementwiseSum)]
    #[test_case("cosine", Aggregation::CosineSimilarity)]
    fn test_aggregation_from_str(name: &str, expected: Aggregation) {
        assert_eq!(name.parse::<Aggregation>().unwrap(), expected);
    }

    #[test]
    fn test_aggregation_config_round_trips_through_json() {
        let config = serde_json::to_value(Aggregation::Concat { axis: 1 }).unwrap();
        assert_eq!(config, json!({ "type": "concat", "axis": 1 }));
        assert!("mean".parse::<Aggregation>().is_err());
    }
}
