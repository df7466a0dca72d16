//! Conversions of multi-valued columns into forms the aggregators accept

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::trace;

use crate::block::Block;
use crate::bundle::{BlockValue, TensorBundle, TensorValue};
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::shape::{EntryShape, Shape, ShapeDescriptor, ShapeSpec};

/// Pads ragged entries with zeros into dense `(batch, max_len)` tensors.
///
/// The width of each column comes from its configured maximum length, usually
/// the schema's value count, or from the longest row in the batch otherwise.
/// Sparse entries are densified as they are; everything else passes through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsDenseFeatures {
    max_lengths: HashMap<String, usize>,
}

impl AsDenseFeatures {
    /// Pad every ragged column to its longest row
    pub fn new() -> Self {
        Self::default()
    }

    /// Pad multi-valued columns to the maximum value count recorded in `schema`
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            max_lengths: schema.max_value_counts(),
        }
    }

    /// Fix the padded width of one column
    #[must_use]
    pub fn with_max_len(mut self, name: impl Into<String>, max_len: usize) -> Self {
        self.max_lengths.insert(name.into(), max_len);
        self
    }

    fn convert(&self, bundle: TensorBundle) -> TensorBundle {
        bundle
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    TensorValue::Ragged(ragged) => {
                        let max_len = self.max_lengths.get(&name).copied();
                        trace!(column = %name, ?max_len, "padding ragged column");
                        TensorValue::Dense(ragged.to_dense(max_len))
                    }
                    TensorValue::Sparse(sparse) => TensorValue::Dense(sparse.to_dense()),
                    TensorValue::Nested(inner) => TensorValue::Nested(self.convert(inner)),
                    dense @ TensorValue::Dense(_) => dense,
                };
                (name, value)
            })
            .collect()
    }

    fn convert_shape(&self, descriptor: &ShapeDescriptor) -> ShapeDescriptor {
        descriptor
            .iter()
            .map(|(name, shape)| {
                let shape = match shape {
                    EntryShape::Ragged { batch, max_len } => {
                        let width = self.max_lengths.get(name).copied().or(*max_len);
                        EntryShape::Dense(Shape(vec![*batch, width]))
                    }
                    EntryShape::Sparse(s) => EntryShape::Dense(s.clone()),
                    EntryShape::Nested(inner) => EntryShape::Nested(self.convert_shape(inner)),
                    other @ EntryShape::Dense(_) => other.clone(),
                };
                (name.to_string(), shape)
            })
            .collect()
    }
}

impl Block for AsDenseFeatures {
    fn name(&self) -> &str {
        "as_dense_features"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        Ok(BlockValue::Bundle(self.convert(inputs.into_bundle()?)))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        Ok(ShapeSpec::Bundle(self.convert_shape(input_shape.as_bundle()?)))
    }

    fn config(&self) -> Value {
        let mut max_lengths: Vec<_> = self.max_lengths.iter().collect();
        max_lengths.sort();
        json!({ "max_lengths": max_lengths })
    }
}

/// Converts ragged entries into COO sparse tensors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsSparseFeatures;

fn sparsify(bundle: TensorBundle) -> TensorBundle {
    bundle
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                TensorValue::Ragged(ragged) => TensorValue::Sparse(ragged.to_sparse()),
                TensorValue::Nested(inner) => TensorValue::Nested(sparsify(inner)),
                other => other,
            };
            (name, value)
        })
        .collect()
}

fn sparsify_shape(descriptor: &ShapeDescriptor) -> ShapeDescriptor {
    descriptor
        .iter()
        .map(|(name, shape)| {
            let shape = match shape {
                EntryShape::Ragged { batch, max_len } => EntryShape::Sparse(Shape(vec![*batch, *max_len])),
                EntryShape::Nested(inner) => EntryShape::Nested(sparsify_shape(inner)),
                other => other.clone(),
            };
            (name.to_string(), shape)
        })
        .collect()
}

impl Block for AsSparseFeatures {
    fn name(&self) -> &str {
        "as_sparse_features"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        Ok(BlockValue::Bundle(sparsify(inputs.into_bundle()?)))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        Ok(ShapeSpec::Bundle(sparsify_shape(input_shape.as_bundle()?)))
    }
}

const TOKENS_SUFFIX: &str = "/tokens";
const ATTENTION_MASK_SUFFIX: &str = "/attention_mask";

/// Which half of a tokenized text column an entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextPart {
    Tokens,
    AttentionMask,
}

fn split_text_column(name: &str) -> Option<(&str, TextPart)> {
    if let Some(column) = name.strip_suffix(TOKENS_SUFFIX) {
        return Some((column, TextPart::Tokens));
    }
    name.strip_suffix(ATTENTION_MASK_SUFFIX)
        .map(|column| (column, TextPart::AttentionMask))
}

/// Pairs ragged `<col>/tokens` and `<col>/attention_mask` entries into
/// nested `{col: {input_ids, attention_mask}}` bundles.
///
/// Only tokenized text columns are kept. Both halves of a column must be
/// present. Rows are padded with zeros to `max_text_length` (or to the
/// longest row when it is unset), and shape inference needs it to be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseTokenizedText {
    max_text_length: Option<usize>,
}

impl ParseTokenizedText {
    /// Pad every text column to its longest row
    pub fn new() -> Self {
        Self::default()
    }

    /// Pad (or truncate) every text column to `max_text_length` tokens
    #[must_use]
    pub fn with_max_text_length(mut self, max_text_length: usize) -> Self {
        self.max_text_length = Some(max_text_length);
        self
    }

    /// Configured text length
    pub fn max_text_length(&self) -> Option<usize> {
        self.max_text_length
    }
}

/// Text columns in first-seen order
fn text_columns<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for (column, _) in names.filter_map(split_text_column) {
        if !columns.iter().any(|c| c == column) {
            columns.push(column.to_string());
        }
    }
    columns
}

impl Block for ParseTokenizedText {
    fn name(&self) -> &str {
        "parse_tokenized_text"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let mut bundle = inputs.into_bundle()?;
        let columns = text_columns(
            bundle
                .iter()
                .filter(|(_, value)| matches!(value, TensorValue::Ragged(_)))
                .map(|(name, _)| name),
        );

        let mut outputs = TensorBundle::with_capacity(columns.len());
        for column in columns {
            let mut take = |suffix: &str| {
                let key = format!("{column}{suffix}");
                match bundle.remove(&key) {
                    Some(TensorValue::Ragged(ragged)) => Ok(ragged.to_dense(self.max_text_length)),
                    _ => Err(Error::MissingColumn(key)),
                }
            };
            let input_ids = take(TOKENS_SUFFIX)?;
            let attention_mask = take(ATTENTION_MASK_SUFFIX)?;

            trace!(column = %column, width = input_ids.shape()[1], "parsed tokenized text");
            outputs.insert(
                column,
                TensorBundle::new()
                    .with("input_ids", input_ids)
                    .with("attention_mask", attention_mask),
            );
        }

        Ok(BlockValue::Bundle(outputs))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let descriptor = input_shape.as_bundle()?;
        let max_text_length = self.max_text_length.ok_or_else(|| {
            Error::InvalidConfig("max_text_length is required to infer text shapes".into())
        })?;
        let batch = descriptor.validate_batch()?;

        let text_shape = Shape(vec![batch, Some(max_text_length)]);
        let columns = text_columns(
            descriptor
                .iter()
                .filter(|(_, shape)| matches!(shape, EntryShape::Ragged { .. }))
                .map(|(name, _)| name),
        );

        Ok(ShapeSpec::Bundle(
            columns
                .into_iter()
                .map(|column| {
                    let nested = ShapeDescriptor::new()
                        .with_dense("input_ids", text_shape.clone())
                        .with_dense("attention_mask", text_shape.clone());
                    (column, EntryShape::Nested(nested))
                })
                .collect(),
        ))
    }

    fn config(&self) -> Value {
        json!({ "max_text_length": self.max_text_length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Concat;
    use crate::block::BlockExt;
    use crate::schema::{ColumnSchema, Tag};
    use crate::tensor::{tensor_from_vec, RaggedTensor};

    fn features() -> TensorBundle {
        TensorBundle::new()
            .with("item_genres", RaggedTensor::from_rows(&[vec![1.0, 2.0], vec![3.0]]))
            .with("user_age", tensor_from_vec(vec![20.0, 30.0], &[2, 1]).unwrap())
    }

    fn tokenized() -> TensorBundle {
        TensorBundle::new()
            .with("user_age", tensor_from_vec(vec![20.0, 30.0], &[2, 1]).unwrap())
            .with("review/tokens", RaggedTensor::from_rows(&[vec![101.0, 7.0, 102.0], vec![101.0, 102.0]]))
            .with("review/attention_mask", RaggedTensor::from_rows(&[vec![1.0, 1.0, 1.0], vec![1.0, 1.0]]))
    }

    #[test]
    fn test_tokenized_text_pairs_into_nested_bundle() {
        let out = ParseTokenizedText::new()
            .with_max_text_length(4)
            .call(tokenized().into(), false)
            .unwrap()
            .into_bundle()
            .unwrap();

        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["review"]);
        let TensorValue::Nested(review) = out.get("review").unwrap() else {
            panic!("expected nested bundle");
        };
        assert_eq!(review.keys().collect::<Vec<_>>(), vec!["input_ids", "attention_mask"]);

        let ids = review.dense("input_ids").unwrap();
        assert_eq!(ids.shape(), &[2, 4]);
        assert_eq!(
            ids.iter().copied().collect::<Vec<_>>(),
            vec![101.0, 7.0, 102.0, 0.0, 101.0, 102.0, 0.0, 0.0]
        );
        assert_eq!(review.dense("attention_mask").unwrap().sum(), 5.0);
    }

    #[test]
    fn test_tokenized_text_needs_both_halves() {
        let mut inputs = tokenized();
        inputs.remove("review/attention_mask");

        let err = ParseTokenizedText::new().call(inputs.into(), false).unwrap_err();
        assert!(matches!(err, Error::MissingColumn(name) if name == "review/attention_mask"));
    }

    #[test]
    fn test_tokenized_text_shape_needs_max_length() {
        let spec = ShapeSpec::Bundle(tokenized().shape_descriptor());
        assert!(matches!(
            ParseTokenizedText::new().output_shape(&spec),
            Err(Error::InvalidConfig(_))
        ));

        let shape = ParseTokenizedText::new()
            .with_max_text_length(16)
            .output_shape(&spec)
            .unwrap();
        let expected = ShapeDescriptor::new()
            .with_dense("input_ids", Shape::known(&[2, 16]))
            .with_dense("attention_mask", Shape::known(&[2, 16]));
        assert_eq!(
            shape.as_bundle().unwrap().get("review"),
            Some(&EntryShape::Nested(expected))
        );
        assert_eq!(shape.as_bundle().unwrap().len(), 1);
    }

    #[test]
    fn test_pads_to_longest_row() {
        let out = AsDenseFeatures::new()
            .call(features().into(), false)
            .unwrap()
            .into_bundle()
            .unwrap();

        let genres = out.dense("item_genres").unwrap();
        assert_eq!(genres.shape(), &[2, 2]);
        assert_eq!(genres.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(out.dense("user_age").unwrap().shape(), &[2, 1]);
    }

    #[test]
    fn test_pads_to_schema_value_count() {
        let schema = Schema::new(vec![ColumnSchema::categorical("item_genres", 100)
            .with_tags([Tag::Item])
            .with_value_count(1, 4)]);
        let block = AsDenseFeatures::from_schema(&schema);

        let out = block.call(features().into(), false).unwrap().into_bundle().unwrap();
        assert_eq!(out.dense("item_genres").unwrap().shape(), &[2, 4]);

        let shape = block
            .output_shape(&ShapeSpec::Bundle(features().shape_descriptor()))
            .unwrap();
        assert_eq!(
            shape.as_bundle().unwrap().get("item_genres"),
            Some(&EntryShape::Dense(Shape(vec![Some(2), Some(4)])))
        );
    }

    #[test]
    fn test_dense_features_can_be_concatenated() {
        let pipeline = AsDenseFeatures::new().then(Concat::default());
        let out = pipeline.call(features().into(), false).unwrap().into_tensor().unwrap();
        assert_eq!(out.shape(), &[2, 3]);
    }

    #[test]
    fn test_sparse_features() {
        let out = AsSparseFeatures
            .call(features().into(), false)
            .unwrap()
            .into_bundle()
            .unwrap();

        match out.get("item_genres").unwrap() {
            TensorValue::Sparse(sparse) => {
                assert_eq!(sparse.nnz(), 3);
                assert_eq!(sparse.dense_shape(), [2, 2]);
            }
            other => panic!("expected sparse tensor, got {other:?}"),
        }

        let shape = AsSparseFeatures
            .output_shape(&ShapeSpec::Bundle(features().shape_descriptor()))
            .unwrap();
        assert_eq!(
            shape.as_bundle().unwrap().get("item_genres"),
            Some(&EntryShape::Sparse(Shape::known(&[2, 2])))
        );
    }
}
