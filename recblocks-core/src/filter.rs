//! Column selection over named bundles

use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::block::Block;
use crate::bundle::{BlockValue, TensorBundle};
use crate::error::Result;
use crate::schema::Schema;
use crate::shape::ShapeSpec;

/// Selects the entries of a bundle whose names are in a fixed column set.
///
/// Names missing from the bundle are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    columns: BTreeSet<String>,
}

impl Filter {
    /// Create a filter over the given column names
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a filter selecting every column of `schema`
    pub fn from_schema(schema: &Schema) -> Self {
        Self::new(schema.column_names())
    }

    /// Selected column names
    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// Whether `name` is selected
    pub fn selects(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Selected entries, leaving the input untouched
    pub fn select(&self, bundle: &TensorBundle) -> TensorBundle {
        bundle
            .iter()
            .filter(|(name, _)| self.selects(name))
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }

    /// Split a bundle into `(selected, remainder)`, both in original order
    pub fn split(&self, bundle: TensorBundle) -> (TensorBundle, TensorBundle) {
        bundle.partition(|name| self.selects(name))
    }

    /// Remove the selected entries from `bundle` and return them
    pub fn take_from(&self, bundle: &mut TensorBundle) -> TensorBundle {
        let (selected, remainder) = self.split(std::mem::take(bundle));
        *bundle = remainder;
        selected
    }
}

impl Block for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        let (selected, _) = self.split(inputs.into_bundle()?);
        Ok(BlockValue::Bundle(selected))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let descriptor = input_shape.as_bundle()?.clone();
        Ok(ShapeSpec::Bundle(
            descriptor.retain_keys(|name| self.selects(name)),
        ))
    }

    fn config(&self) -> Value {
        json!({ "columns": self.columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::shape::{Shape, ShapeDescriptor};
    use crate::tensor::tensor_from_vec;
    use proptest::prelude::*;

    fn bundle_of(names: &[String]) -> TensorBundle {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                #[allow(clippy::cast_precision_loss)]
                let fill = i as f32;
                (name.clone(), tensor_from_vec(vec![fill; 2], &[2, 1]).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_filter_rejects_bare_tensor() {
        let tensor = tensor_from_vec(vec![0.0; 2], &[2, 1]).unwrap();
        let err = Filter::new(["a"]).call(tensor.into(), false).unwrap_err();
        assert!(matches!(err, Error::InvalidInputKind { .. }));
    }

    #[test]
    fn test_take_from_removes_selected_keys() {
        let mut bundle = bundle_of(&["a".into(), "b".into(), "c".into()]);
        let selected = Filter::new(["a", "c", "missing"]).take_from(&mut bundle);

        assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(bundle.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_output_shape_restricts_descriptor() {
        let descriptor = ShapeDescriptor::new()
            .with_dense("item_id", Shape::with_unknown_batch(&[1]))
            .with_dense("user_id", Shape::with_unknown_batch(&[1]));
        let out = Filter::new(["item_id"])
            .output_shape(&ShapeSpec::Bundle(descriptor))
            .unwrap();

        let out = out.as_bundle().unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item_id"]);
    }

    proptest! {
        #[test]
        fn prop_select_returns_exactly_the_named_entries(
            names in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
            wanted in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let bundle = bundle_of(&names);
            let filter = Filter::new(wanted.iter().cloned());

            let selected = filter.select(&bundle);
            for name in &names {
                prop_assert_eq!(selected.contains_key(name), wanted.contains(name));
            }
            prop_assert_eq!(bundle.len(), names.len());
        }

        #[test]
        fn prop_take_from_leaves_no_selected_key(
            names in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
            wanted in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let mut bundle = bundle_of(&names);
            let filter = Filter::new(wanted.iter().cloned());

            let selected = filter.take_from(&mut bundle);
            prop_assert!(bundle.keys().all(|k| !wanted.contains(k)));
            prop_assert_eq!(selected.len() + bundle.len(), names.len());
        }
    }
}
