//! The tabular block: pre-filtering, side branches and aggregation around a
//! wrapped transformation
//!
//! Every call runs the same fixed steps:
//!
//! 1. `filter_columns`, when given, becomes the `pre` filter
//! 2. `pre` narrows the inputs
//! 3. the wrapped block runs on the narrowed inputs
//! 4. each `merge_with` block runs on the same narrowed inputs and its bundle
//!    is unioned into the outputs, in order (later blocks win on collisions)
//! 5. the post step is resolved: an explicit `post` block, else
//!    `concat_outputs`, else `stack_outputs`, else the configured aggregation
//! 6. the post step, if any, is applied
//!
//! Shape inference follows the same steps.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::aggregation::{Aggregation, Concat, Stack};
use crate::block::{Block, BlockExt, Sequential};
use crate::bundle::{BlockValue, CollisionPolicy, TensorBundle, TensorValue};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::schema::{Schema, Tag};
use crate::shape::ShapeSpec;

/// Construction-time configuration of a [`TabularBlock`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularConfig {
    /// Aggregation applied after every call unless a call overrides it
    pub aggregation: Option<Aggregation>,

    /// How `merge_with` outputs colliding with the wrapped block's keys are handled
    pub collision: CollisionPolicy,
}

/// Per-call overrides for [`TabularBlock::call_with`]
#[derive(Debug, Default)]
pub struct CallOptions<'a> {
    pre: Option<&'a dyn Block>,
    post: Option<&'a dyn Block>,
    merge_with: Vec<&'a dyn Block>,
    stack_outputs: bool,
    concat_outputs: bool,
    filter_columns: Option<Filter>,
    training: bool,
}

impl<'a> CallOptions<'a> {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `pre` on the inputs first
    #[must_use]
    pub fn pre(mut self, pre: &'a dyn Block) -> Self {
        self.pre = Some(pre);
        self
    }

    /// Replace the post step with `post`
    #[must_use]
    pub fn post(mut self, post: &'a dyn Block) -> Self {
        self.post = Some(post);
        self
    }

    /// Union the output of `block` into the outputs; may be called repeatedly
    #[must_use]
    pub fn merge_with(mut self, block: &'a dyn Block) -> Self {
        self.merge_with.push(block);
        self
    }

    /// Stack the outputs
    #[must_use]
    pub fn stack_outputs(mut self) -> Self {
        self.stack_outputs = true;
        self
    }

    /// Concatenate the outputs
    #[must_use]
    pub fn concat_outputs(mut self) -> Self {
        self.concat_outputs = true;
        self
    }

    /// Keep only these columns before running; replaces any `pre` block
    #[must_use]
    pub fn filter_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        let filter = Filter::new(columns);
        self.filter_columns = (!filter.columns().is_empty()).then_some(filter);
        self
    }

    /// Set the training flag passed to every block
    #[must_use]
    pub fn training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    fn pre_block(&self) -> Option<&dyn Block> {
        match &self.filter_columns {
            Some(filter) => Some(filter as &dyn Block),
            None => self.pre,
        }
    }
}

/// Post step chosen for one call
enum PostOp<'a> {
    Borrowed(&'a dyn Block),
    Owned(Box<dyn Block>),
}

impl PostOp<'_> {
    fn block(&self) -> &dyn Block {
        match self {
            PostOp::Borrowed(block) => *block,
            PostOp::Owned(block) => block.as_ref(),
        }
    }
}

/// Wraps a transformation with filtering, merging and aggregation
pub struct TabularBlock {
    name: String,
    inner: Box<dyn Block>,
    config: TabularConfig,
    aggregation: Option<Box<dyn Block>>,
}

impl TabularBlock {
    /// Wrap `inner` without aggregation
    pub fn new(inner: impl Block + 'static) -> Self {
        Self {
            name: format!("tabular({})", inner.name()),
            inner: Box::new(inner),
            config: TabularConfig::default(),
            aggregation: None,
        }
    }

    /// Wrap `inner` with the given configuration
    pub fn with_config(inner: impl Block + 'static, config: TabularConfig) -> Result<Self> {
        let mut block = Self::new(inner);
        block.set_aggregation(config.aggregation)?;
        block.config.collision = config.collision;
        Ok(block)
    }

    /// Aggregate after every call
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Result<Self> {
        self.set_aggregation(Some(aggregation))?;
        Ok(self)
    }

    /// Change the construction-time aggregation
    pub fn set_aggregation(&mut self, aggregation: Option<Aggregation>) -> Result<()> {
        self.aggregation = aggregation.as_ref().map(Aggregation::build).transpose()?;
        self.config.aggregation = aggregation;
        Ok(())
    }

    /// Rename the block
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current configuration
    pub fn config_struct(&self) -> TabularConfig {
        self.config
    }

    /// The wrapped transformation
    pub fn inner(&self) -> &dyn Block {
        self.inner.as_ref()
    }

    fn resolve_post<'a>(&'a self, options: &CallOptions<'a>) -> Option<PostOp<'a>> {
        if let Some(post) = options.post {
            return Some(PostOp::Borrowed(post));
        }
        if options.concat_outputs {
            return Some(PostOp::Owned(Box::new(Concat::default())));
        }
        if options.stack_outputs {
            return Some(PostOp::Owned(Box::new(Stack)));
        }
        self.aggregation.as_deref().map(PostOp::Borrowed)
    }

    /// Run one forward pass with per-call overrides
    pub fn call_with(&self, inputs: BlockValue, options: &CallOptions<'_>) -> Result<BlockValue> {
        let training = options.training;

        let inputs = match options.pre_block() {
            Some(pre) => pre.call(inputs, training)?,
            None => inputs,
        };

        let merge_inputs = (!options.merge_with.is_empty()).then(|| inputs.clone());
        let mut outputs = self.inner.call(inputs, training)?;

        if let Some(merge_inputs) = merge_inputs {
            let mut bundle = outputs.into_bundle()?;
            for block in &options.merge_with {
                let extra = block.call(merge_inputs.clone(), training)?.into_bundle()?;
                bundle.union(extra, self.config.collision)?;
            }
            outputs = BlockValue::Bundle(bundle);
        }

        match self.resolve_post(options) {
            Some(post) => {
                debug!(block = %self.name, post = post.block().name(), "aggregating outputs");
                post.block().call(outputs, training)
            }
            None => Ok(outputs),
        }
    }

    /// Shape produced by [`TabularBlock::call_with`] with the same overrides
    pub fn output_shape_with(&self, input_shape: &ShapeSpec, options: &CallOptions<'_>) -> Result<ShapeSpec> {
        let input_shape = match options.pre_block() {
            Some(pre) => pre.output_shape(input_shape)?,
            None => input_shape.clone(),
        };

        let mut output_shape = self.inner.output_shape(&input_shape)?;

        if !options.merge_with.is_empty() {
            let mut descriptor = output_shape.as_bundle()?.clone();
            for block in &options.merge_with {
                let extra = block.output_shape(&input_shape)?;
                descriptor.union(extra.as_bundle()?.clone(), self.config.collision)?;
            }
            output_shape = ShapeSpec::Bundle(descriptor);
        }

        match self.resolve_post(options) {
            Some(post) => post.block().output_shape(&output_shape),
            None => Ok(output_shape),
        }
    }

    /// Apply this block separately to every entry of `inputs`.
    ///
    /// Dense entries are passed as tensors and nested bundles as bundles;
    /// each result is stored under the entry's name.
    pub fn apply_to_all(
        &self,
        inputs: TensorBundle,
        columns_to_filter: Option<&Filter>,
        training: bool,
    ) -> Result<TensorBundle> {
        let inputs = match columns_to_filter {
            Some(filter) => filter.split(inputs).0,
            None => inputs,
        };

        let options = CallOptions::new().training(training);
        let mut outputs = TensorBundle::with_capacity(inputs.len());

        for (name, value) in inputs {
            let value = match value {
                TensorValue::Dense(tensor) => BlockValue::Tensor(tensor),
                TensorValue::Nested(bundle) => BlockValue::Bundle(bundle),
                other => {
                    return Err(Error::InvalidInputKind {
                        expected: "dense tensor or nested bundle",
                        got: other.kind(),
                    })
                }
            };
            let out = match self.call_with(value, &options)? {
                BlockValue::Tensor(tensor) => TensorValue::Dense(tensor),
                BlockValue::Bundle(bundle) => TensorValue::Nested(bundle),
            };
            outputs.insert(name, out);
        }

        Ok(outputs)
    }

    /// Feed the schema columns carrying any of `tags` (all columns when
    /// `tags` is empty, minus those carrying `exclude_tags`) into `block`.
    ///
    /// Returns `None` when no column matches; composing that `None` with
    /// [`Sequential::then_opt`] leaves a pipeline unchanged.
    pub fn from_schema(
        schema: &Schema,
        tags: &[Tag],
        exclude_tags: &[Tag],
        block: impl Block + 'static,
    ) -> Option<Sequential> {
        let mut selected = if tags.is_empty() {
            schema.clone()
        } else {
            schema.select_by_tag(tags)
        };
        if !exclude_tags.is_empty() {
            selected = selected.remove_by_tag(exclude_tags);
        }

        if selected.is_empty() {
            debug!(?tags, "no columns selected from schema");
            return None;
        }

        Self::from_features(selected.column_names(), block)
    }

    /// Feed the named features into `block`; `None` when there are none
    pub fn from_features<S: Into<String>>(
        features: impl IntoIterator<Item = S>,
        block: impl Block + 'static,
    ) -> Option<Sequential> {
        let filter = Filter::new(features);
        if filter.columns().is_empty() {
            return None;
        }
        Some(filter.then(block))
    }
}

impl Block for TabularBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue> {
        self.call_with(inputs, &CallOptions::new().training(training))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        self.output_shape_with(input_shape, &CallOptions::new())
    }

    fn config(&self) -> Value {
        json!({
            "inner": { "name": self.inner.name(), "config": self.inner.config() },
            "aggregation": self.config.aggregation,
            "collision": self.config.collision,
        })
    }
}

impl fmt::Debug for TabularBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabularBlock")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .field("aggregation", &self.config.aggregation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AsTabular;
    use crate::block::NoOp;
    use crate::schema::ColumnSchema;
    use crate::shape::{Shape, ShapeDescriptor};
    use crate::tensor::{tensor_from_vec, Tensor};

    fn filled(width: usize, fill: f32) -> Tensor {
        tensor_from_vec(vec![fill; 2 * width], &[2, width]).unwrap()
    }

    fn features() -> TensorBundle {
        TensorBundle::new()
            .with("item_id", filled(1, 1.0))
            .with("item_category", filled(1, 2.0))
            .with("user_age", filled(3, 3.0))
    }

    fn feature_shapes() -> ShapeSpec {
        ShapeSpec::Bundle(
            ShapeDescriptor::new()
                .with_dense("item_id", Shape::with_unknown_batch(&[1]))
                .with_dense("item_category", Shape::with_unknown_batch(&[1]))
                .with_dense("user_age", Shape::with_unknown_batch(&[3])),
        )
    }

    #[test]
    fn test_no_aggregation_passes_outputs_through() {
        let block = TabularBlock::new(NoOp);
        let out = block.call(features().into(), false).unwrap();
        assert_eq!(out, BlockValue::Bundle(features()));
        assert_eq!(block.output_shape(&feature_shapes()).unwrap(), feature_shapes());
    }

    #[test]
    fn test_configured_aggregation_runs_after_every_call() {
        let block = TabularBlock::new(NoOp)
            .with_aggregation(Aggregation::Concat { axis: -1 })
            .unwrap();

        let out = block.call(features().into(), false).unwrap().into_tensor().unwrap();
        assert_eq!(out.shape(), &[2, 5]);
        assert_eq!(
            block.output_shape(&feature_shapes()).unwrap(),
            ShapeSpec::Tensor(Shape(vec![None, Some(5)]))
        );
    }

    #[test]
    fn test_filter_columns_then_stack() {
        let block = TabularBlock::new(NoOp);
        let options = CallOptions::new()
            .filter_columns(["item_id", "item_category"])
            .stack_outputs();

        let out = block
            .call_with(features().into(), &options)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.shape(), &[2, 2, 1]);
        assert_eq!(
            block.output_shape_with(&feature_shapes(), &options).unwrap(),
            ShapeSpec::Tensor(Shape(vec![None, Some(2), Some(1)]))
        );
    }

    #[test]
    fn test_concat_outputs_wins_over_stack_and_configured() {
        let block = TabularBlock::new(NoOp)
            .with_aggregation(Aggregation::Stack)
            .unwrap();
        let options = CallOptions::new().stack_outputs().concat_outputs();

        let out = block
            .call_with(features().into(), &options)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.shape(), &[2, 5]);
    }

    #[test]
    fn test_explicit_post_wins_over_flags() {
        let block = TabularBlock::new(Concat::default());
        let post = AsTabular::new("all");
        let options = CallOptions::new().post(&post).concat_outputs();

        let out = block
            .call_with(features().into(), &options)
            .unwrap()
            .into_bundle()
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["all"]);
    }

    #[test]
    fn test_merge_with_sees_filtered_inputs_and_later_wins() {
        let block = TabularBlock::new(Filter::new(["item_id"]));
        let side = Filter::new(["item_id", "user_age"]);
        let options = CallOptions::new()
            .filter_columns(["item_id", "user_age"])
            .merge_with(&side);

        let out = block
            .call_with(features().into(), &options)
            .unwrap()
            .into_bundle()
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item_id", "user_age"]);

        let shapes = block.output_shape_with(&feature_shapes(), &options).unwrap();
        assert_eq!(
            shapes.as_bundle().unwrap().keys().collect::<Vec<_>>(),
            vec!["item_id", "user_age"]
        );
    }

    #[test]
    fn test_merge_with_can_reject_collisions() {
        let config = TabularConfig {
            aggregation: None,
            collision: CollisionPolicy::Error,
        };
        let block = TabularBlock::with_config(NoOp, config).unwrap();
        let side = Filter::new(["item_id"]);

        let result = block.call_with(features().into(), &CallOptions::new().merge_with(&side));
        assert!(matches!(result, Err(Error::KeyCollision { .. })));
    }

    #[test]
    fn test_merge_with_needs_bundle_outputs() {
        let block = TabularBlock::new(Concat::default());
        let side = Filter::new(["item_id"]);
        let result = block.call_with(features().into(), &CallOptions::new().merge_with(&side));
        assert!(matches!(result, Err(Error::InvalidInputKind { .. })));
    }

    #[test]
    fn test_apply_to_all_maps_over_entries() {
        let block = TabularBlock::new(AsTabular::new("wrapped"));
        let filter = Filter::new(["item_id", "user_age"]);

        let out = block.apply_to_all(features(), Some(&filter), false).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item_id", "user_age"]);
        match out.get("user_age").unwrap() {
            TensorValue::Nested(inner) => {
                assert_eq!(inner.dense("wrapped").unwrap().shape(), &[2, 3]);
            }
            other => panic!("expected nested bundle, got {other:?}"),
        }
    }

    #[test]
    fn test_from_schema_returns_none_for_empty_selection() {
        let schema = Schema::new(vec![
            ColumnSchema::categorical("item_id", 10).with_tags([Tag::Item]),
            ColumnSchema::continuous("position", 1.0, 100.0).with_tags([Tag::Bias]),
        ]);

        assert!(TabularBlock::from_schema(&schema, &[Tag::User], &[], NoOp).is_none());
        assert!(TabularBlock::from_schema(&schema, &[], &[Tag::Item, Tag::Bias], NoOp).is_none());

        let block = TabularBlock::from_schema(&schema, &[], &[Tag::Bias], NoOp).unwrap();
        let out = block.call(features().into(), false).unwrap().into_bundle().unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item_id"]);
    }

    #[test]
    fn test_config_reports_aggregation() {
        let block = TabularBlock::new(NoOp)
            .with_aggregation(Aggregation::Stack)
            .unwrap();
        assert_eq!(block.config()["aggregation"], json!({ "type": "stack" }));
    }
}
