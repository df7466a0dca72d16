//! Fan-out blocks whose outputs are unioned into one bundle
//!
//! Key collisions follow the configured [`CollisionPolicy`]. With the
//! default `Overwrite` policy a later block (or branch) silently replaces
//! an earlier one's entry, so argument order decides precedence.

use std::fmt;

use serde_json::{json, Value};
use tracing::trace;

use crate::aggregation::Aggregation;
use crate::block::Block;
use crate::bundle::{BlockValue, CollisionPolicy, TensorBundle};
use crate::error::Result;
use crate::shape::{EntryShape, ShapeDescriptor, ShapeSpec};

/// Optional aggregation shared by [`Merge`] and [`Parallel`]
struct PostAggregation {
    aggregation: Option<Aggregation>,
    block: Option<Box<dyn Block>>,
}

impl PostAggregation {
    fn none() -> Self {
        Self {
            aggregation: None,
            block: None,
        }
    }

    fn set(&mut self, aggregation: Aggregation) -> Result<()> {
        self.block = Some(aggregation.build()?);
        self.aggregation = Some(aggregation);
        Ok(())
    }

    fn apply(&self, outputs: TensorBundle, training: bool) -> Result<BlockValue> {
        match &self.block {
            Some(block) => block.call(BlockValue::Bundle(outputs), training),
            None => Ok(BlockValue::Bundle(outputs)),
        }
    }

    fn apply_shape(&self, shapes: ShapeDescriptor) -> Result<ShapeSpec> {
        let spec = ShapeSpec::Bundle(shapes);
        match &self.block {
            Some(block) => block.output_shape(&spec),
            None => Ok(spec),
        }
    }

    fn config(&self) -> Value {
        json!(self.aggregation)
    }
}

/// Applies every wrapped block to the same input bundle and unions the results
pub struct Merge {
    blocks: Vec<Box<dyn Block>>,
    post: PostAggregation,
    collision: CollisionPolicy,
}

impl Merge {
    /// Merge the outputs of `blocks`, later blocks taking precedence
    pub fn new(blocks: Vec<Box<dyn Block>>) -> Self {
        Self {
            blocks,
            post: PostAggregation::none(),
            collision: CollisionPolicy::default(),
        }
    }

    /// Add one more block, with the highest precedence so far
    #[must_use]
    pub fn merge(mut self, block: impl Block + 'static) -> Self {
        self.blocks.push(Box::new(block));
        self
    }

    /// Aggregate the unioned bundle before returning it
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Result<Self> {
        self.post.set(aggregation)?;
        Ok(self)
    }

    /// Choose how key collisions are handled
    #[must_use]
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision = policy;
        self
    }

    /// Merged blocks in precedence order (last wins)
    pub fn blocks(&self) -> &[Box<dyn Block>] {
        &self.blocks
    }
}

impl Block for Merge {
    fn name(&self) -> &str {
        "merge"
    }

    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue> {
        let inputs = inputs.into_bundle()?;
        let mut outputs = TensorBundle::new();

        for block in &self.blocks {
            trace!(block = block.name(), "merge branch");
            let out = block
                .call(BlockValue::Bundle(inputs.clone()), training)?
                .into_bundle()?;
            outputs.union(out, self.collision)?;
        }

        self.post.apply(outputs, training)
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        input_shape.as_bundle()?;
        let mut shapes = ShapeDescriptor::new();

        for block in &self.blocks {
            let out = block.output_shape(input_shape)?;
            shapes.union(out.as_bundle()?.clone(), self.collision)?;
        }

        self.post.apply_shape(shapes)
    }

    fn config(&self) -> Value {
        json!({
            "merge_layers": self.blocks.iter().map(|b| b.name()).collect::<Vec<_>>(),
            "aggregation": self.post.config(),
            "collision": self.collision,
        })
    }
}

impl fmt::Debug for Merge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merge")
            .field("blocks", &self.blocks)
            .field("aggregation", &self.post.aggregation)
            .field("collision", &self.collision)
            .finish()
    }
}

/// Feeds one input to several named branches.
///
/// A branch returning a tensor contributes it under the branch name; a
/// branch returning a bundle contributes all of its entries.
pub struct Parallel {
    branches: Vec<(String, Box<dyn Block>)>,
    post: PostAggregation,
    collision: CollisionPolicy,
}

impl Parallel {
    /// Create a block with no branches
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            post: PostAggregation::none(),
            collision: CollisionPolicy::default(),
        }
    }

    /// Add a named branch
    #[must_use]
    pub fn branch(mut self, name: impl Into<String>, block: impl Block + 'static) -> Self {
        self.branches.push((name.into(), Box::new(block)));
        self
    }

    /// Aggregate the combined bundle before returning it
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Result<Self> {
        self.post.set(aggregation)?;
        Ok(self)
    }

    /// Choose how key collisions are handled
    #[must_use]
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision = policy;
        self
    }

    /// Branch names in order
    pub fn branch_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.branches.iter().map(|(name, _)| name.as_str())
    }
}

impl Default for Parallel {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for Parallel {
    fn name(&self) -> &str {
        "parallel"
    }

    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue> {
        let mut outputs = TensorBundle::with_capacity(self.branches.len());

        for (name, block) in &self.branches {
            trace!(branch = %name, "parallel branch");
            let out = match block.call(inputs.clone(), training)? {
                BlockValue::Tensor(tensor) => TensorBundle::new().with(name.clone(), tensor),
                BlockValue::Bundle(bundle) => bundle,
            };
            outputs.union(out, self.collision)?;
        }

        self.post.apply(outputs, training)
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let mut shapes = ShapeDescriptor::new();

        for (name, block) in &self.branches {
            let out = match block.output_shape(input_shape)? {
                ShapeSpec::Tensor(shape) => {
                    let mut single = ShapeDescriptor::new();
                    single.insert(name.clone(), EntryShape::Dense(shape));
                    single
                }
                ShapeSpec::Bundle(descriptor) => descriptor,
            };
            shapes.union(out, self.collision)?;
        }

        self.post.apply_shape(shapes)
    }

    fn config(&self) -> Value {
        json!({
            "branches": self.branch_names().collect::<Vec<_>>(),
            "aggregation": self.post.config(),
            "collision": self.collision,
        })
    }
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("branches", &self.branches)
            .field("aggregation", &self.post.aggregation)
            .field("collision", &self.collision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AsTabular;
    use crate::block::BlockExt;
    use crate::error::Error;
    use crate::filter::Filter;
    use crate::shape::Shape;
    use crate::tensor::{tensor_from_vec, Tensor};
    use proptest::prelude::*;

    /// Ignores its input and returns a fixed bundle
    #[derive(Debug)]
    struct Constant(TensorBundle);

    impl Block for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn call(&self, _inputs: BlockValue, _training: bool) -> Result<BlockValue> {
            Ok(BlockValue::Bundle(self.0.clone()))
        }

        fn output_shape(&self, _input_shape: &ShapeSpec) -> Result<ShapeSpec> {
            Ok(ShapeSpec::Bundle(self.0.shape_descriptor()))
        }
    }

    fn filled(fill: f32) -> Tensor {
        tensor_from_vec(vec![fill; 2], &[2, 1]).unwrap()
    }

    fn input() -> TensorBundle {
        TensorBundle::new()
            .with("item_id", filled(1.0))
            .with("user_id", filled(2.0))
    }

    fn block_a() -> Constant {
        Constant(TensorBundle::new().with("x", filled(1.0)))
    }

    fn block_b() -> Constant {
        Constant(TensorBundle::new().with("x", filled(2.0)).with("y", filled(3.0)))
    }

    #[test]
    fn test_later_block_overwrites_earlier() {
        let a_then_b = Merge::new(vec![block_a().boxed(), block_b().boxed()]);
        let out = a_then_b.call(input().into(), false).unwrap().into_bundle().unwrap();
        assert_eq!(out.dense("x").unwrap()[[0, 0]], 2.0);
        assert_eq!(out.dense("y").unwrap()[[0, 0]], 3.0);

        let b_then_a = Merge::new(vec![block_b().boxed()]).merge(block_a());
        let out = b_then_a.call(input().into(), false).unwrap().into_bundle().unwrap();
        assert_eq!(out.dense("x").unwrap()[[0, 0]], 1.0);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_collision_can_fail_loudly() {
        let merge = Merge::new(vec![
            Constant(TensorBundle::new().with("x", filled(1.0))).boxed(),
            Constant(TensorBundle::new().with("x", filled(2.0))).boxed(),
        ])
        .with_collision_policy(CollisionPolicy::Error);

        assert!(matches!(
            merge.call(input().into(), false),
            Err(Error::KeyCollision { key }) if key == "x"
        ));
        assert!(matches!(
            merge.output_shape(&ShapeSpec::Bundle(input().shape_descriptor())),
            Err(Error::KeyCollision { .. })
        ));
    }

    #[test]
    fn test_merge_requires_bundle_input() {
        let merge = Merge::new(vec![Filter::new(["item_id"]).boxed()]);
        assert!(matches!(
            merge.call(filled(0.0).into(), false),
            Err(Error::InvalidInputKind { .. })
        ));
    }

    #[test]
    fn test_merge_with_aggregation() {
        let merge = Merge::new(vec![
            Filter::new(["item_id"]).boxed(),
            Filter::new(["user_id"]).boxed(),
        ])
        .with_aggregation(Aggregation::Concat { axis: -1 })
        .unwrap();

        let out = merge.call(input().into(), false).unwrap().into_tensor().unwrap();
        assert_eq!(out.shape(), &[2, 2]);

        let spec = ShapeSpec::Bundle(
            ShapeDescriptor::new()
                .with_dense("item_id", Shape::with_unknown_batch(&[1]))
                .with_dense("user_id", Shape::with_unknown_batch(&[1])),
        );
        assert_eq!(
            merge.output_shape(&spec).unwrap(),
            ShapeSpec::Tensor(Shape(vec![None, Some(2)]))
        );
    }

    #[test]
    fn test_parallel_names_tensor_branches() {
        let parallel = Parallel::new()
            .branch("item", Filter::new(["item_id"]).then(crate::aggregation::Concat::default()))
            .branch("user", Filter::new(["user_id"]).then(crate::aggregation::Concat::default()))
            .with_aggregation(Aggregation::CosineSimilarity)
            .unwrap();

        let out = parallel.call(input().into(), false).unwrap().into_tensor().unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert!((out[[0, 0]] - 1.0).abs() < 1e-6);

        let spec = ShapeSpec::Bundle(input().shape_descriptor());
        assert_eq!(
            parallel.output_shape(&spec).unwrap(),
            ShapeSpec::Tensor(Shape::known(&[2, 1]))
        );
    }

    #[test]
    fn test_parallel_unions_bundle_branches() {
        let parallel = Parallel::new()
            .branch("ids", Filter::new(["item_id"]))
            .branch("wrapped", crate::aggregation::Concat::default().then(AsTabular::new("all")));

        let out = parallel.call(input().into(), false).unwrap().into_bundle().unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item_id", "all"]);
    }

    #[test]
    fn test_debug_shows_collision_policy() {
        let parallel = Parallel::new()
            .branch("ids", Filter::new(["item_id"]))
            .with_collision_policy(CollisionPolicy::Error);
        let merge = Merge::new(Vec::new()).with_collision_policy(CollisionPolicy::Error);

        assert!(format!("{parallel:?}").contains("collision: Error"));
        assert!(format!("{merge:?}").contains("collision: Error"));
    }

    proptest! {
        #[test]
        fn prop_merge_order_decides_winner(first in -10.0f32..10.0, second in -10.0f32..10.0) {
            let merge = Merge::new(vec![
                Constant(TensorBundle::new().with("x", filled(first))).boxed(),
                Constant(TensorBundle::new().with("x", filled(second))).boxed(),
            ]);
            let out = merge.call(input().into(), false).unwrap().into_bundle().unwrap();
            prop_assert_eq!(out.dense("x").unwrap()[[1, 0]], second);
            prop_assert_eq!(out.len(), 1);
        }
    }
}
