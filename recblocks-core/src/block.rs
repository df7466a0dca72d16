//! Block trait and sequential composition

use std::fmt;

use serde_json::{json, Value};
use tracing::trace;

use crate::bundle::BlockValue;
use crate::error::Result;
use crate::shape::ShapeSpec;

/// A transformation over bundles or tensors with static shape inference.
///
/// Blocks are built once while assembling a model and are immutable
/// afterwards; trainable parameters inside them belong to the training loop.
pub trait Block: fmt::Debug + Send + Sync {
    /// Name shown when a pipeline is listed
    fn name(&self) -> &str;

    /// Run the block on one batch
    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue>;

    /// Shape produced for inputs of the given shape
    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec>;

    /// Construction parameters, for introspection
    fn config(&self) -> Value {
        json!({})
    }

    /// Access this block as a chain, if it is one.
    ///
    /// Only [`Sequential`] overrides this; composition uses it to keep
    /// pipelines flat.
    fn as_sequential_mut(&mut self) -> Option<&mut Sequential> {
        None
    }
}

/// Push `block` onto `out`, splicing in its steps if it is a chain
fn flatten_into(mut block: Box<dyn Block>, out: &mut Vec<Box<dyn Block>>) {
    match block.as_sequential_mut() {
        Some(chain) => out.append(&mut chain.blocks),
        None => out.push(block),
    }
}

impl Block for Box<dyn Block> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue> {
        (**self).call(inputs, training)
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        (**self).output_shape(input_shape)
    }

    fn config(&self) -> Value {
        (**self).config()
    }

    fn as_sequential_mut(&mut self) -> Option<&mut Sequential> {
        (**self).as_sequential_mut()
    }
}

/// Chaining helpers available on every block
pub trait BlockExt: Block + Sized + 'static {
    /// Feed this block's output into `next`
    fn then(self, next: impl Block + 'static) -> Sequential {
        compose(self, next)
    }

    /// Box this block
    fn boxed(self) -> Box<dyn Block> {
        Box::new(self)
    }
}

impl<B: Block + Sized + 'static> BlockExt for B {}

/// `compose(a, b)` applies `a` and then `b`, i.e. `b(a(x))`.
///
/// The result is always one flat [`Sequential`], however many sequences are
/// composed.
pub fn compose(first: impl Block + 'static, second: impl Block + 'static) -> Sequential {
    let mut blocks = Vec::new();
    flatten_into(Box::new(first), &mut blocks);
    flatten_into(Box::new(second), &mut blocks);
    Sequential { blocks }
}

/// An ordered chain of blocks applied in turn
pub struct Sequential {
    blocks: Vec<Box<dyn Block>>,
}

impl Sequential {
    /// Create a chain, flattening any nested chains
    pub fn new(blocks: Vec<Box<dyn Block>>) -> Self {
        let mut flat = Vec::with_capacity(blocks.len());
        for block in blocks {
            flatten_into(block, &mut flat);
        }
        Self { blocks: flat }
    }

    /// Append a block
    #[must_use]
    pub fn then(mut self, next: impl Block + 'static) -> Self {
        flatten_into(Box::new(next), &mut self.blocks);
        self
    }

    /// Append a block if there is one; `None` leaves the chain unchanged
    #[must_use]
    pub fn then_opt(self, next: Option<impl Block + 'static>) -> Self {
        match next {
            Some(block) => self.then(block),
            None => self,
        }
    }

    /// Blocks in application order
    pub fn blocks(&self) -> &[Box<dyn Block>] {
        &self.blocks
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the chain is the identity
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Block for Sequential {
    fn name(&self) -> &str {
        "sequential"
    }

    fn call(&self, inputs: BlockValue, training: bool) -> Result<BlockValue> {
        let mut current = inputs;

        for block in &self.blocks {
            trace!(block = block.name(), "sequential step");
            current = block.call(current, training)?;
        }

        Ok(current)
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        let mut current = input_shape.clone();

        for block in &self.blocks {
            current = block.output_shape(&current)?;
        }

        Ok(current)
    }

    fn config(&self) -> Value {
        Value::Array(
            self.blocks
                .iter()
                .map(|b| json!({ "name": b.name(), "config": b.config() }))
                .collect(),
        )
    }

    fn as_sequential_mut(&mut self) -> Option<&mut Sequential> {
        Some(self)
    }
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.blocks).finish()
    }
}

impl fmt::Display for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential(")?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  ({i}): {}", block.name())?;
        }
        write!(f, ")")
    }
}

/// Returns its input unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl Block for NoOp {
    fn name(&self) -> &str {
        "no_op"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> Result<BlockValue> {
        Ok(inputs)
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> Result<ShapeSpec> {
        Ok(input_shape.clone())
    }
}
