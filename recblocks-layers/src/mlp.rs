//! Multi-layer perceptron block

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array2, Axis};
use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use recblocks_core::tensor::flatten_2d;
use recblocks_core::{Block, BlockValue, Concat, Filter, ShapeSpec};

use crate::dense::{Activation, Dense};
use crate::error::{Error, Result};

const BATCH_NORM_EPSILON: f32 = 1e-3;

/// Normalization applied after every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Standardize every feature with the statistics of the current batch
    BatchNorm,
}

impl Normalization {
    fn apply(self, values: &mut Array2<f32>) {
        match self {
            Normalization::BatchNorm => {
                let Some(mean) = values.mean_axis(Axis(0)) else {
                    return;
                };
                let std = values.var_axis(Axis(0), 0.0).mapv(|v| (v + BATCH_NORM_EPSILON).sqrt());
                *values -= &mean;
                *values /= &std;
            }
        }
    }
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "batch_norm" | "batchnorm" => Ok(Normalization::BatchNorm),
            other => Err(Error::Config(format!("unknown normalization '{other}'"))),
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::BatchNorm => f.write_str("batch_norm"),
        }
    }
}

/// Configuration for [`MlpBlock`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Activation of every layer
    pub activation: Activation,

    /// Whether the layers add a bias
    pub use_bias: bool,

    /// Probability of dropping an activation while training, in `[0, 1)`
    pub dropout: Option<f32>,

    /// Normalization after every layer
    pub normalization: Option<Normalization>,

    /// Seed for the first layer; layer `i` uses `seed + i`, wrapping
    pub seed: u64,

    /// Restrict bundle inputs to these features before concatenating them
    pub filter_features: Option<Vec<String>>,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            use_bias: true,
            dropout: None,
            normalization: None,
            seed: 0,
            filter_features: None,
        }
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - rate)`
#[derive(Debug)]
struct Dropout {
    keep: Bernoulli,
    scale: f32,
}

impl Dropout {
    fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::Config(format!("dropout must be in [0, 1), got {rate}")));
        }
        let keep = Bernoulli::new(f64::from(1.0 - rate))
            .map_err(|e| Error::Config(format!("invalid dropout {rate}: {e}")))?;

        Ok(Self {
            keep,
            scale: 1.0 / (1.0 - rate),
        })
    }

    fn apply(&self, values: &mut Array2<f32>, rng: &mut StdRng) {
        values.mapv_inplace(|v| if self.keep.sample(rng) { v * self.scale } else { 0.0 });
    }
}

/// A stack of [`Dense`] layers, each optionally followed by dropout and
/// normalization.
///
/// Accepts a tensor, or a bundle whose entries are concatenated along the
/// feature axis first (after `filter_features`, when configured). Dropout
/// only runs when `training` is set; every training call draws a fresh mask
/// from a generator seeded by the configured seed and a call counter.
#[derive(Debug)]
pub struct MlpBlock {
    layers: Vec<Dense>,
    dropout: Option<Dropout>,
    filter: Option<Filter>,
    concat: Concat,
    config: MlpConfig,
    training_calls: AtomicU64,
}

impl MlpBlock {
    /// Build layers with the given output sizes over `input_dim` features
    pub fn new(dims: &[usize], input_dim: usize, config: MlpConfig) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::InvalidLayer("an MLP needs at least one layer".into()));
        }
        let dropout = config.dropout.map(Dropout::new).transpose()?;

        let mut layers = Vec::with_capacity(dims.len());
        let mut fan_in = input_dim;
        for (offset, &units) in (0u64..).zip(dims) {
            let seed = config.seed.wrapping_add(offset);
            layers.push(Dense::glorot(fan_in, units, config.activation, config.use_bias, seed)?);
            fan_in = units;
        }
        debug!(
            ?dims,
            input_dim,
            activation = %config.activation,
            dropout = ?config.dropout,
            normalization = ?config.normalization,
            "built mlp"
        );

        let filter = config.filter_features.as_ref().map(|names| Filter::new(names.iter().cloned()));
        Ok(Self {
            layers,
            dropout,
            filter,
            concat: Concat::default(),
            config,
            training_calls: AtomicU64::new(0),
        })
    }

    /// Layers in application order
    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    /// Number of output features
    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::output_dim)
    }

    fn to_tensor(&self, inputs: BlockValue, training: bool) -> recblocks_core::Result<BlockValue> {
        match inputs {
            BlockValue::Tensor(_) => Ok(inputs),
            BlockValue::Bundle(_) => {
                let inputs = match &self.filter {
                    Some(filter) => filter.call(inputs, training)?,
                    None => inputs,
                };
                self.concat.call(inputs, training)
            }
        }
    }

    fn to_tensor_shape(&self, input_shape: &ShapeSpec) -> recblocks_core::Result<ShapeSpec> {
        match input_shape {
            ShapeSpec::Tensor(_) => Ok(input_shape.clone()),
            ShapeSpec::Bundle(_) => {
                let filtered = match &self.filter {
                    Some(filter) => filter.output_shape(input_shape)?,
                    None => input_shape.clone(),
                };
                self.concat.output_shape(&filtered)
            }
        }
    }

    fn dropout_rng(&self, training: bool) -> Option<StdRng> {
        if !training || self.dropout.is_none() {
            return None;
        }
        let call = self.training_calls.fetch_add(1, Ordering::Relaxed);
        Some(StdRng::seed_from_u64(
            self.config.seed ^ call.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        ))
    }
}

impl Block for MlpBlock {
    fn name(&self) -> &str {
        "mlp"
    }

    fn call(&self, inputs: BlockValue, training: bool) -> recblocks_core::Result<BlockValue> {
        let mut current = flatten_2d(&self.to_tensor(inputs, training)?.into_tensor()?)?;
        let mut rng = self.dropout_rng(training);

        for layer in &self.layers {
            current = layer.forward(&current)?;
            if let (Some(dropout), Some(rng)) = (&self.dropout, rng.as_mut()) {
                dropout.apply(&mut current, rng);
            }
            if let Some(normalization) = self.config.normalization {
                normalization.apply(&mut current);
            }
        }
        trace!(batch = current.nrows(), training, "mlp forward");

        Ok(BlockValue::Tensor(current.into_dyn().into_shared()))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> recblocks_core::Result<ShapeSpec> {
        let mut current = self.to_tensor_shape(input_shape)?;
        for layer in &self.layers {
            current = layer.output_shape(&current)?;
        }
        Ok(current)
    }

    fn config(&self) -> Value {
        json!({
            "dims": self.layers.iter().map(Dense::output_dim).collect::<Vec<_>>(),
            "activation": self.config.activation,
            "use_bias": self.config.use_bias,
            "dropout": self.config.dropout,
            "normalization": self.config.normalization,
            "filter_features": self.config.filter_features,
        })
    }
}
