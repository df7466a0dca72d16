//! Fully connected layer

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use recblocks_core::tensor::flatten_2d;
use recblocks_core::{Block, BlockValue, Shape, ShapeSpec};

use crate::error::{Error, Result};

/// Non-linearity applied after the affine step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity
    Linear,
    /// `max(0, x)`
    #[default]
    Relu,
    /// Logistic sigmoid
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
}

impl Activation {
    /// Apply in place
    pub fn apply(self, values: &mut Array2<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => values.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => values.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => values.mapv_inplace(f32::tanh),
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "identity" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            other => Err(Error::Config(format!("unknown activation '{other}'"))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        };
        f.write_str(name)
    }
}

/// `activation(x · W + b)` over `(batch, input_dim)` inputs.
///
/// Inputs of higher rank are flattened to `(batch, features)` first.
pub struct Dense {
    weights: Array2<f32>,
    bias: Option<Array1<f32>>,
    activation: Activation,
}

impl Dense {
    /// Create a layer from explicit parameters; `weights` is `(input_dim, output_dim)`
    pub fn from_weights(
        weights: Array2<f32>,
        bias: Option<Array1<f32>>,
        activation: Activation,
    ) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::InvalidLayer("weights must not be empty".into()));
        }
        if let Some(bias) = &bias {
            if bias.len() != weights.ncols() {
                return Err(Error::InvalidLayer(format!(
                    "bias has {} values but the layer has {} outputs",
                    bias.len(),
                    weights.ncols()
                )));
            }
        }

        Ok(Self {
            weights,
            bias,
            activation,
        })
    }

    /// Create a layer with Glorot-uniform weights drawn from a seeded generator
    /// and a zero bias
    pub fn glorot(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        use_bias: bool,
        seed: u64,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(Error::InvalidLayer(format!(
                "dimensions must be positive, got {input_dim}x{output_dim}"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let limit = (6.0 / (input_dim + output_dim) as f32).sqrt();
        let distribution = Uniform::new_inclusive(-limit, limit);
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((input_dim, output_dim), |_| distribution.sample(&mut rng));
        let bias = use_bias.then(|| Array1::zeros(output_dim));

        Self::from_weights(weights, bias, activation)
    }

    /// Number of input features
    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// Number of output features
    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    /// Activation function
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Apply the layer to a `(batch, input_dim)` matrix
    pub fn forward(&self, inputs: &Array2<f32>) -> recblocks_core::Result<Array2<f32>> {
        if inputs.ncols() != self.input_dim() {
            return Err(recblocks_core::Error::ShapeInconsistency(format!(
                "dense layer expects {} features, got {}",
                self.input_dim(),
                inputs.ncols()
            )));
        }

        let mut outputs = inputs.dot(&self.weights);
        if let Some(bias) = &self.bias {
            outputs += bias;
        }
        self.activation.apply(&mut outputs);
        Ok(outputs)
    }
}

impl Block for Dense {
    fn name(&self) -> &str {
        "dense"
    }

    fn call(&self, inputs: BlockValue, _training: bool) -> recblocks_core::Result<BlockValue> {
        let inputs = flatten_2d(&inputs.into_tensor()?)?;
        trace!(batch = inputs.nrows(), units = self.output_dim(), "dense forward");
        let outputs = self.forward(&inputs)?;
        Ok(BlockValue::Tensor(outputs.into_dyn().into_shared()))
    }

    fn output_shape(&self, input_shape: &ShapeSpec) -> recblocks_core::Result<ShapeSpec> {
        let shape = input_shape.as_tensor()?;
        if let Some(width) = shape.flat_width() {
            if width != self.input_dim() {
                return Err(recblocks_core::Error::ShapeInconsistency(format!(
                    "dense layer expects {} features, got {}",
                    self.input_dim(),
                    width
                )));
            }
        }
        Ok(ShapeSpec::Tensor(Shape(vec![shape.batch(), Some(self.output_dim())])))
    }

    fn config(&self) -> Value {
        json!({
            "units": self.output_dim(),
            "input_dim": self.input_dim(),
            "activation": self.activation,
            "use_bias": self.bias.is_some(),
        })
    }
}

impl fmt::Debug for Dense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dense")
            .field("input_dim", &self.input_dim())
            .field("output_dim", &self.output_dim())
            .field("activation", &self.activation)
            .field("use_bias", &self.bias.is_some())
            .finish()
    }
}
