//! Layer declarations and the cells that implement them.
//!
//! A network is declared as an ordered list of [`Layer`] values. The list
//! is a closed set of kinds; callers ask [`Layer::is_stateful`] instead of
//! inspecting concrete types to find out which layers carry recurrent state.

use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::loss::LossFn;
use crate::utils::{sigmoid, softmax};

/// Module for LSTM cells.
pub mod lstm_cell;

/// Module for GRU cells.
pub mod gru_cell;

/// Module for fully connected layers.
pub mod linear;

/// Elementwise (or, for softmax, column-wise) activation function
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    #[default]
    Tanh,
    Sigmoid,
    Relu,
    Softmax,
}

impl Activation {
    pub fn apply(&self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Softmax => softmax(z),
            _ => z.mapv(|x| self.apply_scalar(x)),
        }
    }

    /// Scalar form; softmax has none and falls back to identity
    pub fn apply_scalar(&self, x: f64) -> f64 {
        match self {
            Activation::Identity | Activation::Softmax => x,
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
            Activation::Relu => x.max(0.0),
        }
    }

    /// Derivative at pre-activation `x` for elementwise activations
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            Activation::Identity | Activation::Softmax => 1.0,
            Activation::Tanh => 1.0 - x.tanh().powi(2),
            Activation::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn is_elementwise(&self) -> bool {
        !matches!(self, Activation::Softmax)
    }

    /// Gradient w.r.t. the pre-activation `z`, given the activated `out` and
    /// the upstream gradient `grad`.
    pub fn backward(&self, z: &Array2<f64>, out: &Array2<f64>, grad: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Softmax => {
                // Jacobian-vector product per column: y ⊙ (g - <g, y>)
                let dot = (grad * out).sum_axis(Axis(0));
                let mut dz = grad - &dot.insert_axis(Axis(0));
                dz *= out;
                dz
            }
            _ => {
                let mut dz = grad.clone();
                Zip::from(&mut dz).and(z).for_each(|d, &x| *d *= self.derivative(x));
                dz
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrentKind {
    Lstm,
    Gru,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub n_out: usize,
    pub activation: Activation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurrentConfig {
    pub kind: RecurrentKind,
    pub n_out: usize,
    pub activation: Activation,
    /// Whether hidden state is carried across `rnn_time_step` calls
    pub stateful: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Defaults to the number of classes of the training data
    pub n_out: Option<usize>,
    pub activation: Activation,
    pub loss: LossFn,
}

/// One entry of a network declaration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Dense(DenseConfig),
    Recurrent(RecurrentConfig),
    Output(OutputConfig),
}

impl Layer {
    pub fn dense(n_out: usize) -> Self {
        Layer::Dense(DenseConfig { n_out, activation: Activation::Relu })
    }

    pub fn lstm(n_out: usize) -> Self {
        Layer::Recurrent(RecurrentConfig {
            kind: RecurrentKind::Lstm,
            n_out,
            activation: Activation::Tanh,
            stateful: true,
        })
    }

    pub fn gru(n_out: usize) -> Self {
        Layer::Recurrent(RecurrentConfig {
            kind: RecurrentKind::Gru,
            n_out,
            activation: Activation::Tanh,
            stateful: true,
        })
    }

    pub fn output(loss: LossFn) -> Self {
        Layer::Output(OutputConfig { n_out: None, activation: Activation::Identity, loss })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        match &mut self {
            Layer::Dense(c) => c.activation = activation,
            Layer::Recurrent(c) => c.activation = activation,
            Layer::Output(c) => c.activation = activation,
        }
        self
    }

    /// Only meaningful for recurrent layers
    pub fn with_stateful(mut self, stateful: bool) -> Self {
        if let Layer::Recurrent(c) = &mut self {
            c.stateful = stateful;
        }
        self
    }

    pub fn with_n_out(mut self, n_out: usize) -> Self {
        match &mut self {
            Layer::Dense(c) => c.n_out = n_out,
            Layer::Recurrent(c) => c.n_out = n_out,
            Layer::Output(c) => c.n_out = Some(n_out),
        }
        self
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Layer::Recurrent(RecurrentConfig { stateful: true, .. }))
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Layer::Output(_))
    }

    /// Names of the state tensors a stateful layer exposes
    pub fn state_names(&self) -> &'static [&'static str] {
        match self {
            Layer::Recurrent(RecurrentConfig { kind: RecurrentKind::Lstm, .. }) => {
                &[HIDDEN_STATE, CELL_STATE]
            }
            Layer::Recurrent(RecurrentConfig { kind: RecurrentKind::Gru, .. }) => &[HIDDEN_STATE],
            _ => &[],
        }
    }
}

pub const HIDDEN_STATE: &str = "hidden";
pub const CELL_STATE: &str = "cell";
