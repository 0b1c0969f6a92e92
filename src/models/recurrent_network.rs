use std::fmt;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Axis};

use crate::error::EngineError;
use crate::iterators::DataSet;
use crate::layers::gru_cell::{GRUCell, GRUCellCache, GRUCellGradients};
use crate::layers::linear::{LinearGradients, LinearLayer};
use crate::layers::lstm_cell::{LSTMCell, LSTMCellCache, LSTMCellGradients};
use crate::layers::{Activation, Layer, OutputConfig, RecurrentConfig, RecurrentKind, CELL_STATE, HIDDEN_STATE};
use crate::loss::{LossFn, LossFunction};
use crate::models::engine::{LayerState, NetworkEngine, NetworkSpec};
use crate::models::listeners::TrainingListener;
use crate::optimizers::Optimizer;
use crate::persistence::{PersistenceError, PersistentModel};

/// Trainable parameters behind one [`Layer`]
#[derive(Clone, Debug)]
pub enum NetworkLayer {
    Dense { linear: LinearLayer, activation: Activation },
    Lstm(LSTMCell),
    Gru(GRUCell),
    Output { linear: LinearLayer, activation: Activation, loss: LossFn },
}

impl NetworkLayer {
    fn new(layer: &Layer, n_in: usize, n_out: usize) -> Self {
        match layer {
            Layer::Dense(c) => NetworkLayer::Dense {
                linear: LinearLayer::new(n_in, c.n_out),
                activation: c.activation,
            },
            Layer::Recurrent(RecurrentConfig { kind: RecurrentKind::Lstm, n_out, activation, .. }) => {
                NetworkLayer::Lstm(LSTMCell::new(n_in, *n_out, *activation))
            }
            Layer::Recurrent(RecurrentConfig { kind: RecurrentKind::Gru, n_out, activation, .. }) => {
                NetworkLayer::Gru(GRUCell::new(n_in, *n_out, *activation))
            }
            Layer::Output(c) => NetworkLayer::Output {
                linear: LinearLayer::new(n_in, n_out),
                activation: c.activation,
                loss: c.loss,
            },
        }
    }

    fn input_size(&self) -> usize {
        match self {
            NetworkLayer::Dense { linear, .. } | NetworkLayer::Output { linear, .. } => linear.input_size,
            NetworkLayer::Lstm(cell) => cell.input_size(),
            NetworkLayer::Gru(cell) => cell.input_size(),
        }
    }

    fn output_size(&self) -> usize {
        match self {
            NetworkLayer::Dense { linear, .. } | NetworkLayer::Output { linear, .. } => linear.output_size,
            NetworkLayer::Lstm(cell) => cell.hidden_size,
            NetworkLayer::Gru(cell) => cell.hidden_size,
        }
    }
}

/// Hidden and cell activations carried between time steps. GRU layers
/// leave `cell` at zero.
#[derive(Clone, Debug)]
struct Carry {
    hidden: Array2<f64>,
    cell: Array2<f64>,
}

impl Carry {
    fn zeros(size: usize, sequences: usize) -> Self {
        Carry {
            hidden: Array2::zeros((size, sequences)),
            cell: Array2::zeros((size, sequences)),
        }
    }
}

enum StepCache {
    Dense { input: Array2<f64>, z: Array2<f64>, out: Array2<f64> },
    Lstm(LSTMCellCache),
    Gru(GRUCellCache),
}

enum LayerGradients {
    Linear(LinearGradients),
    Lstm(LSTMCellGradients),
    Gru(GRUCellGradients),
}

impl LayerGradients {
    fn matrices_mut(&mut self) -> Vec<&mut Array2<f64>> {
        match self {
            LayerGradients::Linear(g) => vec![&mut g.weight, &mut g.bias],
            LayerGradients::Lstm(g) => g.matrices_mut().into_iter().collect(),
            LayerGradients::Gru(g) => g.matrices_mut().into_iter().collect(),
        }
    }
}

struct ForwardPass {
    output: Array3<f64>,
    /// `[time][layer]`, only filled when requested
    caches: Vec<Vec<StepCache>>,
    carry: Vec<Option<Carry>>,
}

/// Stacked dense/LSTM/GRU network trained with full backpropagation through
/// time over each batch. Tensors follow the `(sequences, features, time)` layout.
///
/// Only layers declared stateful keep their state between
/// [`rnn_time_step`](NetworkEngine::rnn_time_step) calls; other recurrent
/// layers start every call from zeros.
#[derive(Clone)]
pub struct RecurrentNetwork {
    spec: NetworkSpec,
    layers: Vec<NetworkLayer>,
    states: Vec<LayerState>,
    optimizer: Box<dyn Optimizer>,
    listeners: Vec<Arc<dyn TrainingListener>>,
    iteration: usize,
    epochs_performed: usize,
    last_score: Option<f64>,
}

impl fmt::Debug for RecurrentNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentNetwork")
            .field("spec", &self.spec)
            .field("iteration", &self.iteration)
            .field("epochs_performed", &self.epochs_performed)
            .field("last_score", &self.last_score)
            .finish()
    }
}

fn validate_spec(spec: &NetworkSpec) -> Result<(), EngineError> {
    let invalid = |msg: String| Err(EngineError::InvalidConfiguration(msg));

    if spec.n_in == 0 || spec.n_out == 0 {
        return invalid(format!("network needs inputs and outputs, got n_in={} n_out={}", spec.n_in, spec.n_out));
    }
    match spec.layers.last() {
        None => return invalid("no layers".to_string()),
        Some(last) if !last.is_output() => return invalid("last layer must be an output layer".to_string()),
        _ => {}
    }

    let last = spec.layers.len() - 1;
    for (i, layer) in spec.layers.iter().enumerate() {
        match layer {
            Layer::Output(_) if i != last => {
                return invalid(format!("output layer at index {} is not the last layer", i));
            }
            Layer::Output(OutputConfig { n_out: Some(0), .. }) => {
                return invalid("output layer has no units".to_string());
            }
            Layer::Dense(c) if c.n_out == 0 => return invalid(format!("layer {} has no units", i)),
            Layer::Recurrent(c) if c.n_out == 0 => return invalid(format!("layer {} has no units", i)),
            Layer::Recurrent(c) if c.activation == Activation::Softmax => {
                return invalid(format!("recurrent layer {} cannot use a softmax activation", i));
            }
            _ => {}
        }
    }
    Ok(())
}

fn clip_gradient_matrix(matrix: &mut Array2<f64>, max_norm: f64) {
    let norm = (&*matrix * &*matrix).sum().sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        matrix.mapv_inplace(|x| x * scale);
    }
}

impl RecurrentNetwork {
    /// Reassembles a network from previously trained layers
    pub fn from_layers(spec: NetworkSpec, layers: Vec<NetworkLayer>) -> Result<Self, EngineError> {
        validate_spec(&spec)?;
        if layers.len() != spec.layers.len() {
            return Err(EngineError::InvalidConfiguration(format!(
                "{} layer declarations but {} parameter sets",
                spec.layers.len(),
                layers.len()
            )));
        }

        let mut n_in = spec.n_in;
        for (i, layer) in layers.iter().enumerate() {
            if layer.input_size() != n_in {
                return Err(EngineError::ShapeMismatch {
                    context: format!("input of layer {}", i),
                    expected: vec![n_in],
                    actual: vec![layer.input_size()],
                });
            }
            n_in = layer.output_size();
        }

        let optimizer = spec.updater.build();
        Ok(RecurrentNetwork {
            states: vec![LayerState::new(); layers.len()],
            spec,
            layers,
            optimizer,
            listeners: Vec::new(),
            iteration: 0,
            epochs_performed: 0,
            last_score: None,
        })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn network_layers(&self) -> &[NetworkLayer] {
        &self.layers
    }

    pub fn num_outputs(&self) -> usize {
        self.layers.last().map_or(0, NetworkLayer::output_size)
    }

    pub fn epochs_performed(&self) -> usize {
        self.epochs_performed
    }

    pub fn last_score(&self) -> Option<f64> {
        self.last_score
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| match layer {
                NetworkLayer::Dense { linear, .. } | NetworkLayer::Output { linear, .. } => linear.num_parameters(),
                NetworkLayer::Lstm(c) => c.w_ih.len() + c.w_hh.len() + c.b_ih.len() + c.b_hh.len(),
                NetworkLayer::Gru(c) => 3 * (c.w_ir.len() + c.w_hr.len() + c.b_ir.len() + c.b_hr.len()),
            })
            .sum()
    }

    fn loss(&self) -> LossFn {
        match self.layers.last() {
            Some(NetworkLayer::Output { loss, .. }) => *loss,
            _ => LossFn::default(),
        }
    }

    fn check_layer(&self, layer: usize) -> Result<(), EngineError> {
        if layer >= self.spec.layers.len() {
            return Err(EngineError::LayerIndex { index: layer, num_layers: self.spec.layers.len() });
        }
        if !self.spec.layers[layer].is_stateful() {
            return Err(EngineError::NotStateful(layer));
        }
        Ok(())
    }

    fn check_features(&self, features: &Array3<f64>) -> Result<(), EngineError> {
        if features.len_of(Axis(1)) != self.spec.n_in {
            return Err(EngineError::ShapeMismatch {
                context: "features".to_string(),
                expected: vec![features.len_of(Axis(0)), self.spec.n_in, features.len_of(Axis(2))],
                actual: features.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn check_batch(&self, batch: &DataSet) -> Result<(), EngineError> {
        self.check_features(&batch.features)?;
        let (sequences, _, steps) = batch.features.dim();
        let expected = [sequences, self.num_outputs(), steps];
        if batch.labels.shape() != expected {
            return Err(EngineError::ShapeMismatch {
                context: "labels".to_string(),
                expected: expected.to_vec(),
                actual: batch.labels.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn zero_carry(&self, sequences: usize) -> Vec<Option<Carry>> {
        self.layers
            .iter()
            .map(|layer| match layer {
                NetworkLayer::Lstm(c) => Some(Carry::zeros(c.hidden_size, sequences)),
                NetworkLayer::Gru(c) => Some(Carry::zeros(c.hidden_size, sequences)),
                _ => None,
            })
            .collect()
    }

    /// Starting carry for an incremental step: stored state where a stateful
    /// layer has one matching the sequence count, zeros everywhere else.
    fn stored_carry(&self, sequences: usize) -> Result<Vec<Option<Carry>>, EngineError> {
        let mut carry = self.zero_carry(sequences);
        for (i, slot) in carry.iter_mut().enumerate() {
            let (Some(slot), Some(hidden)) = (slot.as_mut(), self.states[i].get(HIDDEN_STATE)) else {
                continue;
            };
            if hidden.ncols() != sequences {
                return Err(EngineError::ShapeMismatch {
                    context: format!("recurrent state of layer {}", i),
                    expected: vec![hidden.nrows(), sequences],
                    actual: hidden.shape().to_vec(),
                });
            }
            slot.hidden.assign(hidden);
            if let Some(cell) = self.states[i].get(CELL_STATE) {
                slot.cell.assign(cell);
            }
        }
        Ok(carry)
    }

    fn forward(&self, features: &Array3<f64>, mut carry: Vec<Option<Carry>>, keep_cache: bool) -> ForwardPass {
        let (sequences, _, steps) = features.dim();
        let mut output = Array3::zeros((sequences, self.num_outputs(), steps));
        let mut caches = Vec::with_capacity(if keep_cache { steps } else { 0 });

        for t in 0..steps {
            let mut x = features.slice(s![.., .., t]).t().to_owned();
            let mut step_caches = Vec::with_capacity(self.layers.len());

            for (layer, slot) in self.layers.iter().zip(carry.iter_mut()) {
                match (layer, slot) {
                    (NetworkLayer::Dense { linear, activation }, _)
                    | (NetworkLayer::Output { linear, activation, .. }, _) => {
                        let z = linear.forward(&x);
                        let out = activation.apply(&z);
                        if keep_cache {
                            step_caches.push(StepCache::Dense { input: x, z, out: out.clone() });
                        }
                        x = out;
                    }
                    (NetworkLayer::Lstm(cell), Some(state)) => {
                        let (hy, cy, cache) = cell.forward_with_cache(&x, &state.hidden, &state.cell);
                        if keep_cache {
                            step_caches.push(StepCache::Lstm(cache));
                        }
                        state.hidden = hy.clone();
                        state.cell = cy;
                        x = hy;
                    }
                    (NetworkLayer::Gru(cell), Some(state)) => {
                        let (hy, cache) = cell.forward_with_cache(&x, &state.hidden);
                        if keep_cache {
                            step_caches.push(StepCache::Gru(cache));
                        }
                        state.hidden = hy.clone();
                        x = hy;
                    }
                    // zero_carry gives every recurrent layer a slot
                    (NetworkLayer::Lstm(_) | NetworkLayer::Gru(_), None) => {}
                }
            }

            output.slice_mut(s![.., .., t]).assign(&x.t());
            if keep_cache {
                caches.push(step_caches);
            }
        }

        ForwardPass { output, caches, carry }
    }

    /// Mean loss over labelled time steps, plus the per-step output
    /// gradients when `with_gradients` is set.
    fn labelled_loss(&self, batch: &DataSet, output: &Array3<f64>, with_gradients: bool) -> (f64, Vec<Option<Array2<f64>>>) {
        let loss_fn = self.loss();
        let steps = output.len_of(Axis(2));
        let labelled: Vec<usize> = batch.labelled_time_steps().into_iter().filter(|&t| t < steps).collect();
        let mut gradients = vec![None; steps];
        if labelled.is_empty() {
            return (0.0, gradients);
        }

        let scale = labelled.len() as f64;
        let mut total = 0.0;
        for &t in &labelled {
            let prediction = output.slice(s![.., .., t]).t().to_owned();
            let target = batch.labels.slice(s![.., .., t]).t().to_owned();
            total += loss_fn.compute_loss(&prediction, &target);
            if with_gradients {
                gradients[t] = Some(loss_fn.compute_gradient(&prediction, &target) / scale);
            }
        }
        (total / scale, gradients)
    }

    fn backward(&self, pass: &ForwardPass, output_gradients: &[Option<Array2<f64>>]) -> Vec<LayerGradients> {
        let sequences = pass.output.len_of(Axis(0));
        let mut totals: Vec<LayerGradients> = self
            .layers
            .iter()
            .map(|layer| match layer {
                NetworkLayer::Dense { linear, .. } | NetworkLayer::Output { linear, .. } => {
                    LayerGradients::Linear(linear.zero_gradients())
                }
                NetworkLayer::Lstm(cell) => LayerGradients::Lstm(cell.zero_gradients()),
                NetworkLayer::Gru(cell) => LayerGradients::Gru(cell.zero_gradients()),
            })
            .collect();
        let mut recurrent_grads: Vec<Carry> = self
            .layers
            .iter()
            .map(|layer| Carry::zeros(layer.output_size(), sequences))
            .collect();

        for (t, step_caches) in pass.caches.iter().enumerate().rev() {
            let mut upstream = match &output_gradients[t] {
                Some(g) => g.clone(),
                None => Array2::zeros((self.num_outputs(), sequences)),
            };

            for i in (0..self.layers.len()).rev() {
                match (&self.layers[i], &step_caches[i], &mut totals[i]) {
                    (
                        NetworkLayer::Dense { linear, activation } | NetworkLayer::Output { linear, activation, .. },
                        StepCache::Dense { input, z, out },
                        LayerGradients::Linear(total),
                    ) => {
                        let dz = activation.backward(z, out, &upstream);
                        let (grads, dx) = linear.backward(input, &dz);
                        total.accumulate(&grads);
                        upstream = dx;
                    }
                    (NetworkLayer::Lstm(cell), StepCache::Lstm(cache), LayerGradients::Lstm(total)) => {
                        let next = &mut recurrent_grads[i];
                        let dh = &upstream + &next.hidden;
                        let (grads, dx, dhx, dcx) = cell.backward(&dh, &next.cell, cache);
                        total.accumulate(&grads);
                        next.hidden = dhx;
                        next.cell = dcx;
                        upstream = dx;
                    }
                    (NetworkLayer::Gru(cell), StepCache::Gru(cache), LayerGradients::Gru(total)) => {
                        let next = &mut recurrent_grads[i];
                        let dh = &upstream + &next.hidden;
                        let (grads, dx, dhx) = cell.backward(&dh, cache);
                        total.accumulate(&grads);
                        next.hidden = dhx;
                        upstream = dx;
                    }
                    // caches and gradients are built in layer order
                    _ => {}
                }
            }
        }

        totals
    }

    fn apply_gradients(&mut self, mut gradients: Vec<LayerGradients>) {
        if let Some(max_norm) = self.spec.clip_gradient {
            for layer in gradients.iter_mut() {
                for matrix in layer.matrices_mut() {
                    clip_gradient_matrix(matrix, max_norm);
                }
            }
        }

        let optimizer = &mut *self.optimizer;
        for (i, (layer, grads)) in self.layers.iter_mut().zip(&gradients).enumerate() {
            let prefix = format!("layer_{}", i);
            match (layer, grads) {
                (NetworkLayer::Dense { linear, .. } | NetworkLayer::Output { linear, .. }, LayerGradients::Linear(g)) => {
                    linear.update_parameters(g, optimizer, &prefix)
                }
                (NetworkLayer::Lstm(cell), LayerGradients::Lstm(g)) => cell.update_parameters(g, optimizer, &prefix),
                (NetworkLayer::Gru(cell), LayerGradients::Gru(g)) => cell.update_parameters(g, optimizer, &prefix),
                _ => {}
            }
        }
    }
}

impl NetworkEngine for RecurrentNetwork {
    fn build(spec: &NetworkSpec) -> Result<Self, EngineError> {
        validate_spec(spec)?;

        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut n_in = spec.n_in;
        for layer in &spec.layers {
            let n_out = match layer {
                Layer::Output(c) => c.n_out.unwrap_or(spec.n_out),
                Layer::Dense(c) => c.n_out,
                Layer::Recurrent(c) => c.n_out,
            };
            layers.push(NetworkLayer::new(layer, n_in, n_out));
            n_in = n_out;
        }

        RecurrentNetwork::from_layers(spec.clone(), layers)
    }

    fn layers(&self) -> &[Layer] {
        &self.spec.layers
    }

    fn set_listeners(&mut self, listeners: Vec<Arc<dyn TrainingListener>>) {
        self.listeners = listeners;
    }

    fn epoch_done(&mut self, epoch: usize, score: f64) {
        self.epochs_performed += 1;
        for listener in &self.listeners {
            listener.epoch_done(epoch, score);
        }
    }

    fn fit(&mut self, batch: &DataSet) -> Result<f64, EngineError> {
        self.check_batch(batch)?;
        let sequences = batch.features.len_of(Axis(0));

        let pass = self.forward(&batch.features, self.zero_carry(sequences), true);
        let (loss, output_gradients) = self.labelled_loss(batch, &pass.output, true);
        let gradients = self.backward(&pass, &output_gradients);
        self.apply_gradients(gradients);

        self.iteration += 1;
        self.last_score = Some(loss);
        for listener in &self.listeners {
            listener.iteration_done(self.iteration, loss);
        }
        Ok(loss)
    }

    fn score(&self, batch: &DataSet) -> Result<f64, EngineError> {
        self.check_batch(batch)?;
        let sequences = batch.features.len_of(Axis(0));
        let pass = self.forward(&batch.features, self.zero_carry(sequences), false);
        Ok(self.labelled_loss(batch, &pass.output, false).0)
    }

    fn rnn_time_step(&mut self, features: &Array3<f64>) -> Result<Array3<f64>, EngineError> {
        self.check_features(features)?;
        let carry = self.stored_carry(features.len_of(Axis(0)))?;
        let pass = self.forward(features, carry, false);

        for (i, slot) in pass.carry.into_iter().enumerate() {
            let (Some(carry), true) = (slot, self.spec.layers[i].is_stateful()) else {
                continue;
            };
            let state = &mut self.states[i];
            state.insert(HIDDEN_STATE.to_string(), carry.hidden);
            if matches!(self.layers[i], NetworkLayer::Lstm(_)) {
                state.insert(CELL_STATE.to_string(), carry.cell);
            }
        }

        Ok(pass.output)
    }

    fn rnn_get_previous_state(&self, layer: usize) -> Result<LayerState, EngineError> {
        self.check_layer(layer)?;
        Ok(self.states[layer].clone())
    }

    fn rnn_set_previous_state(&mut self, layer: usize, state: LayerState) -> Result<(), EngineError> {
        self.check_layer(layer)?;
        if state.is_empty() {
            self.states[layer].clear();
            return Ok(());
        }

        let size = self.layers[layer].output_size();
        let mut installed = LayerState::new();
        let mut sequences = None;
        for &name in self.spec.layers[layer].state_names() {
            let tensor = state
                .get(name)
                .ok_or_else(|| EngineError::MissingStateTensor { layer, name: name.to_string() })?;
            let columns = *sequences.get_or_insert(tensor.ncols());
            if tensor.nrows() != size || tensor.ncols() != columns {
                return Err(EngineError::ShapeMismatch {
                    context: format!("'{}' state of layer {}", name, layer),
                    expected: vec![size, columns],
                    actual: tensor.shape().to_vec(),
                });
            }
            installed.insert(name.to_string(), tensor.clone());
        }

        self.states[layer] = installed;
        Ok(())
    }

    fn rnn_clear_previous_state(&mut self) {
        for state in self.states.iter_mut() {
            state.clear();
        }
    }

    fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        PersistentModel::save(self, path)
    }

    fn restore(path: &Path) -> Result<Self, PersistenceError> {
        <Self as PersistentModel>::load(path).map(|(network, _)| network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextGuard, EngineContext};
    use crate::optimizers::Updater;
    use ndarray::Array;

    fn spec(layers: Vec<Layer>) -> NetworkSpec {
        NetworkSpec {
            n_in: 2,
            n_out: 1,
            layers,
            updater: Updater::Adam { learning_rate: 0.01 },
            clip_gradient: Some(5.0),
        }
    }

    fn sine_batch(steps: usize) -> DataSet {
        let mut features = Array3::zeros((1, 2, steps));
        let mut labels = Array3::zeros((1, 1, steps));
        for t in 0..steps {
            let x = t as f64 * 0.3;
            features[[0, 0, t]] = x.sin();
            features[[0, 1, t]] = x.cos();
            labels[[0, 0, t]] = (x + 0.3).sin();
        }
        DataSet { features, labels, last_time_steps: (0..steps).collect() }
    }

    #[test]
    fn test_build_rejects_invalid_layouts() {
        assert!(RecurrentNetwork::build(&spec(vec![])).is_err());
        assert!(RecurrentNetwork::build(&spec(vec![Layer::lstm(4)])).is_err());
        assert!(RecurrentNetwork::build(&spec(vec![Layer::output(LossFn::Mse), Layer::lstm(4)])).is_err());
        assert!(RecurrentNetwork::build(&spec(vec![
            Layer::lstm(4).with_activation(Activation::Softmax),
            Layer::output(LossFn::Mse),
        ]))
        .is_err());
    }

    #[test]
    fn test_time_step_output_shape() {
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::lstm(3), Layer::output(LossFn::Mse)])).unwrap();
        let output = net.rnn_time_step(&Array3::ones((1, 2, 5))).unwrap();
        assert_eq!(output.shape(), &[1, 1, 5]);
    }

    #[test]
    fn test_feature_width_is_checked() {
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::gru(3), Layer::output(LossFn::Mse)])).unwrap();
        let err = net.rnn_time_step(&Array3::ones((1, 3, 2))).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_state_is_carried_between_steps() {
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::lstm(3), Layer::output(LossFn::Mse)])).unwrap();
        let input = Array::from_shape_vec((1, 2, 1), vec![0.5, -0.2]).unwrap();

        let first = net.rnn_time_step(&input).unwrap();
        let state = net.rnn_get_previous_state(0).unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state[HIDDEN_STATE].shape(), &[3, 1]);

        let second = net.rnn_time_step(&input).unwrap();
        assert_ne!(first, second);

        net.rnn_clear_previous_state();
        let replay = net.rnn_time_step(&input).unwrap();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_non_stateful_layer_starts_from_zero() {
        let mut net = RecurrentNetwork::build(&spec(vec![
            Layer::gru(3).with_stateful(false),
            Layer::output(LossFn::Mse),
        ]))
        .unwrap();
        let input = Array3::from_elem((1, 2, 1), 0.4);

        let first = net.rnn_time_step(&input).unwrap();
        let second = net.rnn_time_step(&input).unwrap();
        assert_eq!(first, second);
        assert!(matches!(net.rnn_get_previous_state(0), Err(EngineError::NotStateful(0))));
    }

    #[test]
    fn test_set_previous_state_validates_tensors() {
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::lstm(3), Layer::output(LossFn::Mse)])).unwrap();

        let mut state = LayerState::new();
        state.insert(HIDDEN_STATE.to_string(), Array2::zeros((3, 1)));
        let err = net.rnn_set_previous_state(0, state.clone()).unwrap_err();
        assert!(matches!(err, EngineError::MissingStateTensor { layer: 0, .. }));

        state.insert(CELL_STATE.to_string(), Array2::zeros((2, 1)));
        let err = net.rnn_set_previous_state(0, state.clone()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));

        state.insert(CELL_STATE.to_string(), Array2::zeros((3, 1)));
        net.rnn_set_previous_state(0, state).unwrap();
        assert!(matches!(net.rnn_set_previous_state(5, LayerState::new()), Err(EngineError::LayerIndex { .. })));
    }

    #[test]
    fn test_fit_reduces_loss() {
        let _guard = ContextGuard::enter(EngineContext::seeded(7));
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::lstm(8), Layer::output(LossFn::Mse)])).unwrap();
        let batch = sine_batch(20);

        let initial = net.score(&batch).unwrap();
        for _ in 0..200 {
            net.fit(&batch).unwrap();
        }
        let trained = net.score(&batch).unwrap();

        assert!(trained < initial, "loss went from {} to {}", initial, trained);
        assert_eq!(net.last_score().map(f64::is_finite), Some(true));
    }

    #[test]
    fn test_fit_with_gru_and_dense_layers() {
        let _guard = ContextGuard::enter(EngineContext::seeded(11));
        let mut net = RecurrentNetwork::build(&spec(vec![
            Layer::dense(4).with_activation(Activation::Tanh),
            Layer::gru(6),
            Layer::output(LossFn::Mse),
        ]))
        .unwrap();
        let batch = sine_batch(15);

        let initial = net.score(&batch).unwrap();
        for _ in 0..150 {
            net.fit(&batch).unwrap();
        }
        assert!(net.score(&batch).unwrap() < initial);
    }

    #[test]
    fn test_fit_rejects_wrong_label_width() {
        let mut net = RecurrentNetwork::build(&spec(vec![Layer::lstm(2), Layer::output(LossFn::Mse)])).unwrap();
        let mut batch = sine_batch(3);
        batch.labels = Array3::zeros((1, 2, 3));
        assert!(net.fit(&batch).is_err());
    }

    #[test]
    fn test_score_reads_only_labelled_columns() {
        let net = RecurrentNetwork::build(&spec(vec![Layer::gru(3), Layer::output(LossFn::Mse)])).unwrap();
        let mut batch = sine_batch(6);
        batch.last_time_steps = vec![4, 4, 1];
        let clean = net.score(&batch).unwrap();

        // Targets at unlabelled columns never enter the loss
        for t in [0, 2, 3, 5] {
            batch.labels[[0, 0, t]] = 1e6;
        }
        assert_eq!(net.score(&batch).unwrap(), clean);

        batch.labels[[0, 0, 4]] = 1e6;
        assert!(net.score(&batch).unwrap() > clean);
    }

    #[test]
    fn test_seeded_context_is_reproducible() {
        let layers = vec![Layer::lstm(3), Layer::output(LossFn::Mse)];
        let build = || {
            let _guard = ContextGuard::enter(EngineContext::seeded(42));
            RecurrentNetwork::build(&spec(layers.clone())).unwrap()
        };
        let (mut a, mut b) = (build(), build());
        let input = Array3::from_elem((1, 2, 3), 0.1);
        assert_eq!(a.rnn_time_step(&input).unwrap(), b.rnn_time_step(&input).unwrap());
    }
}
