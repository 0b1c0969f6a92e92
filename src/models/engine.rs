//! Contract between the forecaster and the network that does the numerics.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::iterators::DataSet;
use crate::layers::Layer;
use crate::models::listeners::TrainingListener;
use crate::optimizers::Updater;
use crate::persistence::PersistenceError;

/// Named state tensors of one recurrent layer, each `(hidden_size, sequences)`
pub type LayerState = BTreeMap<String, Array2<f64>>;

/// One [`LayerState`] per stateful layer, in declaration order
pub type RecurrentState = Vec<LayerState>;

/// Everything needed to construct a network graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub n_in: usize,
    pub n_out: usize,
    pub layers: Vec<Layer>,
    pub updater: Updater,
    pub clip_gradient: Option<f64>,
}

/// A recurrent network the forecaster can drive.
///
/// Tensors use the `(sequences, features, time)` layout of [`DataSet`].
pub trait NetworkEngine: Clone {
    /// Builds a freshly initialised network
    fn build(spec: &NetworkSpec) -> Result<Self, EngineError>
    where
        Self: Sized;

    fn layers(&self) -> &[Layer];

    /// Replaces the attached progress listeners
    fn set_listeners(&mut self, listeners: Vec<Arc<dyn TrainingListener>>);

    /// Reports the end of an epoch to the attached listeners
    fn epoch_done(&mut self, epoch: usize, score: f64);

    /// One parameter update on `batch`, returning the loss before the update
    fn fit(&mut self, batch: &DataSet) -> Result<f64, EngineError>;

    /// Loss on `batch` without touching weights or carried state
    fn score(&self, batch: &DataSet) -> Result<f64, EngineError>;

    /// Forward pass that starts from and updates the carried recurrent state,
    /// returning `(sequences, n_out, time)` scores.
    fn rnn_time_step(&mut self, features: &Array3<f64>) -> Result<Array3<f64>, EngineError>;

    /// Snapshot of the state carried by layer `layer`; empty if none yet
    fn rnn_get_previous_state(&self, layer: usize) -> Result<LayerState, EngineError>;

    /// Installs `state` into layer `layer`; an empty map clears it
    fn rnn_set_previous_state(&mut self, layer: usize, state: LayerState) -> Result<(), EngineError>;

    fn rnn_clear_previous_state(&mut self);

    fn save(&self, path: &Path) -> Result<(), PersistenceError>;

    fn restore(path: &Path) -> Result<Self, PersistenceError>
    where
        Self: Sized;
}
