//! Recurrent forecaster with carried hidden state.
//!
//! Prediction goes through the engine's incremental time step, so after the
//! model has seen a history it can forecast the next step from that step's
//! input alone. The carried state can be snapshotted, replayed, cleared and
//! persisted independently of the model.

use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, Array3};
use tracing::{debug, info, warn};

use crate::classifiers::config::ForecasterConfig;
use crate::classifiers::early_stopping::EarlyStopper;
use crate::classifiers::zero_r::ZeroR;
use crate::context::{ContextGuard, EngineContext};
use crate::data::{Capabilities, Capability, Filter, FilterPipeline, Instances};
use crate::error::{EngineError, ForecastError, Result};
use crate::iterators::{DataSet, TimeseriesDataSetIterator};
use crate::models::engine::{NetworkEngine, NetworkSpec, RecurrentState};
use crate::models::listeners::{LoggingListener, TrainingListener};
use crate::models::recurrent_network::RecurrentNetwork;
use crate::persistence::{BaseModelSerializer, StatePersistence};
use crate::utils::normalize;

/// Lifecycle of a forecaster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForecasterState {
    Uninitialized,
    Initialized,
    Trained,
    Predicting,
}

/// A predictor whose output depends on state carried between calls
pub trait StateDependentPredictor {
    type State;

    /// Snapshot of the carried state
    fn get_previous_state(&self) -> Result<Self::State>;

    /// Replaces the carried state with `state`
    fn set_previous_state(&mut self, state: Self::State) -> Result<()>;

    /// Forgets all carried state
    fn clear_previous_state(&mut self) -> Result<()>;
}

/// Wraps a recurrent [`NetworkEngine`] as a forecaster over [`Instances`].
pub struct RnnForecaster<E: NetworkEngine = RecurrentNetwork> {
    config: ForecasterConfig,
    state: ForecasterState,
    model: Option<E>,
    zero_r: Option<ZeroR>,
    filters: FilterPipeline,
    train_iterator: Option<TimeseriesDataSetIterator>,
    validation_data: Option<Arc<Instances>>,
    listeners: Vec<Arc<dyn TrainingListener>>,
    epochs_performed: usize,
}

impl<E: NetworkEngine> Default for RnnForecaster<E> {
    fn default() -> Self {
        RnnForecaster::new(ForecasterConfig::default())
    }
}

/// Sequence holding example `example` of a batch: one sequence per example,
/// or a single sequence holding every example.
fn sequence_of(example: usize, sequences: usize) -> usize {
    if example < sequences {
        example
    } else {
        0
    }
}

/// Per example of `batch`, the `num_classes` scores of `output` at the
/// example's last valid time column, `examples × num_classes`.
pub(crate) fn last_step_scores(output: &Array3<f64>, batch: &DataSet, num_classes: usize) -> Result<Array2<f64>> {
    let (sequences, outputs, steps) = output.dim();
    if outputs != num_classes {
        return Err(EngineError::ShapeMismatch {
            context: "predicted class scores".to_string(),
            expected: vec![sequences, num_classes],
            actual: vec![sequences, outputs],
        }
        .into());
    }

    let mut scores = Array2::zeros((batch.num_examples(), num_classes));
    for (i, &last) in batch.last_time_step_indices().iter().enumerate() {
        if last >= steps {
            return Err(EngineError::ShapeMismatch {
                context: format!("last time step of example {}", i),
                expected: vec![steps],
                actual: vec![last + 1],
            }
            .into());
        }
        scores.row_mut(i).assign(&output.slice(s![sequence_of(i, sequences), .., last]));
    }
    Ok(scores)
}

impl<E: NetworkEngine> RnnForecaster<E> {
    pub fn new(config: ForecasterConfig) -> Self {
        let filters = FilterPipeline::from_type(config.filter_type);
        RnnForecaster {
            config,
            state: ForecasterState::Uninitialized,
            model: None,
            zero_r: None,
            filters,
            train_iterator: None,
            validation_data: None,
            listeners: Vec::new(),
            epochs_performed: 0,
        }
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Changes take effect at the next initialization
    pub fn config_mut(&mut self) -> &mut ForecasterConfig {
        &mut self.config
    }

    pub fn state(&self) -> ForecasterState {
        self.state
    }

    pub fn model(&self) -> Option<&E> {
        self.model.as_ref()
    }

    pub fn epochs_performed(&self) -> usize {
        self.epochs_performed
    }

    /// Whether the last build fell back to [`ZeroR`]
    pub fn is_zero_r(&self) -> bool {
        self.zero_r.is_some()
    }

    /// Attaches a listener alongside the built-in logging listener
    pub fn add_listener(&mut self, listener: Arc<dyn TrainingListener>) {
        self.listeners.push(listener);
        if let Some(model) = self.model.as_mut() {
            model.set_listeners(Self::all_listeners(self.config.log_frequency, &self.listeners));
        }
    }

    fn all_listeners(log_frequency: usize, extra: &[Arc<dyn TrainingListener>]) -> Vec<Arc<dyn TrainingListener>> {
        let mut listeners: Vec<Arc<dyn TrainingListener>> = vec![Arc::new(LoggingListener::new(log_frequency))];
        listeners.extend(extra.iter().cloned());
        listeners
    }

    /// Every attribute and class kind plus missing attribute values; missing
    /// class values are rejected.
    pub fn capabilities(&self) -> Capabilities {
        let mut result = Capabilities::new();
        result
            .disable_all()
            .enable_all()
            .disable(Capability::MissingClassValues)
            .set_minimum_instances(1);
        result
    }

    fn model_mut(&mut self) -> Result<&mut E> {
        self.model.as_mut().ok_or(ForecastError::NotInitialized)
    }

    fn stateful_layer_indices(model: &E) -> Vec<usize> {
        model
            .layers()
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.is_stateful())
            .map(|(i, _)| i)
            .collect()
    }

    /// Validates the data and layer layout, then builds the network and the
    /// training iterator. The epoch counter is reset to zero.
    pub fn initialize_classifier(&mut self, data: &Instances) -> Result<()> {
        self.capabilities().test_with_fail(data)?;

        match self.config.layers.last() {
            None => return Err(ForecastError::MissingOutputLayer("No layers have been added!".to_string())),
            Some(last) if !last.is_output() => {
                return Err(ForecastError::MissingOutputLayer(
                    "Last layer in network must be an output layer!".to_string(),
                ))
            }
            _ => {}
        }

        let _guard = ContextGuard::enter(EngineContext::seeded(self.config.seed));

        self.filters = FilterPipeline::from_type(self.config.filter_type);
        let data = self.filters.fit_transform(data)?;

        let validation_rows = self
            .config
            .early_stopping
            .as_ref()
            .map_or(0, |early| early.validation_rows(data.num_instances()));
        let (train, validation) = data.split_tail(validation_rows);
        self.validation_data = (!validation.is_empty()).then(|| Arc::new(validation));

        let instance_iterator = &self.config.instance_iterator;
        instance_iterator.validate(&train)?;

        let spec = NetworkSpec {
            n_in: train.num_attributes() - 1,
            n_out: train.num_classes(),
            layers: self.config.layers.clone(),
            updater: self.config.updater,
            clip_gradient: self.config.clip_gradient,
        };
        let mut model = E::build(&spec)?;
        let iterator = instance_iterator.data_set_iterator(Arc::new(train))?;

        model.set_listeners(Self::all_listeners(self.config.log_frequency, &self.listeners));

        info!(
            inputs = spec.n_in,
            outputs = spec.n_out,
            layers = spec.layers.len(),
            train_rows = iterator.total_examples(),
            validation_rows,
            batch_size = iterator.batch(),
            "initialized forecaster"
        );

        self.model = Some(model);
        self.train_iterator = Some(iterator);
        self.zero_r = None;
        self.epochs_performed = 0;
        self.state = ForecasterState::Initialized;
        Ok(())
    }

    /// One pass over the training data; returns the mean batch score
    pub fn train_epoch(&mut self) -> Result<f64> {
        let (Some(model), Some(iterator)) = (self.model.as_mut(), self.train_iterator.as_mut()) else {
            return Err(ForecastError::NotInitialized);
        };

        model.rnn_clear_previous_state();
        iterator.reset();

        let (mut total, mut batches) = (0.0, 0usize);
        for batch in iterator.by_ref() {
            total += model.fit(&batch)?;
            batches += 1;
        }
        let score = if batches == 0 { 0.0 } else { total / batches as f64 };

        model.epoch_done(self.epochs_performed, score);
        self.epochs_performed += 1;
        Ok(score)
    }

    /// Mean score over the held-out tail, if early stopping split one off
    pub fn validation_score(&self) -> Result<Option<f64>> {
        let (Some(model), Some(validation)) = (self.model.as_ref(), self.validation_data.as_ref()) else {
            return Ok(None);
        };

        let iterator = self.config.instance_iterator.data_set_iterator(Arc::clone(validation))?;
        let (mut total, mut batches) = (0.0, 0usize);
        for batch in iterator {
            total += model.score(&batch)?;
            batches += 1;
        }
        Ok((batches > 0).then(|| total / batches as f64))
    }

    /// Trains for the configured number of epochs, stopping early when the
    /// validation score stops improving. Data without predictor attributes
    /// gets a [`ZeroR`] model instead of a network.
    pub fn build_classifier(&mut self, data: &Instances) -> Result<()> {
        if data.num_attributes() < 2 {
            self.capabilities().test_with_fail(data)?;
            warn!("no predictor attributes, falling back to ZeroR");
            self.zero_r = Some(ZeroR::build(data)?);
            self.model = None;
            self.train_iterator = None;
            self.state = ForecasterState::Trained;
            return Ok(());
        }

        self.initialize_classifier(data)?;

        let mut stopper = match (&self.config.early_stopping, &self.validation_data) {
            (Some(early), Some(_)) => Some(EarlyStopper::new(early.clone())),
            _ => None,
        };

        for epoch in 0..self.config.num_epochs {
            let train_score = self.train_epoch()?;
            let Some(stopper) = stopper.as_mut() else {
                continue;
            };
            let Some(validation_score) = self.validation_score()? else {
                continue;
            };
            debug!(epoch, train_score, validation_score, "validation");

            let model = self.model.as_ref().ok_or(ForecastError::NotInitialized)?;
            if stopper.should_stop(epoch, validation_score, model) {
                info!(epoch, best_epoch = ?stopper.best_epoch(), "early stopping");
                break;
            }
        }

        if let Some(best) = stopper.as_mut().and_then(EarlyStopper::take_best_model) {
            info!(best_score = ?stopper.as_ref().and_then(EarlyStopper::best_score), "restoring best weights");
            self.model = Some(best);
        }

        self.model_mut()?.rnn_clear_previous_state();
        self.state = ForecasterState::Trained;
        Ok(())
    }

    /// Class scores for every row of `data`, in row order, `N × C`.
    ///
    /// Rows are fed through the incremental time step, so each call starts
    /// from, and advances, the carried state. On error the carried state is
    /// put back to what it was before the call.
    pub fn distributions_for_instances(&mut self, data: &Instances) -> Result<Array2<f64>> {
        if let Some(zero_r) = &self.zero_r {
            return Ok(zero_r.distributions_for_instances(data));
        }

        let snapshot = self.get_previous_state()?;
        match self.step_rows(data) {
            Ok(predictions) => {
                self.state = ForecasterState::Predicting;
                Ok(predictions)
            }
            Err(err) => {
                if let Err(restore) = self.set_previous_state(snapshot) {
                    warn!(error = %restore, "failed to restore recurrent state");
                }
                Err(err)
            }
        }
    }

    fn step_rows(&mut self, data: &Instances) -> Result<Array2<f64>> {
        let data = self.filters.transform(data)?;
        let num_classes = data.num_classes();
        let num_instances = data.num_instances();
        let nominal_class = data.class_attribute().map_or(false, |class| class.is_nominal());

        let mut iterator = self.config.instance_iterator.data_set_iterator(Arc::new(data))?;
        if iterator.reset_supported() {
            iterator.reset();
        }

        let model = self.model.as_mut().ok_or(ForecastError::NotInitialized)?;
        let mut predictions = Array2::zeros((num_instances, num_classes));
        let mut offset = 0;

        for batch in iterator {
            let output = model.rnn_time_step(&batch.features)?;
            let scores = last_step_scores(&output, &batch, num_classes)?;
            let rows = scores.nrows().min(num_instances.saturating_sub(offset));
            predictions
                .slice_mut(s![offset..offset + rows, ..])
                .assign(&scores.slice(s![..rows, ..]));
            offset += batch.num_examples();
        }

        if self.config.normalize_distributions && nominal_class {
            for mut row in predictions.rows_mut() {
                if let Some(values) = row.as_slice_mut() {
                    normalize(values);
                }
            }
        }
        Ok(predictions)
    }

    /// Feeds `history` through the model to build up carried state,
    /// discarding the predictions.
    pub fn prime(&mut self, history: &Instances) -> Result<()> {
        self.clear_previous_state()?;
        self.distributions_for_instances(history)?;
        debug!(rows = history.num_instances(), "primed forecaster");
        Ok(())
    }

    /// Multi-step forecast. `seed` is predicted first; afterwards `advance`
    /// turns the last input and its prediction into the next input, usually a
    /// single row. Returns the prediction for the final row of each step.
    pub fn forecast<F>(&mut self, seed: &Instances, steps: usize, mut advance: F) -> Result<Vec<Vec<f64>>>
    where
        F: FnMut(&Instances, &[f64]) -> Result<Instances>,
    {
        let mut forecasts = Vec::with_capacity(steps);
        let mut current = seed.clone();

        for step in 0..steps {
            let predictions = self.distributions_for_instances(&current)?;
            let last = predictions
                .rows()
                .into_iter()
                .last()
                .map(|row| row.to_vec())
                .ok_or_else(|| ForecastError::InvalidData("forecast input has no rows".to_string()))?;

            if step + 1 < steps {
                current = advance(&current, &last)?;
            }
            forecasts.push(last);
        }
        Ok(forecasts)
    }
}

impl<E: NetworkEngine> StateDependentPredictor for RnnForecaster<E> {
    type State = RecurrentState;

    /// One entry per stateful layer in declaration order; empty maps for
    /// layers that have not run yet.
    fn get_previous_state(&self) -> Result<RecurrentState> {
        let model = self.model.as_ref().ok_or(ForecastError::NotInitialized)?;
        Self::stateful_layer_indices(model)
            .into_iter()
            .map(|index| model.rnn_get_previous_state(index).map_err(ForecastError::from))
            .collect()
    }

    /// Entry `k` goes to the `k`-th stateful layer
    fn set_previous_state(&mut self, state: RecurrentState) -> Result<()> {
        let model = self.model_mut()?;
        let indices = Self::stateful_layer_indices(model);
        if indices.len() != state.len() {
            return Err(EngineError::StateCount { expected: indices.len(), actual: state.len() }.into());
        }

        for (index, layer_state) in indices.into_iter().zip(state) {
            model.rnn_set_previous_state(index, layer_state)?;
        }
        Ok(())
    }

    fn clear_previous_state(&mut self) -> Result<()> {
        self.model_mut()?.rnn_clear_previous_state();
        Ok(())
    }
}

impl<E: NetworkEngine> BaseModelSerializer for RnnForecaster<E> {
    fn serialize_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let model = self.model.as_ref().ok_or(ForecastError::NotInitialized)?;
        model.save(path.as_ref())?;
        info!(path = %path.as_ref().display(), "saved model");
        Ok(())
    }

    /// Replaces the network; the layer configuration follows the loaded model
    fn load_serialized_model<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut model = E::restore(path.as_ref())?;
        model.set_listeners(Self::all_listeners(self.config.log_frequency, &self.listeners));
        info!(path = %path.as_ref().display(), "loaded model");

        self.config.layers = model.layers().to_vec();
        self.model = Some(model);
        self.zero_r = None;
        self.state = ForecasterState::Trained;
        Ok(())
    }

    fn serialize_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        StatePersistence::save(&self.get_previous_state()?, path)?;
        Ok(())
    }

    fn load_serialized_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let state = StatePersistence::load(path)?;
        self.set_previous_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Attribute, MISSING};
    use crate::layers::Layer;
    use crate::loss::LossFn;

    fn series(rows: usize) -> Instances {
        let data = (0..rows)
            .map(|i| {
                let x = i as f64 * 0.2;
                vec![x.sin(), x.cos(), (x + 0.2).sin()]
            })
            .collect();
        Instances::from_rows(
            "wave",
            vec![Attribute::numeric("sin"), Attribute::numeric("cos"), Attribute::numeric("next")],
            data,
        )
        .and_then(|data| data.with_class_index(2))
        .unwrap()
    }

    fn forecaster(epochs: usize) -> RnnForecaster {
        RnnForecaster::new(
            ForecasterConfig::default()
                .with_layers(vec![Layer::lstm(6), Layer::output(LossFn::Mse)])
                .with_num_epochs(epochs)
                .with_batch_size(8),
        )
    }

    #[test]
    fn test_initialize_resets_epochs() {
        let mut forecaster = forecaster(2);
        forecaster.build_classifier(&series(20)).unwrap();
        assert_eq!(forecaster.epochs_performed(), 2);

        forecaster.initialize_classifier(&series(20)).unwrap();
        assert_eq!(forecaster.epochs_performed(), 0);
        assert_eq!(forecaster.state(), ForecasterState::Initialized);
    }

    #[test]
    fn test_missing_class_value_fails_capabilities() {
        let mut data = series(5);
        data.push(vec![0.1, 0.2, MISSING]).unwrap();
        let err = forecaster(1).initialize_classifier(&data).unwrap_err();
        assert!(matches!(err, ForecastError::Capability(_)));
    }

    #[test]
    fn test_last_layer_must_be_output() {
        let mut forecaster: RnnForecaster =
            RnnForecaster::new(ForecasterConfig::default().with_layers(vec![Layer::lstm(4)]));
        let err = forecaster.initialize_classifier(&series(5)).unwrap_err();
        assert_eq!(err.to_string(), "missing output layer: Last layer in network must be an output layer!");
    }

    #[test]
    fn test_train_epoch_requires_initialization() {
        let mut forecaster = forecaster(1);
        assert!(matches!(forecaster.train_epoch(), Err(ForecastError::NotInitialized)));
        assert!(matches!(forecaster.get_previous_state(), Err(ForecastError::NotInitialized)));
    }

    #[test]
    fn test_zero_r_fallback_without_predictors() {
        let data = Instances::from_rows("level", vec![Attribute::numeric("level")], vec![vec![1.0], vec![3.0]])
            .and_then(|data| data.with_class_index(0))
            .unwrap();
        let mut forecaster = forecaster(3);
        forecaster.build_classifier(&data).unwrap();

        assert!(forecaster.is_zero_r());
        let predictions = forecaster.distributions_for_instances(&data).unwrap();
        assert_eq!(predictions.dim(), (2, 1));
        assert!((predictions[[1, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_early_stopping_holds_out_tail() {
        let mut forecaster = RnnForecaster::<RecurrentNetwork>::new(
            ForecasterConfig::default()
                .with_layers(vec![Layer::gru(4), Layer::output(LossFn::Mse)])
                .with_num_epochs(5)
                .with_early_stopping(crate::classifiers::EarlyStoppingConfig {
                    patience: 1,
                    validation_split_percentage: 20.0,
                    ..Default::default()
                }),
        );
        forecaster.initialize_classifier(&series(50)).unwrap();
        assert_eq!(forecaster.train_iterator.as_ref().map(|it| it.total_examples()), Some(40));
        assert!(forecaster.validation_score().unwrap().is_some());

        forecaster.build_classifier(&series(50)).unwrap();
        assert!(forecaster.epochs_performed() >= 1 && forecaster.epochs_performed() <= 5);
        assert_eq!(forecaster.state(), ForecasterState::Trained);
    }

    #[test]
    fn test_scores_follow_mask_arg_max_not_example_index() {
        // output[0, c, t] = 10 * t + c
        let output = Array3::from_shape_fn((1, 2, 4), |(_, c, t)| (10 * t + c) as f64);
        let mask = ndarray::arr2(&[
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
        ]);
        let batch = DataSet::with_labels_mask(Array3::zeros((1, 1, 4)), Array3::zeros((1, 2, 4)), mask.view());

        let scores = last_step_scores(&output, &batch, 2).unwrap();
        assert_eq!(scores, ndarray::arr2(&[[30.0, 31.0], [10.0, 11.0], [10.0, 11.0]]));
    }

    #[test]
    fn test_scores_reject_bad_output_shapes() {
        let output = Array3::zeros((1, 2, 3));
        let batch = DataSet {
            features: Array3::zeros((1, 1, 3)),
            labels: Array3::zeros((1, 2, 3)),
            last_time_steps: vec![0, 3],
        };
        let err = last_step_scores(&output, &batch, 2).unwrap_err();
        assert!(matches!(err, ForecastError::Engine(EngineError::ShapeMismatch { .. })));

        let err = last_step_scores(&output, &batch, 5).unwrap_err();
        assert!(matches!(err, ForecastError::Engine(EngineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_forecast_advances_one_row_at_a_time() {
        let mut forecaster = forecaster(2);
        let data = series(30);
        forecaster.build_classifier(&data).unwrap();
        forecaster.prime(&data.slice(0..29)).unwrap();

        let seed = data.slice(29..30);
        let mut inputs_seen = Vec::new();
        let forecasts = forecaster
            .forecast(&seed, 4, |current, prediction| {
                inputs_seen.push(current.num_instances());
                let mut next = current.empty_copy();
                next.push(vec![prediction[0], current.row(0)[1], MISSING])?;
                Ok(next)
            })
            .unwrap();

        assert_eq!(forecasts.len(), 4);
        assert!(forecasts.iter().all(|f| f.len() == 1 && f[0].is_finite()));
        assert_eq!(inputs_seen, vec![1, 1, 1]);
    }
}
