use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::FilterType;
use crate::iterators::TimeseriesInstanceIterator;
use crate::layers::Layer;
use crate::optimizers::Updater;
use crate::persistence::PersistenceError;

/// Early stopping on a validation split taken from the end of the series
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before training stops
    pub patience: usize,
    /// Minimum decrease in validation score that counts as improvement
    pub min_delta: f64,
    pub restore_best_weights: bool,
    /// Share of the rows, in percent, held out for validation
    pub validation_split_percentage: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        EarlyStoppingConfig {
            patience: 5,
            min_delta: 0.0,
            restore_best_weights: true,
            validation_split_percentage: 10.0,
        }
    }
}

impl EarlyStoppingConfig {
    /// Number of trailing rows to hold out of `num_instances`; at least one
    /// row is always left for training.
    pub fn validation_rows(&self, num_instances: usize) -> usize {
        let requested = (num_instances as f64 * self.validation_split_percentage / 100.0).round();
        (requested.max(0.0) as usize).min(num_instances.saturating_sub(1))
    }
}

/// Hyperparameters of an [`RnnForecaster`](crate::classifiers::RnnForecaster)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecasterConfig {
    /// Network layers in order; the last one must be an output layer
    pub layers: Vec<Layer>,
    pub num_epochs: usize,
    pub instance_iterator: TimeseriesInstanceIterator,
    /// Seed of the engine context used while building the network
    pub seed: u64,
    pub updater: Updater,
    pub clip_gradient: Option<f64>,
    /// `None` disables early stopping
    pub early_stopping: Option<EarlyStoppingConfig>,
    pub filter_type: FilterType,
    /// Normalize predicted rows to sum to one (nominal classes only)
    pub normalize_distributions: bool,
    /// Iterations between score log lines
    pub log_frequency: usize,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        ForecasterConfig {
            layers: Vec::new(),
            num_epochs: 10,
            instance_iterator: TimeseriesInstanceIterator::default(),
            seed: 1,
            updater: Updater::default(),
            clip_gradient: Some(5.0),
            early_stopping: None,
            filter_type: FilterType::None,
            normalize_distributions: false,
            log_frequency: 10,
        }
    }
}

impl ForecasterConfig {
    pub fn with_layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.instance_iterator = TimeseriesInstanceIterator::new(batch_size);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_updater(mut self, updater: Updater) -> Self {
        self.updater = updater;
        self
    }

    pub fn with_clip_gradient(mut self, clip_gradient: Option<f64>) -> Self {
        self.clip_gradient = clip_gradient;
        self
    }

    pub fn with_early_stopping(mut self, early_stopping: EarlyStoppingConfig) -> Self {
        self.early_stopping = Some(early_stopping);
        self
    }

    pub fn with_filter_type(mut self, filter_type: FilterType) -> Self {
        self.filter_type = filter_type;
        self
    }

    pub fn with_normalize_distributions(mut self, normalize: bool) -> Self {
        self.normalize_distributions = normalize;
        self
    }

    pub fn with_log_frequency(mut self, log_frequency: usize) -> Self {
        self.log_frequency = log_frequency;
        self
    }

    /// Reads a JSON configuration; absent fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossFn;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ForecasterConfig::default();
        assert_eq!(config.num_epochs, 10);
        assert_eq!(config.instance_iterator.batch_size, 1);
        assert_eq!(config.seed, 1);
        assert_eq!(config.updater, Updater::Adam { learning_rate: 0.001 });
        assert_eq!(config.clip_gradient, Some(5.0));
        assert!(config.early_stopping.is_none());
        assert!(!config.normalize_distributions);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "num_epochs": 3, "instance_iterator": {{ "batch_size": 16 }} }}"#).unwrap();

        let config = ForecasterConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.instance_iterator.batch_size, 16);
        assert_eq!(config.seed, 1);
        assert!(config.layers.is_empty());
    }

    #[test]
    fn test_json_round_trip_with_layers() {
        let config = ForecasterConfig::default()
            .with_layers(vec![Layer::lstm(10), Layer::output(LossFn::Mse)])
            .with_early_stopping(EarlyStoppingConfig::default());
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ForecasterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rows_leave_training_data() {
        let early = EarlyStoppingConfig::default();
        assert_eq!(early.validation_rows(100), 10);
        assert_eq!(early.validation_rows(4), 0);
        assert_eq!(early.validation_rows(1), 0);

        let greedy = EarlyStoppingConfig { validation_split_percentage: 100.0, ..Default::default() };
        assert_eq!(greedy.validation_rows(5), 4);
    }
}
