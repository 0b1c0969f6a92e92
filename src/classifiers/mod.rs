/// Forecaster configuration.
pub mod config;

/// Validation-based early stopping.
pub mod early_stopping;

/// The recurrent forecaster.
pub mod rnn_forecaster;

/// Fallback for data without predictor attributes.
pub mod zero_r;

pub use config::{EarlyStoppingConfig, ForecasterConfig};
pub use early_stopping::EarlyStopper;
pub use rnn_forecaster::{ForecasterState, RnnForecaster, StateDependentPredictor};
pub use zero_r::ZeroR;
