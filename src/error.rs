//! Error types shared by the forecaster and the network engine.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Failures raised by a network engine while building the graph, running a
/// forward step or handling recurrent state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid network configuration: {0}")]
    InvalidConfiguration(String),

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("layer index {index} out of range for a network with {num_layers} layers")]
    LayerIndex { index: usize, num_layers: usize },

    #[error("layer {0} does not carry recurrent state")]
    NotStateful(usize),

    #[error("recurrent state for layer {layer} is missing tensor '{name}'")]
    MissingStateTensor { layer: usize, name: String },

    #[error("expected {expected} recurrent state entries, got {actual}")]
    StateCount { expected: usize, actual: usize },
}

/// Errors surfaced by the forecaster lifecycle.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Input data does not satisfy the forecaster's capabilities.
    #[error("capability violation: {0}")]
    Capability(String),

    /// No layers configured, or the terminal layer is not an output layer.
    #[error("missing output layer: {0}")]
    MissingOutputLayer(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("forecaster has not been initialized")]
    NotInitialized,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Result type for forecaster operations
pub type Result<T> = std::result::Result<T, ForecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forecast_error_display() {
        let err = ForecastError::MissingOutputLayer("No layers have been added!".to_string());
        assert!(format!("{}", err).contains("No layers have been added"));

        let err = ForecastError::Capability("missing class values".to_string());
        assert!(format!("{}", err).starts_with("capability violation"));

        let err: ForecastError = EngineError::StateCount { expected: 2, actual: 1 }.into();
        assert!(format!("{}", err).contains("expected 2 recurrent state entries, got 1"));
    }
}
