use std::fmt::Debug;

use tracing::{debug, info};

/// Receives training progress from a network engine
pub trait TrainingListener: Debug + Send + Sync {
    /// Called after every parameter update
    fn iteration_done(&self, _iteration: usize, _score: f64) {}

    /// Called once per completed epoch with the epoch's mean score
    fn epoch_done(&self, _epoch: usize, _score: f64) {}
}

/// Logs scores through `tracing`: every `frequency`-th iteration at debug
/// level and every epoch at info level.
#[derive(Debug, Clone)]
pub struct LoggingListener {
    frequency: usize,
}

impl LoggingListener {
    pub fn new(frequency: usize) -> Self {
        LoggingListener { frequency: frequency.max(1) }
    }
}

impl Default for LoggingListener {
    fn default() -> Self {
        LoggingListener::new(10)
    }
}

impl TrainingListener for LoggingListener {
    fn iteration_done(&self, iteration: usize, score: f64) {
        if iteration % self.frequency == 0 {
            debug!(iteration, score, "iteration done");
        }
    }

    fn epoch_done(&self, epoch: usize, score: f64) {
        info!(epoch, score, "epoch done");
    }
}
