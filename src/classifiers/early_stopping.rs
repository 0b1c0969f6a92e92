use tracing::debug;

use crate::classifiers::config::EarlyStoppingConfig;

/// Tracks validation scores across epochs and keeps a copy of the best model
#[derive(Debug)]
pub struct EarlyStopper<M> {
    config: EarlyStoppingConfig,
    best_score: f64,
    best_epoch: Option<usize>,
    wait: usize,
    stopped_epoch: Option<usize>,
    best_model: Option<M>,
}

impl<M: Clone> EarlyStopper<M> {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        EarlyStopper {
            config,
            best_score: f64::INFINITY,
            best_epoch: None,
            wait: 0,
            stopped_epoch: None,
            best_model: None,
        }
    }

    /// Records `score` for `epoch` and returns whether training should stop
    pub fn should_stop(&mut self, epoch: usize, score: f64, model: &M) -> bool {
        if score < self.best_score - self.config.min_delta {
            debug!(epoch, score, previous = self.best_score, "validation score improved");
            self.best_score = score;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            if self.config.restore_best_weights {
                self.best_model = Some(model.clone());
            }
            return false;
        }

        self.wait += 1;
        if self.wait >= self.config.patience {
            self.stopped_epoch = Some(epoch);
            return true;
        }
        false
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.best_score)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// The model snapshot from the best epoch, if weights are being restored
    pub fn take_best_model(&mut self) -> Option<M> {
        self.best_model.take()
    }
}
