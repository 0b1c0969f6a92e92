use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Loss function trait for training neural networks
pub trait LossFunction {
    /// Compute the loss between predictions and targets
    fn compute_loss(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> f64;

    /// Compute the gradient of the loss with respect to predictions
    fn compute_gradient(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64>;
}

/// Mean Squared Error loss function
pub struct MSELoss;

impl LossFunction for MSELoss {
    fn compute_loss(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> f64 {
        let diff = predictions - targets;
        let squared_diff = &diff * &diff;
        squared_diff.sum() / (predictions.len() as f64)
    }

    fn compute_gradient(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64> {
        let diff = predictions - targets;
        2.0 * diff / (predictions.len() as f64)
    }
}

/// Mean Absolute Error loss function
pub struct MAELoss;

impl LossFunction for MAELoss {
    fn compute_loss(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> f64 {
        let diff = predictions - targets;
        diff.map(|x| x.abs()).sum() / (predictions.len() as f64)
    }

    fn compute_gradient(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64> {
        let diff = predictions - targets;
        diff.map(|x| if *x > 0.0 { 1.0 } else if *x < 0.0 { -1.0 } else { 0.0 }) / (predictions.len() as f64)
    }
}

/// Multi-class cross-entropy over probabilities (one class per row,
/// one example per column). Pair with a softmax output activation.
pub struct CrossEntropyLoss;

const EPSILON: f64 = 1e-15;

impl LossFunction for CrossEntropyLoss {
    fn compute_loss(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> f64 {
        let log_preds = predictions.map(|p| (p + EPSILON).ln());
        -(targets * log_preds).sum() / (predictions.ncols() as f64)
    }

    fn compute_gradient(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64> {
        let inv = predictions.map(|p| -1.0 / (p + EPSILON));
        targets * inv / (predictions.ncols() as f64)
    }
}

/// Serializable choice of loss for an output layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFn {
    #[default]
    Mse,
    Mae,
    CrossEntropy,
}

impl LossFn {
    pub fn function(&self) -> &'static dyn LossFunction {
        match self {
            LossFn::Mse => &MSELoss,
            LossFn::Mae => &MAELoss,
            LossFn::CrossEntropy => &CrossEntropyLoss,
        }
    }
}

impl LossFunction for LossFn {
    fn compute_loss(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> f64 {
        self.function().compute_loss(predictions, targets)
    }

    fn compute_gradient(&self, predictions: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64> {
        self.function().compute_gradient(predictions, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_mse_loss() {
        let loss_fn = MSELoss;
        let predictions = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let targets = arr2(&[[1.5, 2.5], [2.5, 3.5]]);

        let loss = loss_fn.compute_loss(&predictions, &targets);
        assert!((loss - 0.25).abs() < 1e-6);

        let gradient = loss_fn.compute_gradient(&predictions, &targets);
        assert_eq!(gradient.shape(), predictions.shape());
    }

    #[test]
    fn test_mae_loss() {
        let loss_fn = MAELoss;
        let predictions = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let targets = arr2(&[[1.5, 2.5], [2.5, 4.0]]);

        let loss = loss_fn.compute_loss(&predictions, &targets);
        assert!((loss - 0.375).abs() < 1e-6);

        let gradient = loss_fn.compute_gradient(&predictions, &targets);
        assert_eq!(gradient, arr2(&[[-0.25, -0.25], [0.25, 0.0]]));
    }

    #[test]
    fn test_cross_entropy_prefers_correct_class() {
        let loss_fn = LossFn::CrossEntropy;
        let targets = arr2(&[[1.0], [0.0]]);
        let good = loss_fn.compute_loss(&arr2(&[[0.9], [0.1]]), &targets);
        let bad = loss_fn.compute_loss(&arr2(&[[0.1], [0.9]]), &targets);
        assert!(good < bad);

        let gradient = loss_fn.compute_gradient(&arr2(&[[0.5], [0.5]]), &targets);
        assert!(gradient[[0, 0]] < 0.0);
        assert_eq!(gradient[[1, 0]], 0.0);
    }
}
