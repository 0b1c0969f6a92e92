use ndarray::{Array1, Array2};

use crate::data::instances::{is_missing, Instances};
use crate::error::{ForecastError, Result};

/// Majority/mean predictor used when the data has no predictor attributes.
///
/// A numeric or date class predicts the mean of the observed class values; a
/// nominal class predicts Laplace-smoothed label frequencies.
#[derive(Clone, Debug, PartialEq)]
pub struct ZeroR {
    distribution: Array1<f64>,
}

impl ZeroR {
    pub fn build(data: &Instances) -> Result<Self> {
        let class_index = data
            .class_index()
            .ok_or_else(|| ForecastError::InvalidData("class index is not set".to_string()))?;
        let observed = data.rows().map(|row| row[class_index]).filter(|v| !is_missing(*v));

        let distribution = if data.attribute(class_index).is_nominal() {
            let mut counts = Array1::<f64>::ones(data.num_classes());
            for value in observed {
                if let Some(count) = counts.get_mut(value as usize) {
                    *count += 1.0;
                }
            }
            let total = counts.sum();
            counts / total
        } else {
            let (sum, n) = observed.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            let mean = if n == 0 { 0.0 } else { sum / n as f64 };
            Array1::from_elem(1, mean)
        };

        Ok(ZeroR { distribution })
    }

    pub fn distribution(&self) -> &Array1<f64> {
        &self.distribution
    }

    /// The same row for every instance
    pub fn distributions_for_instances(&self, data: &Instances) -> Array2<f64> {
        let mut predictions = Array2::zeros((data.num_instances(), self.distribution.len()));
        for mut row in predictions.rows_mut() {
            row.assign(&self.distribution);
        }
        predictions
    }
}
