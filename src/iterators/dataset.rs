use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::data::instances::{is_missing, Instances};
use crate::error::{ForecastError, Result};
use crate::utils::argmax;

/// One batch in the 3-D layout recurrent layers consume.
///
/// * `features`: `(sequences, num_features, time)`
/// * `labels`: `(sequences, num_classes, time)`
/// * `last_time_steps`: per example, the time column holding its last valid
///   step. This is the sparse form of the `(examples, time)` validity mask,
///   which has exactly one marked column per row.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSet {
    pub features: Array3<f64>,
    pub labels: Array3<f64>,
    pub last_time_steps: Vec<usize>,
}

impl DataSet {
    /// Builds a batch from a dense validity mask, keeping the arg-max column
    /// of each mask row.
    pub fn with_labels_mask(features: Array3<f64>, labels: Array3<f64>, labels_mask: ArrayView2<f64>) -> Self {
        let last_time_steps = labels_mask.axis_iter(Axis(0)).map(argmax).collect();
        DataSet { features, labels, last_time_steps }
    }

    pub fn num_examples(&self) -> usize {
        self.last_time_steps.len()
    }

    pub fn time_steps(&self) -> usize {
        self.features.len_of(Axis(2))
    }

    pub fn is_empty(&self) -> bool {
        self.num_examples() == 0
    }

    /// Per example, the time column its output is read from
    pub fn last_time_step_indices(&self) -> &[usize] {
        &self.last_time_steps
    }

    /// Distinct time columns some example reads its output from, ascending
    pub fn labelled_time_steps(&self) -> Vec<usize> {
        let mut steps = self.last_time_steps.clone();
        steps.sort_unstable();
        steps.dedup();
        steps
    }

    /// Dense `(examples, time)` validity mask. Allocates `examples × time`
    /// cells; the engine and forecaster only read
    /// [`last_time_step_indices`](Self::last_time_step_indices).
    pub fn labels_mask(&self) -> Array2<f64> {
        let mut mask = Array2::zeros((self.num_examples(), self.time_steps()));
        for (i, &t) in self.last_time_steps.iter().enumerate() {
            if let Some(cell) = mask.get_mut([i, t]) {
                *cell = 1.0;
            }
        }
        mask
    }
}

/// Packs rows `cursor..cursor + num` of `data` into a [`DataSet`].
///
/// The batch is a single sequence whose time axis runs over the selected
/// rows, so the feature tensor has shape `(1, num_attributes - 1, n)` where
/// `n` is the number of rows actually packed. Rows past the end of `data`
/// are not padded; the batch is simply shorter. Values are copied verbatim.
///
/// A numeric or date class is written as its raw value; a nominal class is
/// one-hot encoded over its labels, all zeros when the value is missing.
/// Example `i` is labelled at its own time column `i`.
pub fn build_batch(data: &Instances, cursor: usize, num: usize) -> Result<DataSet> {
    let class_index = data
        .class_index()
        .ok_or_else(|| ForecastError::InvalidData("class index is not set".to_string()))?;
    Ok(pack_rows(data, class_index, cursor, num))
}

pub(crate) fn pack_rows(data: &Instances, class_index: usize, cursor: usize, num: usize) -> DataSet {
    let start = cursor.min(data.num_instances());
    let end = cursor.saturating_add(num).min(data.num_instances());
    let batch_len = end - start;
    let num_features = data.num_attributes() - 1;
    let num_classes = data.num_classes();
    let nominal_class = data.attribute(class_index).is_nominal();

    let mut features = Array3::zeros((1, num_features, batch_len));
    let mut labels = Array3::zeros((1, num_classes, batch_len));

    for (i, row) in (start..end).map(|r| data.row(r)).enumerate() {
        let mut k = 0;
        for (j, &value) in row.iter().enumerate() {
            if j == class_index {
                continue;
            }
            features[[0, k, i]] = value;
            k += 1;
        }

        let outcome = row[class_index];
        if nominal_class {
            if is_missing(outcome) {
                continue;
            }
            if let Some(label) = labels.get_mut([0, outcome as usize, i]) {
                *label = 1.0;
            }
        } else {
            labels[[0, 0, i]] = outcome;
        }
    }

    DataSet { features, labels, last_time_steps: (0..batch_len).collect() }
}
