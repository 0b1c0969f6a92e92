use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::instances::{is_missing, Instances};
use crate::error::{ForecastError, Result};
use crate::iterators::dataset::{pack_rows, DataSet};

/// Resettable, cursor-based batch iterator over a time series.
///
/// Each call to [`next_batch`](Self::next_batch) packs the next contiguous
/// rows into a [`DataSet`] and advances the cursor by the number of rows
/// actually returned. Running past the end yields shorter or empty batches,
/// never an error.
#[derive(Clone, Debug)]
pub struct TimeseriesDataSetIterator {
    data: Arc<Instances>,
    class_index: usize,
    batch_size: usize,
    cursor: usize,
}

impl TimeseriesDataSetIterator {
    pub fn new(data: Arc<Instances>, batch_size: usize) -> Result<Self> {
        let class_index = data
            .class_index()
            .ok_or_else(|| ForecastError::InvalidData("class index is not set".to_string()))?;
        if batch_size == 0 {
            return Err(ForecastError::InvalidData("batch size must be positive".to_string()));
        }
        Ok(TimeseriesDataSetIterator { data, class_index, batch_size, cursor: 0 })
    }

    /// Next batch of at most `num` rows
    pub fn next_batch(&mut self, num: usize) -> DataSet {
        let batch = pack_rows(&self.data, self.class_index, self.cursor, num);
        self.cursor += batch.num_examples();
        batch
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.total_examples()
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn reset_supported(&self) -> bool {
        true
    }

    pub fn total_examples(&self) -> usize {
        self.data.num_instances()
    }

    /// Number of feature rows per time step (class excluded)
    pub fn input_columns(&self) -> usize {
        self.data.num_attributes() - 1
    }

    pub fn total_outcomes(&self) -> usize {
        self.data.num_classes()
    }

    pub fn batch(&self) -> usize {
        self.batch_size
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Sorted distinct target values over the whole data, for reporting.
    /// Missing targets are skipped.
    pub fn labels(&self) -> Vec<String> {
        let mut values: Vec<f64> = (0..self.data.num_instances())
            .filter_map(|row| self.data.class_value(row))
            .filter(|v| !is_missing(*v))
            .collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup_by(|a, b| a.total_cmp(b).is_eq());
        values.into_iter().map(|v| v.to_string()).collect()
    }
}

impl Iterator for TimeseriesDataSetIterator {
    type Item = DataSet;

    fn next(&mut self) -> Option<DataSet> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_batch(self.batch_size))
    }
}

/// Configures how instances are turned into a [`TimeseriesDataSetIterator`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeseriesInstanceIterator {
    pub batch_size: usize,
}

impl Default for TimeseriesInstanceIterator {
    fn default() -> Self {
        TimeseriesInstanceIterator { batch_size: 1 }
    }
}

impl TimeseriesInstanceIterator {
    pub fn new(batch_size: usize) -> Self {
        TimeseriesInstanceIterator { batch_size }
    }

    pub fn validate(&self, data: &Instances) -> Result<()> {
        if data.class_index().is_none() {
            return Err(ForecastError::InvalidData("class index is not set".to_string()));
        }
        if data.num_attributes() < 2 {
            return Err(ForecastError::InvalidData(
                "at least one attribute besides the class is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_set_iterator(&self, data: Arc<Instances>) -> Result<TimeseriesDataSetIterator> {
        self.validate(&data)?;
        TimeseriesDataSetIterator::new(data, self.batch_size)
    }
}
