/// Tensor batch building from rows.
pub mod dataset;

/// Cursor-based sequence iterators.
pub mod timeseries;

pub use dataset::{build_batch, DataSet};
pub use timeseries::{TimeseriesDataSetIterator, TimeseriesInstanceIterator};
