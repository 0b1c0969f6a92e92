/// Tabular, time-ordered instances.
pub mod instances;

/// Capability descriptors checked before training.
pub mod capabilities;

/// Preprocessing filters.
pub mod filters;

pub use capabilities::{Capabilities, Capability};
pub use filters::{Filter, FilterPipeline, FilterType};
pub use instances::{Attribute, AttributeKind, Instances, MISSING};
