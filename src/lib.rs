//! # RNN Forecaster
//!
//! Time-series forecasting with recurrent networks whose hidden state is
//! carried, snapshotted and replayed across prediction calls.
//!
//! ## Core Components
//!
//! - **Data**: typed [`Instances`] with capability checks and preprocessing filters
//! - **Iterators**: rows packed into `(sequences, features, time)` tensors with a
//!   validity mask marking each example's last time step
//! - **Forecaster**: [`RnnForecaster`] drives a [`NetworkEngine`] through
//!   initialize, train and predict, and exposes the recurrent state
//! - **Engine**: [`RecurrentNetwork`], an ndarray network of dense, LSTM, GRU and
//!   output layers trained with backpropagation through time
//! - **Persistence**: model and recurrent state saved independently as JSON or bincode
//!
//! ## Quick Start
//!
//! ```rust
//! use rnn_forecaster::{Attribute, ForecasterConfig, Instances, Layer, LossFn, RnnForecaster};
//! use rnn_forecaster::StateDependentPredictor;
//!
//! let rows = (0..40)
//!     .map(|t| {
//!         let x = t as f64 * 0.3;
//!         vec![x.sin(), (x + 0.3).sin()]
//!     })
//!     .collect();
//! let data = Instances::from_rows(
//!     "wave",
//!     vec![Attribute::numeric("value"), Attribute::numeric("next")],
//!     rows,
//! )?
//! .with_class_index(1)?;
//!
//! let config = ForecasterConfig::default()
//!     .with_layers(vec![Layer::lstm(8), Layer::output(LossFn::Mse)])
//!     .with_num_epochs(5);
//! let mut forecaster: RnnForecaster = RnnForecaster::new(config);
//! forecaster.build_classifier(&data)?;
//!
//! // Prime on the history, then predict the next step from the last row alone
//! forecaster.prime(&data.slice(0..39))?;
//! let next = forecaster.distributions_for_instances(&data.slice(39..40))?;
//! assert_eq!(next.dim(), (1, 1));
//! assert_eq!(forecaster.get_previous_state()?.len(), 1);
//! # Ok::<(), rnn_forecaster::ForecastError>(())
//! ```

pub mod classifiers;
pub mod context;
pub mod data;
pub mod error;
pub mod iterators;
pub mod layers;
pub mod loss;
pub mod models;
pub mod optimizers;
pub mod persistence;
pub mod utils;

// Re-export commonly used items
pub use classifiers::{
    EarlyStoppingConfig, ForecasterConfig, ForecasterState, RnnForecaster, StateDependentPredictor, ZeroR,
};
pub use context::{ContextGuard, EngineContext};
pub use data::{Attribute, AttributeKind, Capabilities, Capability, FilterType, Instances, MISSING};
pub use error::{EngineError, ForecastError, Result};
pub use iterators::{build_batch, DataSet, TimeseriesDataSetIterator, TimeseriesInstanceIterator};
pub use layers::{Activation, Layer};
pub use loss::{CrossEntropyLoss, LossFn, MAELoss, MSELoss};
pub use models::{LayerState, LoggingListener, NetworkEngine, NetworkSpec, RecurrentNetwork, RecurrentState, TrainingListener};
pub use optimizers::{Adam, RMSprop, Updater, SGD};
pub use persistence::{BaseModelSerializer, ModelMetadata, ModelPersistence, PersistenceError, PersistentModel, StatePersistence};
