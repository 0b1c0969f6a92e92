/// The network engine contract.
pub mod engine;

/// Training progress listeners.
pub mod listeners;

/// Reference ndarray engine with LSTM and GRU layers.
pub mod recurrent_network;

pub use engine::{LayerState, NetworkEngine, NetworkSpec, RecurrentState};
pub use listeners::{LoggingListener, TrainingListener};
pub use recurrent_network::{NetworkLayer, RecurrentNetwork};
