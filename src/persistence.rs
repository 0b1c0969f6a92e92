use serde::{de::DeserializeOwned, Deserialize, Serialize};
use ndarray::{Array2, Dimension};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::layers::gru_cell::GRUCell;
use crate::layers::linear::LinearLayer;
use crate::layers::lstm_cell::LSTMCell;
use crate::layers::Activation;
use crate::loss::LossFn;
use crate::models::engine::{NetworkSpec, RecurrentState};
use crate::models::recurrent_network::{NetworkLayer, RecurrentNetwork};

/// Errors that can occur during model or state persistence
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The file decoded but its content is not a usable model or state
    #[error("Format error: {0}")]
    Format(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(error: serde_json::Error) -> Self {
        PersistenceError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for PersistenceError {
    fn from(error: bincode::Error) -> Self {
        PersistenceError::Serialization(error.to_string())
    }
}

/// Serializable version of Array2<f64> for persistence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray2 {
    data: Vec<f64>,
    shape: (usize, usize),
}

impl From<&Array2<f64>> for SerializableArray2 {
    fn from(array: &Array2<f64>) -> Self {
        Self {
            data: array.iter().cloned().collect(),
            shape: array.raw_dim().into_pattern(),
        }
    }
}

impl TryFrom<SerializableArray2> for Array2<f64> {
    type Error = PersistenceError;

    fn try_from(value: SerializableArray2) -> Result<Self, Self::Error> {
        Array2::from_shape_vec(value.shape, value.data)
            .map_err(|err| PersistenceError::Format(format!("cannot rebuild matrix: {}", err)))
    }
}

fn restore_matrix(name: &str, value: SerializableArray2, expected: (usize, usize)) -> Result<Array2<f64>, PersistenceError> {
    let matrix = Array2::try_from(value)?;
    if matrix.dim() != expected {
        return Err(PersistenceError::Format(format!(
            "'{}' has shape {:?}, expected {:?}",
            name,
            matrix.dim(),
            expected
        )));
    }
    Ok(matrix)
}

/// Serializable fully connected layer
#[derive(Serialize, Deserialize)]
pub struct SerializableLinear {
    weight: SerializableArray2,
    bias: SerializableArray2,
}

impl From<&LinearLayer> for SerializableLinear {
    fn from(layer: &LinearLayer) -> Self {
        Self {
            weight: (&layer.weight).into(),
            bias: (&layer.bias).into(),
        }
    }
}

impl TryFrom<SerializableLinear> for LinearLayer {
    type Error = PersistenceError;

    fn try_from(value: SerializableLinear) -> Result<Self, Self::Error> {
        let weight = Array2::try_from(value.weight)?;
        let bias = restore_matrix("bias", value.bias, (weight.nrows(), 1))?;
        Ok(LinearLayer::from_weights(weight, bias))
    }
}

/// Serializable LSTM cell parameters
#[derive(Serialize, Deserialize)]
pub struct SerializableLSTMCell {
    w_ih: SerializableArray2,
    w_hh: SerializableArray2,
    b_ih: SerializableArray2,
    b_hh: SerializableArray2,
    hidden_size: usize,
    activation: Activation,
}

impl From<&LSTMCell> for SerializableLSTMCell {
    fn from(cell: &LSTMCell) -> Self {
        Self {
            w_ih: (&cell.w_ih).into(),
            w_hh: (&cell.w_hh).into(),
            b_ih: (&cell.b_ih).into(),
            b_hh: (&cell.b_hh).into(),
            hidden_size: cell.hidden_size,
            activation: cell.activation,
        }
    }
}

impl TryFrom<SerializableLSTMCell> for LSTMCell {
    type Error = PersistenceError;

    fn try_from(value: SerializableLSTMCell) -> Result<Self, Self::Error> {
        let h = value.hidden_size;
        let w_ih = Array2::try_from(value.w_ih)?;
        if w_ih.nrows() != 4 * h {
            return Err(PersistenceError::Format(format!("'w_ih' has {} rows, expected {}", w_ih.nrows(), 4 * h)));
        }
        Ok(LSTMCell {
            w_ih,
            w_hh: restore_matrix("w_hh", value.w_hh, (4 * h, h))?,
            b_ih: restore_matrix("b_ih", value.b_ih, (4 * h, 1))?,
            b_hh: restore_matrix("b_hh", value.b_hh, (4 * h, 1))?,
            hidden_size: h,
            activation: value.activation,
        })
    }
}

/// Serializable GRU cell parameters, gate order reset, update, new
#[derive(Serialize, Deserialize)]
pub struct SerializableGRUCell {
    input_weights: [SerializableArray2; 3],
    hidden_weights: [SerializableArray2; 3],
    input_biases: [SerializableArray2; 3],
    hidden_biases: [SerializableArray2; 3],
    hidden_size: usize,
    activation: Activation,
}

impl From<&GRUCell> for SerializableGRUCell {
    fn from(cell: &GRUCell) -> Self {
        Self {
            input_weights: [(&cell.w_ir).into(), (&cell.w_iz).into(), (&cell.w_ih).into()],
            hidden_weights: [(&cell.w_hr).into(), (&cell.w_hz).into(), (&cell.w_hh).into()],
            input_biases: [(&cell.b_ir).into(), (&cell.b_iz).into(), (&cell.b_ih).into()],
            hidden_biases: [(&cell.b_hr).into(), (&cell.b_hz).into(), (&cell.b_hh).into()],
            hidden_size: cell.hidden_size,
            activation: cell.activation,
        }
    }
}

impl TryFrom<SerializableGRUCell> for GRUCell {
    type Error = PersistenceError;

    fn try_from(value: SerializableGRUCell) -> Result<Self, Self::Error> {
        let h = value.hidden_size;
        let [w_ir, w_iz, w_ih] = value.input_weights;
        let [w_hr, w_hz, w_hh] = value.hidden_weights;
        let [b_ir, b_iz, b_ih] = value.input_biases;
        let [b_hr, b_hz, b_hh] = value.hidden_biases;

        let w_ir = Array2::try_from(w_ir)?;
        let input_shape = (h, w_ir.ncols());
        if w_ir.nrows() != h {
            return Err(PersistenceError::Format(format!("'w_ir' has {} rows, expected {}", w_ir.nrows(), h)));
        }

        Ok(GRUCell {
            w_ir,
            w_hr: restore_matrix("w_hr", w_hr, (h, h))?,
            b_ir: restore_matrix("b_ir", b_ir, (h, 1))?,
            b_hr: restore_matrix("b_hr", b_hr, (h, 1))?,
            w_iz: restore_matrix("w_iz", w_iz, input_shape)?,
            w_hz: restore_matrix("w_hz", w_hz, (h, h))?,
            b_iz: restore_matrix("b_iz", b_iz, (h, 1))?,
            b_hz: restore_matrix("b_hz", b_hz, (h, 1))?,
            w_ih: restore_matrix("w_ih", w_ih, input_shape)?,
            w_hh: restore_matrix("w_hh", w_hh, (h, h))?,
            b_ih: restore_matrix("b_ih", b_ih, (h, 1))?,
            b_hh: restore_matrix("b_hh", b_hh, (h, 1))?,
            hidden_size: h,
            activation: value.activation,
        })
    }
}

/// Learned parameters of one network layer
#[derive(Serialize, Deserialize)]
pub enum SerializableLayer {
    Dense { linear: SerializableLinear, activation: Activation },
    Lstm(SerializableLSTMCell),
    Gru(SerializableGRUCell),
    Output { linear: SerializableLinear, activation: Activation, loss: LossFn },
}

impl From<&NetworkLayer> for SerializableLayer {
    fn from(layer: &NetworkLayer) -> Self {
        match layer {
            NetworkLayer::Dense { linear, activation } => SerializableLayer::Dense {
                linear: linear.into(),
                activation: *activation,
            },
            NetworkLayer::Lstm(cell) => SerializableLayer::Lstm(cell.into()),
            NetworkLayer::Gru(cell) => SerializableLayer::Gru(cell.into()),
            NetworkLayer::Output { linear, activation, loss } => SerializableLayer::Output {
                linear: linear.into(),
                activation: *activation,
                loss: *loss,
            },
        }
    }
}

impl TryFrom<SerializableLayer> for NetworkLayer {
    type Error = PersistenceError;

    fn try_from(value: SerializableLayer) -> Result<Self, Self::Error> {
        Ok(match value {
            SerializableLayer::Dense { linear, activation } => NetworkLayer::Dense {
                linear: linear.try_into()?,
                activation,
            },
            SerializableLayer::Lstm(cell) => NetworkLayer::Lstm(cell.try_into()?),
            SerializableLayer::Gru(cell) => NetworkLayer::Gru(cell.try_into()?),
            SerializableLayer::Output { linear, activation, loss } => NetworkLayer::Output {
                linear: linear.try_into()?,
                activation,
                loss,
            },
        })
    }
}

/// Serializable recurrent network: its declaration plus learned weights
#[derive(Serialize, Deserialize)]
pub struct SerializableNetwork {
    spec: NetworkSpec,
    layers: Vec<SerializableLayer>,
}

impl From<&RecurrentNetwork> for SerializableNetwork {
    fn from(network: &RecurrentNetwork) -> Self {
        Self {
            spec: network.spec().clone(),
            layers: network.network_layers().iter().map(SerializableLayer::from).collect(),
        }
    }
}

impl TryFrom<SerializableNetwork> for RecurrentNetwork {
    type Error = PersistenceError;

    fn try_from(value: SerializableNetwork) -> Result<Self, Self::Error> {
        let layers = value
            .layers
            .into_iter()
            .map(NetworkLayer::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        RecurrentNetwork::from_layers(value.spec, layers).map_err(|err| PersistenceError::Format(err.to_string()))
    }
}

/// Model metadata for tracking training information
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelMetadata {
    pub model_name: String,
    pub version: String,
    pub created_at: String,
    pub input_size: usize,
    pub output_size: usize,
    pub num_layers: usize,
    pub total_epochs: usize,
    pub final_loss: Option<f64>,
    pub description: Option<String>,
}

/// Complete saved model including network and metadata
#[derive(Serialize, Deserialize)]
pub struct SavedModel {
    pub network: SerializableNetwork,
    pub metadata: ModelMetadata,
}

/// Saved recurrent state, one record per stateful layer
#[derive(Serialize, Deserialize)]
pub struct SavedState {
    pub version: String,
    pub created_at: String,
    pub layers: Vec<BTreeMap<String, SerializableArray2>>,
}

/// On-disk encoding, chosen by file extension
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Binary,
}

impl FileFormat {
    /// `.json` is JSON, anything else is bincode
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => FileFormat::Json,
            _ => FileFormat::Binary,
        }
    }
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    let mut temp = path.to_path_buf();
    temp.set_file_name(name);
    temp
}

/// Writes `bytes` to a sibling temporary file, then renames it over `path`,
/// so a failed write never leaves a truncated target behind.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let temp = temporary_sibling(path);
    let written = File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written.and_then(|_| fs::rename(&temp, path)) {
        let _ = fs::remove_file(&temp);
        return Err(err.into());
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T, format: FileFormat) -> Result<Vec<u8>, PersistenceError> {
    Ok(match format {
        FileFormat::Json => serde_json::to_string_pretty(value)?.into_bytes(),
        FileFormat::Binary => bincode::serialize(value)?,
    })
}

fn decode<T: DeserializeOwned>(path: &Path, format: FileFormat) -> Result<T, PersistenceError> {
    let mut file = File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(match format {
        FileFormat::Json => serde_json::from_slice(&contents)?,
        FileFormat::Binary => bincode::deserialize(&contents)?,
    })
}

/// Model persistence operations
pub struct ModelPersistence;

impl ModelPersistence {
    /// Save model to JSON format (human-readable)
    pub fn save_to_json<P: AsRef<Path>>(model: &SavedModel, path: P) -> Result<(), PersistenceError> {
        write_atomically(path.as_ref(), &encode(model, FileFormat::Json)?)
    }

    /// Load model from JSON format
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<SavedModel, PersistenceError> {
        decode(path.as_ref(), FileFormat::Json)
    }

    /// Save model to binary format (compact and fast)
    pub fn save_to_binary<P: AsRef<Path>>(model: &SavedModel, path: P) -> Result<(), PersistenceError> {
        write_atomically(path.as_ref(), &encode(model, FileFormat::Binary)?)
    }

    /// Load model from binary format
    pub fn load_from_binary<P: AsRef<Path>>(path: P) -> Result<SavedModel, PersistenceError> {
        decode(path.as_ref(), FileFormat::Binary)
    }

    /// Describe a network as it is now
    pub fn describe(network: &RecurrentNetwork, model_name: String, description: Option<String>) -> ModelMetadata {
        ModelMetadata {
            model_name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            input_size: network.spec().n_in,
            output_size: network.num_outputs(),
            num_layers: network.spec().layers.len(),
            total_epochs: network.epochs_performed(),
            final_loss: network.last_score(),
            description,
        }
    }

    /// Create a model with metadata
    pub fn create_saved_model(
        network: &RecurrentNetwork,
        model_name: String,
        description: Option<String>,
    ) -> SavedModel {
        SavedModel {
            network: network.into(),
            metadata: ModelPersistence::describe(network, model_name, description),
        }
    }
}

/// Convenience trait for easy model saving/loading
pub trait PersistentModel {
    /// Metadata describing the model as it is now
    fn metadata(&self) -> ModelMetadata;

    /// Save model with explicit metadata (format determined by file extension)
    fn save_with_metadata<P: AsRef<Path>>(&self, path: P, metadata: ModelMetadata) -> Result<(), PersistenceError>;

    /// Save model to file (format determined by file extension)
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistenceError> {
        self.save_with_metadata(path, self.metadata())
    }

    /// Load model from file (format determined by file extension)
    fn load<P: AsRef<Path>>(path: P) -> Result<(Self, ModelMetadata), PersistenceError>
    where
        Self: Sized;
}

impl PersistentModel for RecurrentNetwork {
    fn metadata(&self) -> ModelMetadata {
        ModelPersistence::describe(self, "rnn-forecaster".to_string(), None)
    }

    fn save_with_metadata<P: AsRef<Path>>(&self, path: P, metadata: ModelMetadata) -> Result<(), PersistenceError> {
        let saved_model = SavedModel {
            network: self.into(),
            metadata,
        };

        let path = path.as_ref();
        debug!(path = %path.display(), "saving model");
        match FileFormat::from_path(path) {
            FileFormat::Json => ModelPersistence::save_to_json(&saved_model, path),
            FileFormat::Binary => ModelPersistence::save_to_binary(&saved_model, path),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<(Self, ModelMetadata), PersistenceError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading model");
        let saved_model = match FileFormat::from_path(path) {
            FileFormat::Json => ModelPersistence::load_from_json(path)?,
            FileFormat::Binary => ModelPersistence::load_from_binary(path)?,
        };

        Ok((saved_model.network.try_into()?, saved_model.metadata))
    }
}

/// Recurrent state persistence, independent of the model file
pub struct StatePersistence;

impl StatePersistence {
    pub fn save<P: AsRef<Path>>(state: &RecurrentState, path: P) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let saved = SavedState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            layers: state
                .iter()
                .map(|layer| layer.iter().map(|(name, tensor)| (name.clone(), tensor.into())).collect())
                .collect(),
        };

        debug!(path = %path.display(), layers = saved.layers.len(), "saving recurrent state");
        write_atomically(path, &encode(&saved, FileFormat::from_path(path))?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<RecurrentState, PersistenceError> {
        let path = path.as_ref();
        let saved: SavedState = decode(path, FileFormat::from_path(path))?;
        debug!(path = %path.display(), layers = saved.layers.len(), "loaded recurrent state");

        saved
            .layers
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .map(|(name, tensor)| Array2::try_from(tensor).map(|tensor| (name, tensor)))
                    .collect::<Result<_, PersistenceError>>()
            })
            .collect()
    }
}

/// Model and state persistence for a forecaster. The two artifacts are
/// independent: a state file can be replayed into any compatible model.
pub trait BaseModelSerializer {
    fn serialize_model<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<()>;

    fn load_serialized_model<P: AsRef<Path>>(&mut self, path: P) -> crate::error::Result<()>;

    fn serialize_state<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<()>;

    fn load_serialized_state<P: AsRef<Path>>(&mut self, path: P) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, HIDDEN_STATE};
    use crate::models::engine::{LayerState, NetworkEngine};
    use crate::optimizers::Updater;
    use ndarray::{arr2, Array3};
    use tempfile::tempdir;

    fn network() -> RecurrentNetwork {
        RecurrentNetwork::build(&NetworkSpec {
            n_in: 3,
            n_out: 2,
            layers: vec![Layer::gru(4), Layer::lstm(3), Layer::output(LossFn::Mse)],
            updater: Updater::default(),
            clip_gradient: None,
        })
        .unwrap()
    }

    #[test]
    fn test_serializable_array_rejects_bad_shape() {
        let broken = SerializableArray2 { data: vec![1.0, 2.0, 3.0], shape: (2, 2) };
        assert!(matches!(Array2::try_from(broken), Err(PersistenceError::Format(_))));
    }

    #[test]
    fn test_file_format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("model.json")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("model.bin")), FileFormat::Binary);
        assert_eq!(FileFormat::from_path(Path::new("model")), FileFormat::Binary);
    }

    #[test]
    fn test_binary_round_trip_is_exact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.bin");
        let mut original = network();
        PersistentModel::save(&original, &path).unwrap();

        let (mut restored, metadata) = <RecurrentNetwork as PersistentModel>::load(&path).unwrap();
        assert_eq!(metadata.input_size, 3);
        assert_eq!(metadata.output_size, 2);
        assert_eq!(metadata.num_layers, 3);

        let input = Array3::from_elem((1, 3, 4), 0.25);
        assert_eq!(original.rnn_time_step(&input).unwrap(), restored.rnn_time_step(&input).unwrap());
        assert!(!dir.path().join("network.bin.tmp").exists());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.json");
        let mut original = network();
        PersistentModel::save(&original, &path).unwrap();

        let mut restored = <RecurrentNetwork as NetworkEngine>::restore(&path).unwrap();
        let input = Array3::from_elem((1, 3, 2), -0.5);
        let a = original.rnn_time_step(&input).unwrap();
        let b = restored.rnn_time_step(&input).unwrap();
        assert!((&a - &b).mapv(f64::abs).sum() < 1e-12);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = <RecurrentNetwork as PersistentModel>::load(dir.path().join("missing.bin"));
        assert!(matches!(result, Err(PersistenceError::Io(_))));
    }

    #[test]
    fn test_load_rejects_state_file_as_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        StatePersistence::save(&vec![LayerState::new()], &path).unwrap();

        let result = <RecurrentNetwork as PersistentModel>::load(&path);
        assert!(matches!(result, Err(PersistenceError::Serialization(_))));
    }

    #[test]
    fn test_state_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let mut layer = LayerState::new();
        layer.insert(HIDDEN_STATE.to_string(), arr2(&[[0.1], [-0.2]]));
        let state = vec![layer, LayerState::new()];
        StatePersistence::save(&state, &path).unwrap();

        assert_eq!(StatePersistence::load(&path).unwrap(), state);
    }
}
