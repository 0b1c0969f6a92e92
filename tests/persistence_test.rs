use rnn_forecaster::{
    Attribute, BaseModelSerializer, ForecastError, ForecasterConfig, Instances, Layer, LossFn, PersistenceError,
    PersistentModel, RecurrentNetwork, RnnForecaster, StateDependentPredictor,
};
use tempfile::tempdir;

fn wave(rows: usize) -> Instances {
    let data: Vec<Vec<f64>> = (0..rows)
        .map(|t| {
            let x = t as f64 * 0.2;
            vec![x.sin(), x.cos(), (x + 0.2).sin()]
        })
        .collect();
    Instances::from_rows(
        "wave",
        vec![Attribute::numeric("sin"), Attribute::numeric("cos"), Attribute::numeric("next")],
        data,
    )
    .and_then(|data| data.with_class_index(2))
    .unwrap()
}

fn config() -> ForecasterConfig {
    ForecasterConfig::default()
        .with_layers(vec![Layer::lstm(5), Layer::gru(4), Layer::output(LossFn::Mse)])
        .with_num_epochs(3)
        .with_batch_size(12)
}

fn trained() -> RnnForecaster {
    let mut forecaster: RnnForecaster = RnnForecaster::new(config());
    forecaster.build_classifier(&wave(48)).unwrap();
    forecaster
}

#[test]
fn test_binary_model_and_state_restore_exactly() {
    let dir = tempdir().unwrap();
    let model_path = dir.path().join("model.bin");
    let state_path = dir.path().join("state.bin");
    let data = wave(60);

    let mut original = trained();
    original.prime(&data.slice(0..48)).unwrap();
    original.serialize_model(&model_path).unwrap();
    original.serialize_state(&state_path).unwrap();
    let expected = original.distributions_for_instances(&data.slice(48..60)).unwrap();

    let mut restored: RnnForecaster = RnnForecaster::new(ForecasterConfig::default().with_batch_size(12));
    restored.load_serialized_model(&model_path).unwrap();
    restored.load_serialized_state(&state_path).unwrap();
    let actual = restored.distributions_for_instances(&data.slice(48..60)).unwrap();

    assert_eq!(restored.config().layers, config().layers);
    assert_eq!(expected, actual);
}

#[test]
fn test_state_replays_into_separately_loaded_model() {
    let dir = tempdir().unwrap();
    let model_path = dir.path().join("model.bin");
    let state_path = dir.path().join("state.bin");
    let data = wave(50);

    let mut forecaster = trained();
    forecaster.serialize_model(&model_path).unwrap();

    forecaster.prime(&data.slice(0..40)).unwrap();
    forecaster.serialize_state(&state_path).unwrap();
    let first = forecaster.distributions_for_instances(&data.slice(40..50)).unwrap();

    // Same model file, state written after the model
    let mut other: RnnForecaster = RnnForecaster::new(ForecasterConfig::default().with_batch_size(12));
    other.load_serialized_model(&model_path).unwrap();
    assert!(other.get_previous_state().unwrap().iter().all(|layer| layer.is_empty()));

    other.load_serialized_state(&state_path).unwrap();
    assert_eq!(other.get_previous_state().unwrap(), {
        let mut replay = trained();
        replay.prime(&data.slice(0..40)).unwrap();
        replay.get_previous_state().unwrap()
    });
    assert_eq!(other.distributions_for_instances(&data.slice(40..50)).unwrap(), first);
}

#[test]
fn test_json_model_restores_within_tolerance() {
    let dir = tempdir().unwrap();
    let model_path = dir.path().join("model.json");
    let state_path = dir.path().join("state.json");
    let data = wave(30);

    let mut original = trained();
    original.prime(&data.slice(0..20)).unwrap();
    original.serialize_model(&model_path).unwrap();
    original.serialize_state(&state_path).unwrap();
    let expected = original.distributions_for_instances(&data.slice(20..30)).unwrap();

    let text = std::fs::read_to_string(&model_path).unwrap();
    assert!(text.contains("\"metadata\""));

    let mut restored: RnnForecaster = RnnForecaster::new(ForecasterConfig::default());
    restored.load_serialized_model(&model_path).unwrap();
    restored.load_serialized_state(&state_path).unwrap();
    let actual = restored.distributions_for_instances(&data.slice(20..30)).unwrap();

    for (a, b) in expected.iter().zip(actual.iter()) {
        approx::assert_relative_eq!(a, b, epsilon = 1e-9);
    }
}

#[test]
fn test_state_file_from_wrong_layout_is_rejected() {
    let dir = tempdir().unwrap();
    let state_path = dir.path().join("state.bin");

    let mut two_layers = trained();
    two_layers.distributions_for_instances(&wave(5)).unwrap();
    two_layers.serialize_state(&state_path).unwrap();

    let mut one_layer: RnnForecaster = RnnForecaster::new(
        ForecasterConfig::default()
            .with_layers(vec![Layer::lstm(5), Layer::output(LossFn::Mse)])
            .with_num_epochs(1),
    );
    one_layer.build_classifier(&wave(20)).unwrap();
    assert!(one_layer.load_serialized_state(&state_path).is_err());
}

#[test]
fn test_missing_files_report_io_errors() {
    let dir = tempdir().unwrap();
    let mut forecaster = trained();

    let err = forecaster.load_serialized_model(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, ForecastError::Persistence(PersistenceError::Io(_))));

    let err = forecaster.load_serialized_state(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ForecastError::Persistence(PersistenceError::Io(_))));
}

#[test]
fn test_uninitialized_forecaster_cannot_serialize() {
    let dir = tempdir().unwrap();
    let forecaster: RnnForecaster = RnnForecaster::new(config());

    assert!(matches!(
        forecaster.serialize_model(dir.path().join("model.bin")),
        Err(ForecastError::NotInitialized)
    ));
    assert!(matches!(
        forecaster.serialize_state(dir.path().join("state.bin")),
        Err(ForecastError::NotInitialized)
    ));
}

#[test]
fn test_network_metadata_survives_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("network.bin");

    let forecaster = trained();
    let network = forecaster.model().unwrap();
    let mut metadata = PersistentModel::metadata(network);
    metadata.description = Some("three epochs on a sine wave".to_string());
    network.save_with_metadata(&path, metadata.clone()).unwrap();

    let (loaded, loaded_metadata) = <RecurrentNetwork as PersistentModel>::load(&path).unwrap();
    assert_eq!(loaded_metadata, metadata);
    assert_eq!(loaded_metadata.input_size, 2);
    assert_eq!(loaded_metadata.output_size, 1);
    assert_eq!(loaded_metadata.num_layers, 3);
    assert_eq!(loaded_metadata.total_epochs, 3);
    assert_eq!(loaded.spec(), network.spec());
}
