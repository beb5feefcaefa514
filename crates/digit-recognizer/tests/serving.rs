use burn::backend::NdArray;
use digit_recognizer::{
    api::{ErrorResponse, PredictRequest, PredictResponse},
    inference::NUM_PIXELS,
    model::DigitCnnConfig,
    training::TrainingConfig,
    Health, ModelContext, ModelStore, PredictError, Predictor,
};

type TestBackend = NdArray<f32>;

fn saved_store(dir: &std::path::Path) -> ModelStore {
    let device = Default::default();
    let config = TrainingConfig::new(
        DigitCnnConfig::new().with_hidden_size(32),
        burn::optim::AdamConfig::new(),
    );
    let store = ModelStore::new(dir);
    store
        .save(&config.model.init::<TestBackend>(&device), &config)
        .unwrap();
    store
}

#[test]
fn json_request_is_answered_by_the_stored_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = saved_store(dir.path());

    let context = ModelContext::<TestBackend>::load_or_train(&store, Default::default(), |_| {
        panic!("the stored model must be reused")
    })
    .unwrap();
    assert_eq!(context.health(), Health::Ready);

    let pixels: Vec<u32> = (0..NUM_PIXELS as u32).map(|i| i % 256).collect();
    let payload = serde_json::json!({ "image_data": pixels }).to_string();
    let request: PredictRequest = serde_json::from_str(&payload).unwrap();

    let prediction = context.predict(request.into_image().unwrap()).unwrap();
    let response = PredictResponse::from(prediction);

    assert!(response.predicted_label <= 9);
    let sum: f32 = response.probabilities.iter().sum();
    assert!((sum - 1.0).abs() < 1e-3);
}

#[test]
fn raw_and_unit_scaled_samples_agree() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = saved_store(dir.path())
        .load_required::<TestBackend>(&device)
        .unwrap();
    let predictor = Predictor::new(model, device);

    let raw: Vec<f32> = (0..NUM_PIXELS).map(|i| ((i * 3) % 256) as f32).collect();
    let unit: Vec<f32> = raw.iter().map(|v| v / 255.0).collect();

    let from_raw = predictor.predict(raw).unwrap();
    let from_unit = predictor.predict(unit).unwrap();

    assert_eq!(from_raw, from_unit);
}

#[test]
fn malformed_request_yields_an_error_payload() {
    let dir = tempfile::tempdir().unwrap();
    let context = ModelContext::<TestBackend>::load_or_train(
        &saved_store(dir.path()),
        Default::default(),
        |_| panic!("the stored model must be reused"),
    )
    .unwrap();

    let request: PredictRequest = serde_json::from_str(r#"{"image_data": [1, 2, 3]}"#).unwrap();
    let err = context.predict(request.into_image().unwrap()).unwrap_err();

    assert_eq!(err, PredictError::ElementCount { found: 3 });
    let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
    assert_eq!(body["error"], "expected 784 pixel values, found 3");
}
