use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    error::Error,
    inference::{ImageInput, PredictError, Prediction, Predictor},
    model::DigitCnn,
    store::ModelStore,
};
use burn::tensor::backend::Backend;

/// Lifecycle of the model owned by a [ModelContext].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// The model is still being loaded or trained.
    Starting,
    /// Predictions can be served.
    Ready,
    /// Loading and training both failed; the reason is kept for reporting.
    Failed(String),
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Starting => f.write_str("starting"),
            Health::Ready => f.write_str("ready"),
            Health::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

enum Slot<B: Backend> {
    Starting,
    Ready(Predictor<B>),
    Failed(String),
}

impl<B: Backend> Slot<B> {
    fn health(&self) -> Health {
        match self {
            Slot::Starting => Health::Starting,
            Slot::Ready(_) => Health::Ready,
            Slot::Failed(reason) => Health::Failed(reason.clone()),
        }
    }
}

struct Shared<B: Backend> {
    slot: Mutex<Slot<B>>,
    changed: Condvar,
}

/// Owner of the process-wide classifier.
///
/// The model is installed once, either synchronously or by a background thread, and
/// never mutated afterwards. Cloning the context is cheap and every clone observes the
/// same model.
pub struct ModelContext<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for ModelContext<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> ModelContext<B> {
    fn with_slot(slot: Slot<B>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(slot),
                changed: Condvar::new(),
            }),
        }
    }

    /// A context whose model is already available.
    pub fn ready(predictor: Predictor<B>) -> Self {
        Self::with_slot(Slot::Ready(predictor))
    }

    /// Loads the stored model, training a new one with `train` when the store is empty.
    pub fn load_or_train<F>(store: &ModelStore, device: B::Device, train: F) -> Result<Self, Error>
    where
        F: FnOnce(&B::Device) -> Result<DigitCnn<B>, Error>,
    {
        let model = bootstrap(store, &device, train)?;
        Ok(Self::ready(Predictor::new(model, device)))
    }

    /// Like [load_or_train](Self::load_or_train), but on a background thread.
    ///
    /// The returned context reports [Health::Starting] until the model is installed.
    pub fn spawn<F>(store: ModelStore, device: B::Device, train: F) -> Self
    where
        F: FnOnce(&B::Device) -> Result<DigitCnn<B>, Error> + Send + 'static,
    {
        let context = Self::with_slot(Slot::Starting);
        let worker = context.clone();

        let spawned = thread::Builder::new()
            .name("model-bootstrap".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    bootstrap(&store, &device, train)
                }));

                let slot = match result {
                    Ok(Ok(model)) => {
                        log::info!("Model ready");
                        Slot::Ready(Predictor::new(model, device))
                    }
                    Ok(Err(err)) => {
                        log::error!("Model bootstrap failed: {err}");
                        Slot::Failed(err.to_string())
                    }
                    Err(payload) => {
                        let reason = format!("bootstrap panicked: {}", panic_message(&*payload));
                        log::error!("Model {reason}");
                        Slot::Failed(reason)
                    }
                };
                worker.install(slot);
            });

        if let Err(err) = spawned {
            log::error!("Could not start the model bootstrap thread: {err}");
            context.install(Slot::Failed(err.to_string()));
        }

        context
    }

    fn lock(&self) -> MutexGuard<'_, Slot<B>> {
        // A panic while holding the lock cannot leave a half-written slot behind.
        self.shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn install(&self, slot: Slot<B>) {
        *self.lock() = slot;
        self.shared.changed.notify_all();
    }

    pub fn health(&self) -> Health {
        self.lock().health()
    }

    /// Blocks until the model leaves [Health::Starting] or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Health {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();

        while matches!(*slot, Slot::Starting) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            slot = match self.shared.changed.wait_timeout(slot, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        slot.health()
    }

    /// Returns a handle on the loaded model.
    ///
    /// The lock is held only for the clone; forward passes run without it.
    pub fn predictor(&self) -> Result<Predictor<B>, PredictError> {
        match &*self.lock() {
            Slot::Ready(predictor) => Ok(predictor.clone()),
            Slot::Starting => Err(PredictError::ModelUnavailable(
                "the model is still starting".to_string(),
            )),
            Slot::Failed(reason) => Err(PredictError::ModelUnavailable(reason.clone())),
        }
    }

    pub fn predict<I: Into<ImageInput>>(&self, input: I) -> Result<Prediction, PredictError> {
        self.predictor()?.predict(input)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn bootstrap<B, F>(store: &ModelStore, device: &B::Device, train: F) -> Result<DigitCnn<B>, Error>
where
    B: Backend,
    F: FnOnce(&B::Device) -> Result<DigitCnn<B>, Error>,
{
    match store.load::<B>(device)? {
        Some(model) => {
            log::info!("Loaded trained model from {}", store.dir().display());
            Ok(model)
        }
        None => {
            log::info!(
                "No trained model in {}, training one now",
                store.dir().display()
            );
            train(device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inference::NUM_PIXELS, model::DigitCnnConfig, training::TrainingConfig};
    use burn::backend::NdArray;
    use std::sync::mpsc;

    type TestBackend = NdArray<f32>;

    fn fresh_model(device: &<TestBackend as Backend>::Device) -> DigitCnn<TestBackend> {
        DigitCnnConfig::new().init(device)
    }

    #[test]
    fn trains_when_the_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let mut trained = false;

        let context =
            ModelContext::<TestBackend>::load_or_train(&store, Default::default(), |device| {
                trained = true;
                Ok(fresh_model(device))
            })
            .unwrap();

        assert!(trained);
        assert_eq!(context.health(), Health::Ready);
        assert!(context.predict(vec![0.0f32; NUM_PIXELS]).is_ok());
    }

    #[test]
    fn loads_instead_of_training_when_a_model_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let device = Default::default();
        let model = fresh_model(&device);
        store.save(&model, &TrainingConfig::default()).unwrap();
        let expected = Predictor::new(model, device.clone())
            .predict(vec![0.2f32; NUM_PIXELS])
            .unwrap();

        let context =
            ModelContext::<TestBackend>::load_or_train(&store, device, |_| {
                panic!("a stored model must not be retrained")
            })
            .unwrap();

        let prediction = context.predict(vec![0.2f32; NUM_PIXELS]).unwrap();
        assert_eq!(prediction.label, expected.label);
    }

    #[test]
    fn background_bootstrap_reports_starting_then_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (release, gate) = mpsc::channel::<()>();

        let context = ModelContext::<TestBackend>::spawn(store, Default::default(), move |device| {
            gate.recv().ok();
            Ok(fresh_model(device))
        });

        assert_eq!(context.health(), Health::Starting);
        assert!(matches!(
            context.predict(vec![0.0f32; NUM_PIXELS]),
            Err(PredictError::ModelUnavailable(_))
        ));

        release.send(()).unwrap();

        assert_eq!(context.wait(Duration::from_secs(30)), Health::Ready);
        assert!(context.predict(vec![0.0f32; NUM_PIXELS]).is_ok());
    }

    #[test]
    fn background_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());

        let context = ModelContext::<TestBackend>::spawn(store, Default::default(), |_| {
            Err(crate::training::TrainingError::InvalidConfig("no data".to_string()).into())
        });

        let health = context.wait(Duration::from_secs(30));
        assert!(matches!(health, Health::Failed(ref reason) if reason.contains("no data")));
        assert!(matches!(
            context.predict(vec![0.0f32; NUM_PIXELS]),
            Err(PredictError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn background_panic_is_reported_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());

        let context = ModelContext::<TestBackend>::spawn(store, Default::default(), |_| {
            panic!("backend blew up")
        });

        let health = context.wait(Duration::from_secs(30));
        assert!(
            matches!(health, Health::Failed(ref reason) if reason.contains("backend blew up")),
            "unexpected health: {health}"
        );
        assert!(matches!(
            context.predict(vec![0.0f32; NUM_PIXELS]),
            Err(PredictError::ModelUnavailable(_))
        ));
    }
}
