use std::fs;
use std::path::{Path, PathBuf};

use crate::{model::DigitCnn, training::TrainingConfig};
use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};
use thiserror::Error;

/// Full precision keeps a reloaded model bit-for-bit equal to the one that was saved.
type StoreRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

const CONFIG_FILE: &str = "config.json";
const MODEL_FILE: &str = "model";
const MODEL_EXTENSION: &str = "mpk";

/// Error type for [ModelStore](ModelStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// No model has been saved in the store directory.
    #[error("no trained model in `{}`", dir.display())]
    Missing { dir: PathBuf },

    /// I/O operation error.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The saved configuration could not be read back.
    #[error("invalid model config `{}`: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// The model weights could not be written or decoded.
    #[error("model record `{}`: {reason}", path.display())]
    Record { path: PathBuf, reason: String },
}

/// A single-slot on-disk home for the trained classifier.
///
/// The directory holds the training configuration (`config.json`) and the weights
/// (`model.mpk`). Saving again overwrites the previous model.
#[derive(Clone, Debug)]
pub struct ModelStore {
    dir: PathBuf,
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIR)
    }
}

impl ModelStore {
    pub const DEFAULT_DIR: &'static str = "artifacts/digit-cnn";

    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a model has been saved.
    pub fn exists(&self) -> bool {
        self.record_path().with_extension(MODEL_EXTENSION).is_file()
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Path given to the recorder, which appends the file extension itself.
    fn record_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Writes the model and its configuration, creating the directory if needed.
    pub fn save<B: Backend>(
        &self,
        model: &DigitCnn<B>,
        config: &TrainingConfig,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        config
            .save(self.config_path())
            .map_err(|source| StoreError::Io {
                path: self.config_path(),
                source,
            })?;

        model
            .clone()
            .save_file(self.record_path(), &StoreRecorder::new())
            .map_err(|err| StoreError::Record {
                path: self.record_path(),
                reason: format!("{err:?}"),
            })
    }

    /// Reads back the configuration the model was trained with.
    pub fn load_config(&self) -> Result<TrainingConfig, StoreError> {
        TrainingConfig::load(self.config_path()).map_err(|err| StoreError::Config {
            path: self.config_path(),
            reason: format!("{err:?}"),
        })
    }

    /// Loads the saved model, or returns `Ok(None)` when nothing has been saved yet.
    pub fn load<B: Backend>(&self, device: &B::Device) -> Result<Option<DigitCnn<B>>, StoreError> {
        if !self.exists() {
            return Ok(None);
        }

        let config = self.load_config()?;
        let record = <StoreRecorder as Recorder<B>>::load(
            &StoreRecorder::new(),
            self.record_path(),
            device,
        )
        .map_err(|err| StoreError::Record {
            path: self.record_path(),
            reason: format!("{err:?}"),
        })?;

        Ok(Some(config.model.init::<B>(device).load_record(record)))
    }

    /// Like [load](Self::load), but a missing model is an error.
    pub fn load_required<B: Backend>(&self, device: &B::Device) -> Result<DigitCnn<B>, StoreError> {
        self.load(device)?.ok_or_else(|| StoreError::Missing {
            dir: self.dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DigitCnnConfig;
    use burn::backend::NdArray;
    use burn::optim::AdamConfig;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;

    #[test]
    fn load_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("never-written"));
        let device = Default::default();

        assert!(!store.exists());
        assert!(store.load::<TestBackend>(&device).unwrap().is_none());
        assert!(matches!(
            store.load_required::<TestBackend>(&device),
            Err(StoreError::Missing { .. })
        ));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("nested").join("model"));
        let device = Default::default();
        let config = TrainingConfig::default();
        let model = config.model.init::<TestBackend>(&device);

        store.save(&model, &config).unwrap();

        assert!(store.exists());
        assert!(store.dir().join("config.json").is_file());
    }

    #[test]
    fn reloaded_model_matches_saved_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let device = Default::default();
        let config = TrainingConfig::new(
            DigitCnnConfig::new().with_hidden_size(64),
            AdamConfig::new(),
        );
        let model = config.model.init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 1, 28, 28], &device);

        store.save(&model, &config).unwrap();
        let loaded = store.load::<TestBackend>(&device).unwrap().unwrap();

        assert_eq!(store.load_config().unwrap().model.hidden_size, 64);
        model
            .forward(images.clone())
            .into_data()
            .assert_eq(&loaded.forward(images).into_data(), true);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let device = Default::default();
        let config = TrainingConfig::default();
        config.save(dir.path().join("config.json")).unwrap();
        fs::write(dir.path().join("model.mpk"), b"not a record").unwrap();

        assert!(matches!(
            store.load::<TestBackend>(&device),
            Err(StoreError::Record { .. })
        ));
    }
}
