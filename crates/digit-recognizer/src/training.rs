use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::{
    data::{DigitBatch, DigitBatcher, DigitDataset},
    model::{DigitCnn, DigitCnnConfig},
    store::{ModelStore, StoreError},
};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
    },
};
use thiserror::Error;

/// Error raised before or during training.
#[derive(Error, Debug)]
pub enum TrainingError {
    /// The configuration cannot produce a model.
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    /// The run directory could not be prepared.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The trained model could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: DigitCnnConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Fraction of the training samples held out for validation.
    #[config(default = 0.2)]
    pub validation_split: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(DigitCnnConfig::new(), AdamConfig::new())
    }
}

impl TrainingConfig {
    /// Checks that a training run over `num_samples` samples can make progress.
    pub fn validate(&self, num_samples: usize) -> Result<(), TrainingError> {
        if self.num_epochs == 0 {
            return Err(TrainingError::InvalidConfig(
                "num_epochs must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(TrainingError::InvalidConfig(format!(
                "validation_split must be in (0, 1), got {}",
                self.validation_split
            )));
        }

        let num_valid = (num_samples as f64 * self.validation_split).round() as usize;
        if num_valid == 0 || num_valid == num_samples {
            return Err(TrainingError::InvalidConfig(format!(
                "{num_samples} samples cannot be split into train and validation sets"
            )));
        }

        Ok(())
    }
}

/// Loss and accuracy of a model over a labelled dataset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

impl<B: Backend> DigitCnn<B> {
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<DigitBatch<B>, ClassificationOutput<B>> for DigitCnn<B> {
    fn step(&self, batch: DigitBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<DigitBatch<B>, ClassificationOutput<B>> for DigitCnn<B> {
    fn step(&self, batch: DigitBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// Returns a fresh, timestamped run directory under `<log_dir>/fit`.
pub fn run_dir<P: AsRef<Path>>(log_dir: P) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    log_dir.as_ref().join("fit").join(stamp.to_string())
}

/// Trains a new classifier on `dataset`, holding out `config.validation_split` for validation.
///
/// Metrics and checkpoints are written to `run_dir`. When a `store` is given the
/// trained model is persisted to it.
pub fn train<B: AutodiffBackend>(
    run_dir: &Path,
    config: &TrainingConfig,
    dataset: DigitDataset,
    device: B::Device,
    store: Option<&ModelStore>,
) -> Result<DigitCnn<B::InnerBackend>, TrainingError> {
    config.validate(dataset.len())?;

    fs::create_dir_all(run_dir).map_err(|source| TrainingError::Io {
        path: run_dir.to_path_buf(),
        source,
    })?;
    config
        .save(run_dir.join("config.json"))
        .map_err(|source| TrainingError::Io {
            path: run_dir.join("config.json"),
            source,
        })?;

    B::seed(config.seed);

    let (dataset_train, dataset_valid) = dataset.split_validation(config.validation_split);
    log::info!(
        "Training on {} samples, validating on {}, for {} epochs",
        dataset_train.len(),
        dataset_valid.len(),
        config.num_epochs
    );

    let batcher_train = DigitBatcher::<B>::new(device.clone());
    let batcher_valid = DigitBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let directory = run_dir.to_string_lossy().to_string();
    let learner = LearnerBuilder::new(&directory)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(
            config.model.init::<B>(&device),
            config.optimizer.init(),
            config.learning_rate,
        );

    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    let elapsed = now.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    let model = model_trained.valid();

    if let Some(store) = store {
        store.save(&model, config)?;
        log::info!("Model saved to {}", store.dir().display());
    }

    Ok(model)
}

/// Computes the mean loss and the accuracy of `model` over `dataset`.
pub fn evaluate<B: Backend>(
    model: &DigitCnn<B>,
    dataset: DigitDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation, TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::InvalidConfig(
            "cannot evaluate on an empty dataset".to_string(),
        ));
    }
    if batch_size == 0 {
        return Err(TrainingError::InvalidConfig(
            "batch_size must be at least 1".to_string(),
        ));
    }

    let dataloader = DataLoaderBuilder::new(DigitBatcher::<B>::new(device.clone()))
        .batch_size(batch_size)
        .build(dataset);

    let mut loss_sum = 0.0;
    let mut correct = 0;
    let mut samples = 0;

    for batch in dataloader.iter() {
        let [batch_len] = batch.targets.dims();
        let output = model.forward_classification(batch.images, batch.targets);

        loss_sum += output.loss.into_scalar().elem::<f64>() * batch_len as f64;

        let predicted = output.output.argmax(1).squeeze::<1>(1);
        correct += predicted
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>() as usize;
        samples += batch_len;
    }

    Ok(Evaluation {
        loss: loss_sum / samples as f64,
        accuracy: correct as f64 / samples as f64,
        samples,
    })
}
