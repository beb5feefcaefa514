use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use burn::{
    data::dataset::Dataset,
    optim::AdamConfig,
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::{Args, Parser, Subcommand};

use crate::{
    api::{PredictRequest, PredictResponse},
    context::ModelContext,
    data::{default_cache_dir, DigitDataset},
    error::Error,
    inference::Predictor,
    model::{DigitCnn, DigitCnnConfig},
    store::ModelStore,
    training::{self, TrainingConfig},
};

/// Train, evaluate and query the handwritten digit classifier.
#[derive(Parser, Debug)]
#[command(name = "digits", version, about)]
pub struct Cli {
    /// Log debug messages.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Trains a new model, reports its test accuracy and saves it.
    Train {
        #[command(flatten)]
        paths: Paths,

        /// Root of the training logs; each run gets `<log-dir>/fit/<timestamp>`.
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,

        #[command(flatten)]
        hyper: HyperParameters,
    },

    /// Reports the saved model's loss and accuracy on the test split.
    Evaluate {
        #[command(flatten)]
        paths: Paths,

        #[arg(long, default_value_t = 128)]
        batch_size: usize,
    },

    /// Classifies one image read as `{"image_data": [...]}` JSON.
    ///
    /// Trains a model first when none has been saved yet.
    Predict {
        #[command(flatten)]
        paths: Paths,

        /// Root of the training logs, used when a model has to be trained first.
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,

        #[command(flatten)]
        hyper: HyperParameters,

        /// JSON request file; standard input when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Answer label 0 with zero probabilities instead of failing on malformed images.
        #[arg(long)]
        lenient: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Paths {
    /// Directory holding the saved model.
    #[arg(long, default_value = ModelStore::DEFAULT_DIR)]
    pub artifact_dir: PathBuf,

    /// Dataset cache; defaults to the user cache directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl Paths {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_cache_dir)
    }

    fn store(&self) -> ModelStore {
        ModelStore::new(&self.artifact_dir)
    }
}

#[derive(Args, Debug, Clone)]
pub struct HyperParameters {
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 1.0e-3)]
    pub learning_rate: f64,
}

impl HyperParameters {
    fn config(&self) -> TrainingConfig {
        TrainingConfig::new(DigitCnnConfig::new(), AdamConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_num_workers(self.num_workers)
            .with_seed(self.seed)
            .with_learning_rate(self.learning_rate)
    }
}

/// Runs a parsed command line on the given backend.
pub fn execute<B: AutodiffBackend>(cli: Cli, device: B::Device) -> Result<(), Error> {
    match cli.command {
        Commands::Train {
            paths,
            log_dir,
            hyper,
        } => train::<B>(&paths, &log_dir, &hyper, device),
        Commands::Evaluate { paths, batch_size } => {
            evaluate::<B::InnerBackend>(&paths, batch_size, device)
        }
        Commands::Predict {
            paths,
            log_dir,
            hyper,
            input,
            lenient,
        } => predict::<B>(&paths, &log_dir, &hyper, input, lenient, device),
    }
}

fn fit<B: AutodiffBackend>(
    paths: &Paths,
    log_dir: &Path,
    hyper: &HyperParameters,
    device: &B::Device,
) -> Result<DigitCnn<B::InnerBackend>, Error> {
    log::info!("Loading digit data...");
    let dataset = DigitDataset::train(paths.data_dir())?;

    log::info!("Training model...");
    let run_dir = training::run_dir(log_dir);
    let model = training::train::<B>(
        &run_dir,
        &hyper.config(),
        dataset,
        device.clone(),
        Some(&paths.store()),
    )?;

    Ok(model)
}

fn train<B: AutodiffBackend>(
    paths: &Paths,
    log_dir: &Path,
    hyper: &HyperParameters,
    device: B::Device,
) -> Result<(), Error> {
    let model = fit::<B>(paths, log_dir, hyper, &device)?;

    let test = DigitDataset::test(paths.data_dir())?;
    let evaluation = training::evaluate(&model, test, hyper.batch_size, &device)?;
    log::info!(
        "Test loss: {:.4}, test accuracy: {:.4}",
        evaluation.loss,
        evaluation.accuracy
    );
    log::info!("Model training completed and saved successfully");

    Ok(())
}

fn evaluate<B: Backend>(
    paths: &Paths,
    batch_size: usize,
    device: B::Device,
) -> Result<(), Error> {
    let model = paths.store().load_required::<B>(&device)?;
    let test = DigitDataset::test(paths.data_dir())?;

    let example = test.get(0);
    let evaluation = training::evaluate(&model, test, batch_size, &device)?;
    log::info!(
        "Test loss: {:.4}, test accuracy: {:.4} over {} samples",
        evaluation.loss,
        evaluation.accuracy,
        evaluation.samples
    );

    if let Some(item) = example {
        let prediction = Predictor::new(model, device).predict(item.image)?;
        log::info!(
            "Example prediction: {}, actual label: {}",
            prediction.label,
            item.label
        );
        log::info!("Probabilities: {:?}", prediction.probabilities);
    }

    Ok(())
}

fn predict<B: AutodiffBackend>(
    paths: &Paths,
    log_dir: &Path,
    hyper: &HyperParameters,
    input: Option<PathBuf>,
    lenient: bool,
    device: B::Device,
) -> Result<(), Error> {
    let payload = match input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut payload = String::new();
            io::stdin().read_to_string(&mut payload)?;
            payload
        }
    };
    let request: PredictRequest = serde_json::from_str(&payload)?;
    let image = request.into_image()?;

    let context = ModelContext::<B::InnerBackend>::load_or_train(&paths.store(), device, |device| {
        fit::<B>(paths, log_dir, hyper, device)
    })?;

    let prediction = if lenient {
        context.predictor()?.predict_or_default(image)
    } else {
        context.predict(image)?
    };

    let response = PredictResponse::from(prediction);
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}
