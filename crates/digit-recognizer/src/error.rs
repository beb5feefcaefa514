use thiserror::Error;

use crate::{
    data::DatasetError, inference::PredictError, store::StoreError, training::TrainingError,
};

/// Any failure surfaced by the digit recognizer.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Predict(#[from] PredictError),

    /// A request payload that is not valid JSON for the expected shape.
    #[error("invalid request payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
