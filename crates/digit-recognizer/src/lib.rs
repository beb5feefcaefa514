//! Handwritten digit classification on the MNIST dataset.
//!
//! The crate trains a small convolutional network with Burn, persists it, and
//! exposes the inference contract used by a serving layer: any 784-value sample,
//! either already in [0, 1] or in raw 0-255 intensities, is normalized and
//! classified into a label and a probability vector.

pub mod api;
pub mod cli;
pub mod context;
pub mod data;
pub mod error;
pub mod inference;
pub mod logging;
pub mod model;
pub mod store;
pub mod training;

pub use context::{Health, ModelContext};
pub use error::Error;
pub use inference::{ImageInput, PredictError, Prediction, Predictor};
pub use store::ModelStore;
