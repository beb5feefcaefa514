use crate::{
    data::{HEIGHT, WIDTH},
    model::DigitCnn,
};
use burn::{
    prelude::*,
    tensor::{activation::softmax, TensorData},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of pixels in a digit sample.
pub const NUM_PIXELS: usize = WIDTH * HEIGHT;
/// Number of digit classes.
pub const NUM_CLASSES: usize = 10;

/// Intensity above which an input is treated as raw 0-255 bytes.
const UNIT_MAX: f32 = 1.0;

/// Why a sample could not be classified.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictError {
    /// The request carried no pixels at all.
    #[error("No image data provided")]
    EmptyInput,

    /// The sample cannot be reshaped to 28x28.
    #[error("expected {NUM_PIXELS} pixel values, found {found}")]
    ElementCount { found: usize },

    /// A grid input whose rows do not all have the same length.
    #[error("rows of the image grid have different lengths")]
    RaggedRows,

    /// NaN or infinite intensities.
    #[error("pixel {index} is not a finite number")]
    NonFinite { index: usize },

    /// No model is loaded yet, or loading it failed.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The model output could not be read back.
    #[error("unexpected model output: {0}")]
    Tensor(String),
}

/// One digit sample as submitted by a client, either flat or as rows of pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    Flat(Vec<f64>),
    Grid(Vec<Vec<f64>>),
}

impl ImageInput {
    pub fn len(&self) -> usize {
        match self {
            ImageInput::Flat(values) => values.len(),
            ImageInput::Grid(rows) => rows.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the sample in row-major order, casting to `f32`.
    fn into_pixels(self) -> Result<Vec<f32>, PredictError> {
        match self {
            ImageInput::Flat(values) => Ok(values.into_iter().map(|v| v as f32).collect()),
            ImageInput::Grid(rows) => {
                let width = rows.first().map(Vec::len).unwrap_or_default();
                if rows.iter().any(|row| row.len() != width) {
                    return Err(PredictError::RaggedRows);
                }

                Ok(rows.into_iter().flatten().map(|v| v as f32).collect())
            }
        }
    }
}

impl From<Vec<f32>> for ImageInput {
    fn from(values: Vec<f32>) -> Self {
        ImageInput::Flat(values.into_iter().map(f64::from).collect())
    }
}

impl From<&[f32]> for ImageInput {
    fn from(values: &[f32]) -> Self {
        ImageInput::Flat(values.iter().copied().map(f64::from).collect())
    }
}

impl From<[[f32; WIDTH]; HEIGHT]> for ImageInput {
    fn from(image: [[f32; WIDTH]; HEIGHT]) -> Self {
        ImageInput::Grid(
            image
                .iter()
                .map(|row| row.iter().copied().map(f64::from).collect())
                .collect(),
        )
    }
}

/// Turns an arbitrary sample into 784 intensities in [0, 1].
///
/// Values are cast to `f32`; if any exceeds 1.0 every value is divided by 255.
/// The sample must hold exactly 784 values, whatever its shape.
pub fn normalize(input: ImageInput) -> Result<Vec<f32>, PredictError> {
    let mut pixels = input.into_pixels()?;

    if let Some(index) = pixels.iter().position(|v| !v.is_finite()) {
        return Err(PredictError::NonFinite { index });
    }

    if pixels.iter().any(|&v| v > UNIT_MAX) {
        pixels.iter_mut().for_each(|v| *v /= 255.0);
    }

    if pixels.len() != NUM_PIXELS {
        return Err(PredictError::ElementCount {
            found: pixels.len(),
        });
    }

    Ok(pixels)
}

/// The classifier's answer for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: u8,
    pub probabilities: [f32; NUM_CLASSES],
}

impl Prediction {
    /// Label 0 with an all-zero probability vector, returned by
    /// [Predictor::predict_or_default] when a sample cannot be classified.
    pub fn fallback() -> Self {
        Self {
            label: 0,
            probabilities: [0.0; NUM_CLASSES],
        }
    }

    fn from_probabilities(probabilities: [f32; NUM_CLASSES]) -> Self {
        // First maximum wins on ties.
        let label = probabilities
            .iter()
            .enumerate()
            .fold(0, |best, (index, p)| {
                if *p > probabilities[best] {
                    index
                } else {
                    best
                }
            });

        Self {
            label: label as u8,
            probabilities,
        }
    }
}

/// A trained classifier bound to the device it runs on.
#[derive(Clone, Debug)]
pub struct Predictor<B: Backend> {
    model: DigitCnn<B>,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: DigitCnn<B>, device: B::Device) -> Self {
        Self { model, device }
    }

    pub fn model(&self) -> &DigitCnn<B> {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Classifies one sample.
    pub fn predict<I: Into<ImageInput>>(&self, input: I) -> Result<Prediction, PredictError> {
        let pixels = normalize(input.into())?;
        self.forward(pixels)
    }

    /// Classifies one sample, answering [Prediction::fallback] instead of failing.
    pub fn predict_or_default<I: Into<ImageInput>>(&self, input: I) -> Prediction {
        self.predict(input).unwrap_or_else(|err| {
            log::warn!("Prediction failed, answering the fallback: {err}");
            Prediction::fallback()
        })
    }

    fn forward(&self, pixels: Vec<f32>) -> Result<Prediction, PredictError> {
        let data = TensorData::new(pixels, [1, 1, HEIGHT, WIDTH]);
        let images = Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), &self.device);

        let output = softmax(self.model.forward(images), 1);
        let probabilities = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| PredictError::Tensor(format!("{err:?}")))?;

        let probabilities: [f32; NUM_CLASSES] =
            probabilities.try_into().map_err(|values: Vec<f32>| {
                PredictError::Tensor(format!(
                    "expected {NUM_CLASSES} probabilities, found {}",
                    values.len()
                ))
            })?;

        Ok(Prediction::from_probabilities(probabilities))
    }
}
