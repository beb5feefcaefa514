//! JSON payloads exchanged with a prediction client.
//!
//! ```json
//! { "image_data": [0.0, 0.0, ..., 0.7] }
//! ```
//!
//! is answered with
//!
//! ```json
//! { "predicted_label": 7, "probabilities": [0.0, ..., 0.98, ...] }
//! ```
//!
//! or, when the payload cannot be classified, with `{ "error": "..." }`.

use serde::{Deserialize, Serialize};

use crate::inference::{ImageInput, PredictError, Prediction, NUM_CLASSES};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub image_data: Option<ImageInput>,
}

impl PredictRequest {
    pub fn new<I: Into<ImageInput>>(image: I) -> Self {
        Self {
            image_data: Some(image.into()),
        }
    }

    /// The submitted sample; a missing or empty one is [PredictError::EmptyInput].
    pub fn into_image(self) -> Result<ImageInput, PredictError> {
        match self.image_data {
            Some(image) if !image.is_empty() => Ok(image),
            _ => Err(PredictError::EmptyInput),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predicted_label: u8,
    pub probabilities: [f32; NUM_CLASSES],
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            predicted_label: prediction.label,
            probabilities: prediction.probabilities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl<E: std::error::Error> From<&E> for ErrorResponse {
    fn from(err: &E) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_flat_and_grid_payloads() {
        let flat: PredictRequest = serde_json::from_str(r#"{"image_data": [0, 255, 0.5]}"#).unwrap();
        let grid: PredictRequest =
            serde_json::from_str(r#"{"image_data": [[0, 1], [1, 0]]}"#).unwrap();

        assert_eq!(
            flat.image_data,
            Some(ImageInput::Flat(vec![0.0, 255.0, 0.5]))
        );
        assert_eq!(
            grid.image_data,
            Some(ImageInput::Grid(vec![vec![0.0, 1.0], vec![1.0, 0.0]]))
        );
    }

    #[test]
    fn missing_or_empty_image_is_rejected() {
        let missing: PredictRequest = serde_json::from_str("{}").unwrap();
        let empty: PredictRequest = serde_json::from_str(r#"{"image_data": []}"#).unwrap();

        assert_eq!(missing.into_image(), Err(PredictError::EmptyInput));
        assert_eq!(empty.into_image(), Err(PredictError::EmptyInput));
        assert_eq!(
            ErrorResponse::from(&PredictError::EmptyInput).error,
            "No image data provided"
        );
    }

    #[test]
    fn non_numeric_pixels_do_not_parse() {
        let result = serde_json::from_str::<PredictRequest>(r#"{"image_data": ["a", "b"]}"#);

        assert!(result.is_err());
    }

    #[test]
    fn response_uses_the_wire_field_names() {
        let response = PredictResponse::from(Prediction {
            label: 3,
            probabilities: [0.1; NUM_CLASSES],
        });

        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["predicted_label"], 3);
        assert_eq!(json["probabilities"].as_array().unwrap().len(), NUM_CLASSES);
    }
}
