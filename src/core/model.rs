//! The classifier boundary.
//!
//! The detector only needs one thing from a model: a `(1, window, features)`
//! float tensor in, one fall probability out. Any backend that can honour
//! that contract implements [`FallModel`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Model invocation and loading errors.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("input shape mismatch: model expects {expected:?}, got {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("model returned an invalid probability: {0}")]
    InvalidOutput(f32),
    #[error("model inference failed: {0}")]
    Inference(String),
    #[error("failed to load model from {path}: {message}")]
    Load { path: String, message: String },
}

/// Rank-3 model input, stored row-major as `[window][features]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTensor {
    data: Vec<f32>,
    window: usize,
    features: usize,
}

impl WindowTensor {
    pub fn new(data: Vec<f32>, window: usize, features: usize) -> Result<Self, ModelError> {
        if data.len() != window * features {
            return Err(ModelError::Shape {
                expected: (window, features),
                actual: (data.len() / features.max(1), features),
            });
        }
        Ok(Self {
            data,
            window,
            features,
        })
    }

    /// `[batch, window, features]`; the batch is always 1.
    pub fn shape(&self) -> [usize; 3] {
        [1, self.window, self.features]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn at(&self, step: usize, feature: usize) -> f32 {
        self.data[step * self.features + feature]
    }
}

/// A trained fall classifier.
pub trait FallModel: Send + Sync {
    /// Declared `(window, features)` input shape.
    fn input_shape(&self) -> (usize, usize);

    /// Probability of a fall for the given window.
    fn predict(&self, input: &WindowTensor) -> Result<f32, ModelError>;
}

/// Check the tensor against the model's declared shape, run it, and reject
/// outputs that are not probabilities.
pub fn checked_predict(model: &dyn FallModel, input: &WindowTensor) -> Result<f32, ModelError> {
    let expected = model.input_shape();
    let [_, window, features] = input.shape();
    if expected != (window, features) {
        return Err(ModelError::Shape {
            expected,
            actual: (window, features),
        });
    }

    let probability = model.predict(input)?;
    if !(0.0..=1.0).contains(&probability) {
        return Err(ModelError::InvalidOutput(probability));
    }
    Ok(probability)
}

/// A model that always answers with the same probability.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    probability: f32,
    shape: (usize, usize),
}

impl ConstantModel {
    pub fn new(probability: f32, window: usize, features: usize) -> Self {
        Self {
            probability,
            shape: (window, features),
        }
    }
}

impl FallModel for ConstantModel {
    fn input_shape(&self) -> (usize, usize) {
        self.shape
    }

    fn predict(&self, _input: &WindowTensor) -> Result<f32, ModelError> {
        Ok(self.probability)
    }
}

/// Logistic classifier over the flattened window.
///
/// Loaded from a JSON export: `{"window_size", "feature_width", "weights", "bias"}`
/// with one weight per `(step, feature)` cell in row-major order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub window_size: usize,
    pub feature_width: usize,
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl LogisticModel {
    /// Load and validate a weights file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let load_err = |message: String| ModelError::Load {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let model: LogisticModel =
            serde_json::from_str(&content).map_err(|e| load_err(e.to_string()))?;

        if model.weights.len() != model.window_size * model.feature_width {
            return Err(load_err(format!(
                "expected {} weights for a {}x{} window, found {}",
                model.window_size * model.feature_width,
                model.window_size,
                model.feature_width,
                model.weights.len()
            )));
        }
        Ok(model)
    }
}

impl FallModel for LogisticModel {
    fn input_shape(&self) -> (usize, usize) {
        (self.window_size, self.feature_width)
    }

    fn predict(&self, input: &WindowTensor) -> Result<f32, ModelError> {
        if input.data().len() != self.weights.len() {
            return Err(ModelError::Shape {
                expected: self.input_shape(),
                actual: (input.shape()[1], input.shape()[2]),
            });
        }
        let logit: f64 = input
            .data()
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| *x as f64 * *w as f64)
            .sum::<f64>()
            + self.bias as f64;
        let probability = 1.0 / (1.0 + (-logit).exp());
        if probability.is_nan() {
            return Err(ModelError::Inference("logit is not a number".to_string()));
        }
        Ok(probability as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tensor(window: usize, features: usize, value: f32) -> WindowTensor {
        WindowTensor::new(vec![value; window * features], window, features).unwrap()
    }

    #[test]
    fn test_tensor_rejects_wrong_length() {
        assert!(WindowTensor::new(vec![0.0; 10], 2, 6).is_err());
    }

    #[test]
    fn test_checked_predict_shape_mismatch() {
        let model = ConstantModel::new(0.5, 40, 12);
        let result = checked_predict(&model, &tensor(40, 6, 0.0));
        assert!(matches!(result, Err(ModelError::Shape { .. })));
    }

    #[test]
    fn test_checked_predict_rejects_out_of_range() {
        let model = ConstantModel::new(1.5, 2, 6);
        assert!(matches!(
            checked_predict(&model, &tensor(2, 6, 0.0)),
            Err(ModelError::InvalidOutput(_))
        ));
        let model = ConstantModel::new(f32::NAN, 2, 6);
        assert!(checked_predict(&model, &tensor(2, 6, 0.0)).is_err());
    }

    #[test]
    fn test_logistic_model() {
        let model = LogisticModel {
            window_size: 2,
            feature_width: 6,
            weights: vec![1.0; 12],
            bias: 0.0,
        };
        let zero = checked_predict(&model, &tensor(2, 6, 0.0)).unwrap();
        assert!((zero - 0.5).abs() < 1e-6);
        let high = checked_predict(&model, &tensor(2, 6, 1.0)).unwrap();
        assert!(high > 0.99);
    }

    #[test]
    fn test_logistic_model_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"window_size":1,"feature_width":6,"weights":[0,0,0,0,0,0],"bias":2.0}}"#
        )
        .unwrap();
        let model = LogisticModel::load(file.path()).unwrap();
        assert_eq!(model.input_shape(), (1, 6));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(
            bad,
            r#"{{"window_size":2,"feature_width":6,"weights":[0],"bias":0}}"#
        )
        .unwrap();
        assert!(matches!(
            LogisticModel::load(bad.path()),
            Err(ModelError::Load { .. })
        ));
    }
}
