use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::dataset::ClassKey;

use super::PredictionSample;

pub const MODEL_VERSION: i64 = 1;

/// Summary of the final training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs: usize,
    pub samples: usize,
    pub loss: f32,
    pub accuracy: f32,
}

/// Dense head: `softmax(W2 · relu(W1 · x + b1) + b2)`.
///
/// Weights are row-major; output index `i` belongs to `class_keys[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub model_version: i64,
    pub input_len: usize,
    pub hidden_units: usize,
    pub class_keys: Vec<ClassKey>,
    pub weights1: Vec<f32>,
    pub bias1: Vec<f32>,
    pub weights2: Vec<f32>,
    pub bias2: Vec<f32>,
    #[serde(default)]
    pub metrics: Option<TrainingMetrics>,
}

impl ClassifierModel {
    pub fn validate(&self) -> Result<(), String> {
        if self.model_version != MODEL_VERSION {
            return Err(format!(
                "Unsupported model_version {} (expected {MODEL_VERSION})",
                self.model_version
            ));
        }
        let input = self.input_len;
        let hidden = self.hidden_units;
        let classes = self.class_keys.len();
        if input == 0 || hidden == 0 || classes == 0 {
            return Err("model has an empty layer".to_string());
        }
        if self.weights1.len() != input * hidden {
            return Err("weights1 length mismatch".to_string());
        }
        if self.bias1.len() != hidden {
            return Err("bias1 length mismatch".to_string());
        }
        if self.weights2.len() != classes * hidden {
            return Err("weights2 length mismatch".to_string());
        }
        if self.bias2.len() != classes {
            return Err("bias2 length mismatch".to_string());
        }
        if self.class_keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err("class keys must be strictly ascending".to_string());
        }
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.class_keys.len()
    }

    /// Class probabilities for one feature vector.
    pub fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, String> {
        if features.len() != self.input_len {
            return Err(format!(
                "expected {} features, got {}",
                self.input_len,
                features.len()
            ));
        }
        let w1 = ArrayView2::from_shape((self.hidden_units, self.input_len), &self.weights1)
            .map_err(|err| err.to_string())?;
        let w2 = ArrayView2::from_shape((self.num_classes(), self.hidden_units), &self.weights2)
            .map_err(|err| err.to_string())?;
        let x = ArrayView1::from(features);
        let hidden = (w1.dot(&x) + &ArrayView1::from(&self.bias1)).mapv(|v| v.max(0.0));
        let logits = w2.dot(&hidden) + &ArrayView1::from(&self.bias2);
        Ok(softmax(logits).to_vec())
    }

    /// Arg-max class and its probability.
    pub fn predict(&self, features: &[f32]) -> Result<PredictionSample, String> {
        let probs = self.predict_proba(features)?;
        let (index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (index, p)| match best {
                Some((_, top)) if top >= p => best,
                _ => Some((index, p)),
            })
            .ok_or_else(|| "model produced no outputs".to_string())?;
        let key = self
            .class_keys
            .get(index)
            .copied()
            .ok_or_else(|| format!("output {index} has no class key"))?;
        Ok(PredictionSample { key, confidence })
    }
}

pub(super) fn softmax(mut logits: Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    logits.mapv_inplace(|v| (v - max).exp());
    let sum = logits.sum().max(f32::MIN_POSITIVE);
    logits.mapv_inplace(|v| v / sum);
    logits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> ClassifierModel {
        ClassifierModel {
            model_version: MODEL_VERSION,
            input_len: 2,
            hidden_units: 2,
            class_keys: vec![ClassKey(3), ClassKey(8)],
            weights1: vec![1.0, 0.0, 0.0, 1.0],
            bias1: vec![0.0, 0.0],
            weights2: vec![4.0, 0.0, 0.0, 4.0],
            bias2: vec![0.0, 0.0],
            metrics: None,
        }
    }

    #[test]
    fn predict_maps_output_index_to_class_key() {
        let model = tiny_model();
        model.validate().unwrap();
        let sample = model.predict(&[0.0, 1.0]).unwrap();
        assert_eq!(sample.key, ClassKey(8));
        assert!(sample.confidence > 0.9);
        let sample = model.predict(&[1.0, 0.0]).unwrap();
        assert_eq!(sample.key, ClassKey(3));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let probs = tiny_model().predict_proba(&[0.3, -2.0]).unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wrong_input_length_is_rejected() {
        assert!(tiny_model().predict(&[1.0]).is_err());
    }

    #[test]
    fn validate_catches_shape_mismatch() {
        let mut model = tiny_model();
        model.bias2.pop();
        assert_eq!(model.validate().unwrap_err(), "bias2 length mismatch");
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probs = softmax(Array1::from(vec![1000.0, 1000.0]));
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }
}
