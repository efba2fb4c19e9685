//! EWMA smoothing that turns per-frame predictions into a settled signal.

use thiserror::Error;

use crate::config::GateConfig;
use crate::dataset::ClassKey;

#[derive(Debug, Error, PartialEq)]
pub enum GateError {
    #[error("Smoothing factor must be in (0, 1], got {0}")]
    Smoothing(f32),
    #[error("Boundary must be in (0, 1], got {0}")]
    Boundary(f32),
}

/// Exponentially weighted moving average.
#[derive(Debug, Clone, PartialEq)]
pub struct Ewma {
    alpha: f32,
    initial: f32,
    value: f32,
}

impl Ewma {
    pub fn new(alpha: f32, initial: f32) -> Self {
        Self {
            alpha,
            initial,
            value: initial,
        }
    }

    pub fn update(&mut self, sample: f32) -> f32 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    pub fn reset(&mut self) {
        self.value = self.initial;
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Decides when a stream of `(key, confidence)` samples has converged.
///
/// A change of key resets the average to zero so one class never inherits
/// another's confidence.
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    ewma: Ewma,
    boundary: f32,
    tracked_key: Option<ClassKey>,
    last_deviation: f32,
    last_raw_confidence: f32,
}

impl ConfidenceGate {
    pub fn new(config: GateConfig) -> Result<Self, GateError> {
        let GateConfig {
            smoothing,
            boundary,
        } = config;
        if !(smoothing.is_finite() && smoothing > 0.0 && smoothing <= 1.0) {
            return Err(GateError::Smoothing(smoothing));
        }
        if !(boundary.is_finite() && boundary > 0.0 && boundary <= 1.0) {
            return Err(GateError::Boundary(boundary));
        }
        Ok(Self {
            ewma: Ewma::new(smoothing, 0.0),
            boundary,
            tracked_key: None,
            last_deviation: f32::INFINITY,
            last_raw_confidence: 0.0,
        })
    }

    /// Feed one prediction; returns whether the signal is settled.
    pub fn update(&mut self, key: ClassKey, confidence: f32) -> bool {
        self.last_raw_confidence = confidence;
        if self.tracked_key != Some(key) {
            self.ewma.reset();
            self.tracked_key = Some(key);
        } else {
            self.ewma.update(confidence);
        }
        self.last_deviation = (1.0 - self.ewma.value()).abs();
        self.last_deviation < self.boundary
    }

    /// Clear the smoothed state, optionally tracking `key` from now on.
    pub fn reset(&mut self, key: Option<ClassKey>) {
        self.ewma.reset();
        self.tracked_key = key;
        self.last_deviation = f32::INFINITY;
        self.last_raw_confidence = 0.0;
    }

    pub fn tracked_key(&self) -> Option<ClassKey> {
        self.tracked_key
    }

    pub fn filtered_confidence(&self) -> f32 {
        self.ewma.value()
    }

    pub fn last_deviation(&self) -> f32 {
        self.last_deviation
    }

    pub fn last_raw_confidence(&self) -> f32 {
        self.last_raw_confidence
    }

    pub fn is_settled(&self) -> bool {
        self.last_deviation < self.boundary
    }
}
