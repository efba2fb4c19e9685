//! Frozen feature extraction: the model contract, its shared loader and the
//! burn-backed implementation fetched from a remote burnpack.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::frame::Frame;

mod encoder;
mod loader;
mod remote;

pub use encoder::{BurnExtractor, FrozenEncoder};
pub use loader::FeatureExtractorLoader;
pub use remote::{ENCODER_FILE_NAME, RemoteExtractorSource, sha256_file};

/// Length of the vectors produced by the bundled encoder.
pub const FEATURE_LEN: usize = 1024;

/// Errors raised while fetching or initializing an extractor.
///
/// Cloneable because a single load outcome is handed to every waiting caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("Invalid extractor URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("No extractor URL configured and no cached weights at {0}")]
    Missing(PathBuf),
    #[error("Extractor download failed: {0}")]
    Download(String),
    #[error("Extractor SHA-256 mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("Failed to initialize extractor: {0}")]
    Init(String),
    #[error("Extractor warm-up failed: {0}")]
    WarmUp(String),
    #[error("Extractor loader stopped before finishing")]
    Abandoned,
}

/// Errors raised while turning one frame into a feature vector.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("Frame could not be prepared: {0}")]
    Frame(String),
    #[error("Extractor inference failed: {0}")]
    Inference(String),
    #[error("Extractor produced {actual} features, expected {expected}")]
    OutputLength { expected: usize, actual: usize },
}

/// A loaded, immutable frame-to-features model shared across ticks.
pub trait FeatureExtractor: Send + Sync {
    fn feature_len(&self) -> usize;

    /// Square edge, in pixels, of the model input.
    fn input_size(&self) -> u32;

    fn extract(&self, frame: &Frame) -> Result<Vec<f32>, ExtractError>;

    /// Run one zero-valued frame through the model.
    fn warm_up(&self) -> Result<(), ExtractError> {
        let size = self.input_size();
        let output = self.extract(&Frame::zeros(size, size))?;
        if output.len() != self.feature_len() {
            return Err(ExtractError::OutputLength {
                expected: self.feature_len(),
                actual: output.len(),
            });
        }
        Ok(())
    }
}

/// Where a [`FeatureExtractorLoader`] gets its model from.
pub trait ExtractorSource: Send + Sync + 'static {
    fn fetch(&self) -> Result<Arc<dyn FeatureExtractor>, LoadError>;
}
