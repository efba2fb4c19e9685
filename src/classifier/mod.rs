//! Trainable dense head over extracted features.

use thiserror::Error;
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::dataset::{ClassKey, ClassRecord, DatasetStore, StoreError};

mod model;
mod train;

pub use model::{ClassifierModel, MODEL_VERSION, TrainingMetrics};
pub use train::{EpochReport, LossKind, TrainingSession};

/// One inference result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionSample {
    pub key: ClassKey,
    /// Probability of `key`, in `[0, 1]`.
    pub confidence: f32,
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Class '{name}' ({key}) has {samples} samples; {required} are required")]
    InsufficientData {
        key: ClassKey,
        name: String,
        samples: usize,
        required: usize,
    },
    #[error("There are no classes to train")]
    NoClasses,
    #[error("There are no samples to train on")]
    NoSamples,
    #[error("Class {key} has a feature vector of length {actual}, expected {expected}")]
    FeatureLength {
        key: ClassKey,
        expected: usize,
        actual: usize,
    },
    #[error("The classifier has not been trained")]
    NotTrained,
    #[error("Invalid classifier model: {0}")]
    InvalidModel(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the current head and its trained/untrained state.
#[derive(Debug)]
pub struct Classifier {
    config: TrainingConfig,
    head: Option<ClassifierModel>,
}

impl Classifier {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config, head: None }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        self.head.is_some()
    }

    pub fn model(&self) -> Option<&ClassifierModel> {
        self.head.as_ref()
    }

    /// Whether the trained head covers exactly `keys`.
    pub fn matches_classes(&self, keys: &[ClassKey]) -> bool {
        self.head
            .as_ref()
            .is_some_and(|head| head.class_keys.as_slice() == keys)
    }

    /// Check that every class has enough samples and return the snapshot to train on.
    pub fn training_records(
        &self,
        store: &DatasetStore,
    ) -> Result<Vec<(ClassKey, ClassRecord)>, TrainError> {
        let records = store.records();
        if records.is_empty() {
            return Err(TrainError::NoClasses);
        }
        let required = self.config.min_samples;
        if let Some((key, record)) = records
            .iter()
            .find(|(_, record)| record.features.len() < required)
        {
            return Err(TrainError::InsufficientData {
                key: *key,
                name: record.name.clone(),
                samples: record.features.len(),
                required,
            });
        }
        Ok(records)
    }

    /// Validate the dataset and start a session. The head is dropped only once
    /// validation has passed.
    pub fn begin_training(&mut self, store: &DatasetStore) -> Result<TrainingSession, TrainError> {
        let records = self.training_records(store)?;
        self.head = None;
        let session = TrainingSession::new(&records, &self.config)?;
        info!(
            classes = records.len(),
            samples = session.samples(),
            epochs = session.total_epochs(),
            "Classifier training started"
        );
        Ok(session)
    }

    /// Persist the session's result, then adopt it as the trained head.
    pub fn complete_training(
        &mut self,
        session: TrainingSession,
        store: &DatasetStore,
    ) -> Result<(), TrainError> {
        let model = session.into_model();
        store.save_model(&model)?;
        if let Some(metrics) = model.metrics {
            info!(
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                "Classifier training finished"
            );
        }
        self.head = Some(model);
        Ok(())
    }

    /// Train to completion, reporting progress in `[0, 1]` after each epoch.
    pub fn train(
        &mut self,
        store: &DatasetStore,
        mut progress: impl FnMut(f32),
    ) -> Result<(), TrainError> {
        let mut session = self.begin_training(store)?;
        progress(0.0);
        while !session.is_finished() {
            let report = session.step_epoch();
            progress(report.progress());
        }
        self.complete_training(session, store)
    }

    /// Forget the trained head and delete its persisted copy.
    pub fn discard(&mut self, store: &DatasetStore) -> Result<(), StoreError> {
        let had_head = self.head.take().is_some();
        let had_saved = store.remove_model()?;
        if had_head || had_saved {
            info!("Discarded trained classifier");
        }
        Ok(())
    }

    /// Forget the trained head without touching storage.
    pub fn invalidate(&mut self) {
        self.head = None;
    }

    /// Adopt the persisted head if it matches the store's current classes.
    ///
    /// Stale or unreadable models are deleted. Returns whether a head was restored.
    pub fn restore(&mut self, store: &DatasetStore) -> Result<bool, TrainError> {
        let model = match store.load_model::<ClassifierModel>() {
            Ok(model) => model,
            Err(StoreError::ModelNotFound(_)) => return Ok(false),
            Err(StoreError::Serialize(err)) => {
                warn!("Discarding unreadable classifier model: {err}");
                store.remove_model()?;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(reason) = model.validate() {
            warn!("Discarding invalid classifier model: {reason}");
            store.remove_model()?;
            return Ok(false);
        }
        if model.class_keys != store.keys() {
            warn!("Discarding classifier model trained for a different class set");
            store.remove_model()?;
            return Ok(false);
        }
        info!(classes = model.num_classes(), "Restored trained classifier");
        self.head = Some(model);
        Ok(true)
    }

    pub fn predict(&self, features: &[f32]) -> Result<PredictionSample, TrainError> {
        let head = self.head.as_ref().ok_or(TrainError::NotTrained)?;
        head.predict(features).map_err(TrainError::InvalidModel)
    }
}
