//! Capture/train/infer state machine.
//!
//! The pipeline is driven by [`CapturePipeline::tick`], called once per frame
//! by a [`TickSource`]. Each tick runs queued bus hooks, folds in dataset
//! changes, advances capture start-up and then performs one step of the
//! active mode. Mode changes requested between ticks take effect at the next
//! tick boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use crate::classifier::{Classifier, PredictionSample, TrainError, TrainingSession};
use crate::config::TrainingConfig;
use crate::dataset::{ClassKey, DatasetStore, StoreError, StoreEventKind};
use crate::events::{BusEvent, EventBus, Subscription};
use crate::extractor::{FeatureExtractor, FeatureExtractorLoader};
use crate::frame::{CaptureError, FrameSource};
use crate::scheduler::TickSource;
use crate::task::{CancelToken, Pending, Resolver};
use crate::tensor::FeatureVector;

mod gather;
mod predict;

#[cfg(test)]
mod tests;

/// Notifications emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineEvent {
    /// Frames are flowing and the extractor is ready.
    Capturing,
    /// A training run started.
    Training,
    /// The inference loop started.
    Predicting,
    Predict(PredictionSample),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEventKind {
    Capturing,
    Training,
    Predicting,
    Predict,
}

impl BusEvent for PipelineEvent {
    type Kind = PipelineEventKind;

    fn kind(&self) -> PipelineEventKind {
        match self {
            PipelineEvent::Capturing => PipelineEventKind::Capturing,
            PipelineEvent::Training => PipelineEventKind::Training,
            PipelineEvent::Predicting => PipelineEventKind::Predicting,
            PipelineEvent::Predict(_) => PipelineEventKind::Predict,
        }
    }
}

/// The single active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Idle,
    Gathering(ClassKey),
    Training,
    Predicting,
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("A frame source is already attached")]
    AlreadyAttached,
    #[error("Capture is not active")]
    CaptureNotActive,
    #[error("No class with key {0}")]
    UnknownKey(ClassKey),
    #[error(transparent)]
    Train(Arc<TrainError>),
    #[error(transparent)]
    Store(Arc<StoreError>),
    #[error("The operation was cancelled")]
    Cancelled,
}

impl From<TrainError> for PipelineError {
    fn from(err: TrainError) -> Self {
        match err {
            TrainError::Store(err) => PipelineError::Store(Arc::new(err)),
            other => PipelineError::Train(Arc::new(other)),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(Arc::new(err))
    }
}

pub type GatherProgress = Box<dyn FnMut(usize) + Send>;
pub type GatherDone = Box<dyn FnOnce(Result<(), PipelineError>) + Send>;
pub type TrainProgress = Box<dyn FnMut(f32) + Send>;

enum CaptureState {
    Off,
    Starting {
        pending: Pending<Result<(), CaptureError>>,
        resolver: Resolver<Result<(), CaptureError>>,
    },
    Active,
}

struct GatherSession {
    key: ClassKey,
    buffer: Vec<FeatureVector>,
    stop: CancelToken,
    on_progress: GatherProgress,
    on_done: GatherDone,
}

struct TrainingRun {
    session: TrainingSession,
    on_progress: TrainProgress,
    resolver: Resolver<Result<(), PipelineError>>,
}

enum Activity {
    Idle,
    Gathering(GatherSession),
    Training(TrainingRun),
    Predicting,
}

/// Orchestrates the frame source, extractor, dataset and classifier.
pub struct CapturePipeline {
    store: Arc<DatasetStore>,
    loader: Arc<FeatureExtractorLoader>,
    classifier: Classifier,
    events: EventBus<PipelineEvent>,
    source: Option<Box<dyn FrameSource>>,
    capture: CaptureState,
    capture_live: Arc<AtomicBool>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    activity: Activity,
    dataset_changed: Arc<AtomicBool>,
    store_subscriptions: Vec<Subscription>,
}

impl CapturePipeline {
    /// Build a pipeline over a shared store and loader, restoring any persisted
    /// classifier that still matches the store's classes.
    pub fn new(
        store: Arc<DatasetStore>,
        loader: Arc<FeatureExtractorLoader>,
        config: TrainingConfig,
    ) -> Result<Self, PipelineError> {
        let mut classifier = Classifier::new(config);
        classifier.restore(&store)?;

        let capture_live = Arc::new(AtomicBool::new(false));
        let live = Arc::clone(&capture_live);
        let events = EventBus::new().with_subscriber_hook(move |bus, kind| {
            if kind == PipelineEventKind::Capturing && live.load(Ordering::Acquire) {
                bus.dispatch(&PipelineEvent::Capturing);
            }
        });

        let dataset_changed = Arc::new(AtomicBool::new(false));
        let store_subscriptions = StoreEventKind::ALL
            .into_iter()
            .map(|kind| {
                let changed = Arc::clone(&dataset_changed);
                store.events().on(kind, move |_| {
                    changed.store(true, Ordering::Release);
                })
            })
            .collect();

        Ok(Self {
            store,
            loader,
            classifier,
            events,
            source: None,
            capture: CaptureState::Off,
            capture_live,
            extractor: None,
            activity: Activity::Idle,
            dataset_changed,
            store_subscriptions,
        })
    }

    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.events
    }

    pub fn store(&self) -> &Arc<DatasetStore> {
        &self.store
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn mode(&self) -> PipelineMode {
        match &self.activity {
            Activity::Idle => PipelineMode::Idle,
            Activity::Gathering(session) => PipelineMode::Gathering(session.key),
            Activity::Training(_) => PipelineMode::Training,
            Activity::Predicting => PipelineMode::Predicting,
        }
    }

    pub fn is_gathering(&self) -> bool {
        matches!(self.activity, Activity::Gathering(_))
    }

    pub fn is_training(&self) -> bool {
        matches!(self.activity, Activity::Training(_))
    }

    pub fn is_predicting(&self) -> bool {
        matches!(self.activity, Activity::Predicting)
    }

    pub fn is_trained(&self) -> bool {
        self.classifier.is_trained()
    }

    /// Whether frames are flowing and the extractor is loaded.
    pub fn capture_active(&self) -> bool {
        matches!(self.capture, CaptureState::Active)
            && self.extractor.is_some()
            && self.source.as_ref().is_some_and(|source| source.is_streaming())
    }

    /// True when the class has at least the minimum number of samples.
    pub fn has_data(&self, key: ClassKey) -> bool {
        self.store.sample_count(key) >= self.classifier.config().min_samples
    }

    /// Number of samples stored for the class.
    pub fn sample_count(&self, key: ClassKey) -> usize {
        self.store.sample_count(key)
    }

    pub fn attach(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        if self.source.is_some() {
            return Err(PipelineError::AlreadyAttached);
        }
        self.source = Some(source);
        info!("Frame source attached");
        Ok(())
    }

    /// Stop and return the frame source. Running frame loops end at the next tick.
    pub fn detach(&mut self) -> Option<Box<dyn FrameSource>> {
        let mut source = self.source.take()?;
        source.stop();
        if let CaptureState::Starting { resolver, .. } =
            std::mem::replace(&mut self.capture, CaptureState::Off)
        {
            resolver.resolve(Err(CaptureError::NotAttached));
        }
        self.capture_live.store(false, Ordering::Release);
        info!("Frame source detached");
        Some(source)
    }

    /// Start the frame source and the extractor load.
    ///
    /// Resolves once frames are flowing and the extractor is ready; idempotent
    /// while starting or active.
    pub fn enable_capture(&mut self) -> Pending<Result<(), CaptureError>> {
        if let CaptureState::Starting { pending, .. } = &self.capture {
            return pending.clone();
        }
        if self.capture_active() {
            return Pending::resolved(Ok(()));
        }
        let Some(source) = self.source.as_mut() else {
            return Pending::resolved(Err(CaptureError::NotAttached));
        };
        if !source.is_streaming()
            && let Err(err) = source.start()
        {
            warn!("Frame source failed to start: {err}");
            return Pending::resolved(Err(err));
        }
        self.loader.load();
        let (pending, resolver) = Pending::new();
        self.capture = CaptureState::Starting {
            pending: pending.clone(),
            resolver,
        };
        self.poll_capture();
        pending
    }

    /// Stop any running loop, clear the dataset and discard the classifier.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        self.stop_activity(PipelineError::Cancelled);
        self.store.clear()?;
        self.sync_dataset();
        info!("Pipeline reset");
        Ok(())
    }

    /// Drive [`tick`](Self::tick) until the source ends.
    pub fn run(&mut self, ticks: &mut dyn TickSource) {
        while ticks.next_tick() {
            self.tick();
        }
    }

    /// Advance the pipeline by one frame.
    pub fn tick(&mut self) {
        self.events.run_deferred();
        self.sync_dataset();
        self.poll_capture();
        match self.activity {
            Activity::Idle => {}
            Activity::Gathering(_) => self.gather_step(),
            Activity::Training(_) => self.training_step(),
            Activity::Predicting => self.predict_step(),
        }
    }

    /// Apply dataset changes observed since the last call: the class set may
    /// have changed, so the trained head is dropped and inference stops.
    fn sync_dataset(&mut self) {
        if !self.dataset_changed.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.classifier.discard(&self.store) {
            warn!("Failed to discard stale classifier: {err}");
            self.classifier.invalidate();
        }
        match self.activity {
            Activity::Predicting => {
                info!("Dataset changed; prediction stopped");
                self.activity = Activity::Idle;
            }
            Activity::Training(_) => {
                info!("Dataset changed; training cancelled");
                self.stop_activity(PipelineError::Cancelled);
            }
            _ => {}
        }
    }

    fn poll_capture(&mut self) {
        let streaming = self
            .source
            .as_ref()
            .is_some_and(|source| source.is_streaming());
        let resolver = match &self.capture {
            CaptureState::Off => return,
            CaptureState::Active => {
                let live = streaming && self.extractor.is_some();
                self.capture_live.store(live, Ordering::Release);
                return;
            }
            CaptureState::Starting { resolver, .. } => resolver.clone(),
        };
        let Some(outcome) = self.loader.load().poll() else {
            return;
        };
        match outcome {
            Err(err) => {
                resolver.resolve(Err(CaptureError::Load(err)));
                if let Some(source) = self.source.as_mut() {
                    source.stop();
                }
                self.capture = CaptureState::Off;
            }
            Ok(extractor) if streaming => {
                resolver.resolve(Ok(()));
                self.extractor = Some(extractor);
                self.capture = CaptureState::Active;
                self.capture_live.store(true, Ordering::Release);
                info!("Capture active");
                self.events.dispatch(&PipelineEvent::Capturing);
            }
            Ok(_) => {}
        }
    }

    /// End the current activity, notifying its owner with `reason`.
    fn stop_activity(&mut self, reason: PipelineError) {
        match std::mem::replace(&mut self.activity, Activity::Idle) {
            Activity::Idle | Activity::Predicting => {}
            Activity::Gathering(session) => {
                info!(key = %session.key, "Data gather cancelled");
                (session.on_done)(Err(reason));
            }
            Activity::Training(run) => {
                info!("Training cancelled");
                run.resolver.resolve(Err(reason));
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        for subscription in &self.store_subscriptions {
            subscription.unsubscribe();
        }
        self.stop_activity(PipelineError::Cancelled);
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("mode", &self.mode())
            .field("capture_active", &self.capture_active())
            .field("trained", &self.classifier.is_trained())
            .finish()
    }
}
