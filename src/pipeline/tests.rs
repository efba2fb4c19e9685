use super::*;
use crate::extractor::{ExtractError, ExtractorSource, LoadError};
use crate::frame::Frame;
use crate::scheduler::ManualTicks;
use crate::tensor::TensorLedger;
use std::sync::Mutex;
use tempfile::{TempDir, tempdir};

#[derive(Clone, Default)]
struct Camera {
    streaming: Arc<AtomicBool>,
    color: Arc<Mutex<[u8; 3]>>,
}

impl Camera {
    fn show(&self, color: [u8; 3]) {
        *self.color.lock().unwrap() = color;
    }
}

impl FrameSource for Camera {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn current_frame(&mut self) -> Option<Frame> {
        let color = *self.color.lock().unwrap();
        Some(Frame::solid(4, 4, color))
    }

    fn stop(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
    }
}

struct ColorFeatures;

impl FeatureExtractor for ColorFeatures {
    fn feature_len(&self) -> usize {
        6
    }

    fn input_size(&self) -> u32 {
        4
    }

    fn extract(&self, frame: &Frame) -> Result<Vec<f32>, ExtractError> {
        let rgb: Vec<f32> = frame.pixels()[..3]
            .iter()
            .map(|&v| f32::from(v) / 255.0)
            .collect();
        Ok(rgb.iter().copied().chain(rgb.iter().map(|v| 1.0 - v)).collect())
    }
}

struct Source {
    fail: bool,
}

impl ExtractorSource for Source {
    fn fetch(&self) -> Result<Arc<dyn FeatureExtractor>, LoadError> {
        if self.fail {
            return Err(LoadError::Download("offline".into()));
        }
        Ok(Arc::new(ColorFeatures))
    }
}

const RED: [u8; 3] = [220, 10, 10];
const BLUE: [u8; 3] = [10, 10, 220];

fn config() -> TrainingConfig {
    TrainingConfig {
        min_samples: 5,
        epochs: 10,
        batch_size: 5,
        hidden_units: 8,
        learning_rate: 0.05,
        ..TrainingConfig::default()
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<DatasetStore>,
    loader: Arc<FeatureExtractorLoader>,
    camera: Camera,
    pipeline: CapturePipeline,
}

impl Harness {
    fn new(fail_load: bool) -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            DatasetStore::open(dir.path().join("dataset.db"), TensorLedger::new()).unwrap(),
        );
        let loader = Arc::new(FeatureExtractorLoader::new(Source { fail: fail_load }));
        let camera = Camera::default();
        let mut pipeline =
            CapturePipeline::new(Arc::clone(&store), Arc::clone(&loader), config()).unwrap();
        pipeline.attach(Box::new(camera.clone())).unwrap();
        Self {
            _dir: dir,
            store,
            loader,
            camera,
            pipeline,
        }
    }

    fn start_capture(&mut self) -> Result<(), CaptureError> {
        let pending = self.pipeline.enable_capture();
        let _ = self.loader.load().wait();
        self.pipeline.tick();
        pending.poll().unwrap()
    }

    fn gather(&mut self, key: ClassKey, color: [u8; 3], frames: usize) {
        self.camera.show(color);
        let done = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&done);
        self.pipeline
            .begin_data_gather(key, |_| {}, move |outcome| {
                *slot.lock().unwrap() = Some(outcome.is_ok());
            })
            .unwrap();
        self.pipeline.run(&mut ManualTicks(frames));
        self.pipeline.end_data_gather();
        self.pipeline.tick();
        assert_eq!(*done.lock().unwrap(), Some(true));
    }

    fn train(&mut self) {
        let pending = self.pipeline.train_and_predict(|_| {});
        self.pipeline.run(&mut ManualTicks(config().epochs));
        pending.poll().unwrap().unwrap();
    }
}

#[test]
fn attach_twice_is_rejected() {
    let mut harness = Harness::new(false);
    let err = harness
        .pipeline
        .attach(Box::new(Camera::default()))
        .unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyAttached));
    assert!(harness.pipeline.detach().is_some());
    assert!(harness.pipeline.attach(Box::new(Camera::default())).is_ok());
}

#[test]
fn enable_capture_surfaces_load_failure() {
    let mut harness = Harness::new(true);
    let err = harness.start_capture().unwrap_err();
    assert_eq!(
        err,
        CaptureError::Load(LoadError::Download("offline".into()))
    );
    assert!(!harness.pipeline.capture_active());
    assert!(!harness.camera.is_streaming());
}

#[test]
fn enable_capture_is_idempotent() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    let again = harness.pipeline.enable_capture();
    assert_eq!(again.poll(), Some(Ok(())));
}

#[test]
fn gather_requires_active_capture() {
    let mut harness = Harness::new(false);
    harness.store.add_card(ClassKey(0), "cat").unwrap();
    let err = harness
        .pipeline
        .begin_data_gather(ClassKey(0), |_| {}, |_| {})
        .unwrap_err();
    assert!(matches!(err, PipelineError::CaptureNotActive));
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
}

#[test]
fn gather_rejects_unknown_key() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    let err = harness
        .pipeline
        .begin_data_gather(ClassKey(4), |_| {}, |_| {})
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownKey(ClassKey(4))));
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
}

#[test]
fn gather_collects_one_sample_per_tick_and_stops_at_tick_boundary() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "cat").unwrap();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    harness
        .pipeline
        .begin_data_gather(
            ClassKey(0),
            move |count| seen.lock().unwrap().push(count),
            |_| {},
        )
        .unwrap();
    harness.pipeline.run(&mut ManualTicks(3));
    assert_eq!(*progress.lock().unwrap(), vec![1, 2, 3]);

    harness.pipeline.end_data_gather();
    assert_eq!(harness.pipeline.mode(), PipelineMode::Gathering(ClassKey(0)));
    harness.pipeline.tick();
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
    assert_eq!(harness.store.sample_count(ClassKey(0)), 3);
    assert_eq!(progress.lock().unwrap().len(), 3);
    assert_eq!(harness.store.ledger().live(), 3);
}

#[test]
fn detaching_mid_gather_discards_the_buffer() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "cat").unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    harness
        .pipeline
        .begin_data_gather(ClassKey(0), |_| {}, move |result| {
            *slot.lock().unwrap() = Some(result);
        })
        .unwrap();
    harness.pipeline.run(&mut ManualTicks(2));
    harness.pipeline.detach();
    harness.pipeline.tick();

    let outcome = outcome.lock().unwrap().take().unwrap();
    assert!(matches!(outcome, Err(PipelineError::CaptureNotActive)));
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
    assert_eq!(harness.store.sample_count(ClassKey(0)), 0);
    assert_eq!(harness.store.ledger().live(), 0);
}

#[test]
fn late_capturing_subscriber_is_told_capture_is_active() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    harness
        .pipeline
        .events()
        .on(PipelineEventKind::Capturing, move |_| {
            *counter.lock().unwrap() += 1;
        });
    assert_eq!(*calls.lock().unwrap(), 0);
    harness.pipeline.tick();
    assert_eq!(*calls.lock().unwrap(), 1);
    harness.pipeline.tick();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn prediction_reports_real_class_keys_without_leaking() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(3), "red").unwrap();
    harness.store.add_card(ClassKey(7), "blue").unwrap();
    harness.gather(ClassKey(3), RED, 10);
    harness.gather(ClassKey(7), BLUE, 10);
    harness.train();
    assert!(harness.pipeline.is_predicting());

    let predictions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&predictions);
    harness
        .pipeline
        .events()
        .on(PipelineEventKind::Predict, move |event| {
            if let PipelineEvent::Predict(sample) = event {
                seen.lock().unwrap().push(sample.key);
            }
        });
    let baseline = harness.store.ledger().live();
    harness.camera.show(BLUE);
    harness.pipeline.run(&mut ManualTicks(4));
    assert_eq!(harness.store.ledger().live(), baseline);
    assert_eq!(*predictions.lock().unwrap(), vec![ClassKey(7); 4]);
}

#[test]
fn dataset_change_discards_classifier_and_stops_prediction() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "red").unwrap();
    harness.store.add_card(ClassKey(1), "blue").unwrap();
    harness.gather(ClassKey(0), RED, 6);
    harness.gather(ClassKey(1), BLUE, 6);
    harness.train();
    assert!(harness.store.has_model().unwrap());

    harness.store.add_card(ClassKey(2), "green").unwrap();
    harness.pipeline.tick();
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
    assert!(!harness.pipeline.is_trained());
    assert!(!harness.store.has_model().unwrap());
}

#[test]
fn reset_cancels_training_and_clears_the_store() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "red").unwrap();
    harness.gather(ClassKey(0), RED, 5);
    let pending = harness.pipeline.train_and_predict(|_| {});
    harness.pipeline.tick();
    assert!(harness.pipeline.is_training());

    harness.pipeline.reset().unwrap();
    assert!(matches!(
        pending.poll(),
        Some(Err(PipelineError::Cancelled))
    ));
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
    assert!(harness.store.is_empty());
    assert_eq!(harness.store.ledger().live(), 0);
}

#[test]
fn training_progress_is_reported_per_tick() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "red").unwrap();
    harness.store.add_card(ClassKey(1), "blue").unwrap();
    harness.gather(ClassKey(0), RED, 5);
    harness.gather(ClassKey(1), BLUE, 5);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let pending = harness
        .pipeline
        .train_and_predict(move |fraction| seen.lock().unwrap().push(fraction));
    assert_eq!(*progress.lock().unwrap(), vec![0.0]);
    harness.pipeline.tick();
    assert_eq!(progress.lock().unwrap().len(), 2);
    assert!(pending.poll().is_none());
    harness.pipeline.run(&mut ManualTicks(9));
    assert_eq!(progress.lock().unwrap().len(), 11);
    assert_eq!(progress.lock().unwrap().last().copied(), Some(1.0));
    assert!(matches!(pending.poll(), Some(Ok(()))));
}

#[test]
fn insufficient_data_does_not_announce_training() {
    let mut harness = Harness::new(false);
    harness.start_capture().unwrap();
    harness.store.add_card(ClassKey(0), "red").unwrap();
    harness.gather(ClassKey(0), RED, 2);

    let announced = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&announced);
    harness
        .pipeline
        .events()
        .on(PipelineEventKind::Training, move |_| {
            *counter.lock().unwrap() += 1;
        });
    let pending = harness.pipeline.train_and_predict(|_| {});
    harness.pipeline.tick();

    assert!(matches!(
        pending.poll(),
        Some(Err(PipelineError::Train(err))) if matches!(*err, TrainError::InsufficientData { .. })
    ));
    assert_eq!(*announced.lock().unwrap(), 0);
    assert_eq!(harness.pipeline.mode(), PipelineMode::Idle);
}

#[test]
fn dataset_change_removes_saved_model_without_trained_head() {
    let mut harness = Harness::new(false);
    harness
        .store
        .save_model(&serde_json::json!({ "class_keys": [9] }))
        .unwrap();
    assert!(!harness.pipeline.is_trained());

    harness.store.add_card(ClassKey(0), "red").unwrap();
    harness.pipeline.tick();
    assert!(!harness.store.has_model().unwrap());
}
