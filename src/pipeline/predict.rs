use tracing::{debug, info, warn};

use crate::task::Pending;

use super::{Activity, CapturePipeline, PipelineError, PipelineEvent, TrainProgress, TrainingRun};

impl CapturePipeline {
    /// Train the classifier, then run inference every tick.
    ///
    /// Training advances one epoch per tick; no frames are captured while it
    /// runs. A classifier already trained for the current classes is reused
    /// and `on_progress` receives `1.0` straight away. The returned handle
    /// resolves when training finishes and prediction has started.
    pub fn train_and_predict(
        &mut self,
        on_progress: impl FnMut(f32) + Send + 'static,
    ) -> Pending<Result<(), PipelineError>> {
        let mut on_progress: TrainProgress = Box::new(on_progress);
        if !self.capture_active() {
            return Pending::resolved(Err(PipelineError::CaptureNotActive));
        }
        if let Activity::Gathering(_) = self.activity {
            self.finish_gather();
        }
        self.stop_activity(PipelineError::Cancelled);
        self.sync_dataset();

        if self.classifier.matches_classes(&self.store.keys()) {
            on_progress(1.0);
            self.start_predicting();
            return Pending::resolved(Ok(()));
        }

        let session = match self.classifier.begin_training(&self.store) {
            Ok(session) => session,
            Err(err) => {
                warn!("Training could not start: {err}");
                return Pending::resolved(Err(err.into()));
            }
        };
        self.events.dispatch(&PipelineEvent::Training);
        on_progress(0.0);
        let (pending, resolver) = Pending::new();
        self.activity = Activity::Training(TrainingRun {
            session,
            on_progress,
            resolver,
        });
        pending
    }

    pub(super) fn training_step(&mut self) {
        let finished = match &mut self.activity {
            Activity::Training(run) => {
                if !run.session.is_finished() {
                    let report = run.session.step_epoch();
                    (run.on_progress)(report.progress());
                }
                run.session.is_finished()
            }
            _ => return,
        };
        if !finished {
            return;
        }
        let Activity::Training(run) = std::mem::replace(&mut self.activity, Activity::Idle) else {
            return;
        };
        let TrainingRun {
            session, resolver, ..
        } = run;
        match self.classifier.complete_training(session, &self.store) {
            Ok(()) => {
                self.start_predicting();
                resolver.resolve(Ok(()));
            }
            Err(err) => {
                warn!("Training failed: {err}");
                resolver.resolve(Err(err.into()));
            }
        }
    }

    fn start_predicting(&mut self) {
        self.activity = Activity::Predicting;
        info!("Prediction started");
        self.events.dispatch(&PipelineEvent::Predicting);
    }

    pub(super) fn predict_step(&mut self) {
        if !self.capture_active() {
            return;
        }
        let (Some(source), Some(extractor)) = (self.source.as_mut(), self.extractor.as_ref())
        else {
            return;
        };
        let Some(frame) = source.current_frame() else {
            debug!("No frame available; predict tick skipped");
            return;
        };
        let mut scope = self.store.ledger().scope();
        let features = match extractor.extract(&frame) {
            Ok(values) => scope.alloc(values),
            Err(err) => {
                warn!("Feature extraction failed during predict: {err}");
                return;
            }
        };
        match self.classifier.predict(features) {
            Ok(sample) => self.events.dispatch(&PipelineEvent::Predict(sample)),
            Err(err) => warn!("Prediction failed: {err}"),
        }
    }
}
