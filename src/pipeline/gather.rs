use tracing::{debug, info, warn};

use crate::dataset::ClassKey;
use crate::task::CancelToken;

use super::{
    Activity, CapturePipeline, GatherDone, GatherProgress, GatherSession, PipelineError,
};

impl CapturePipeline {
    /// Start collecting feature vectors for `key`, one per tick.
    ///
    /// The trained classifier is discarded because the class composition is
    /// about to change. `on_progress` receives the buffer length after every
    /// captured frame; `on_done` receives the outcome once the buffer has been
    /// stored, or the reason the session was abandoned.
    pub fn begin_data_gather(
        &mut self,
        key: ClassKey,
        on_progress: impl FnMut(usize) + Send + 'static,
        on_done: impl FnOnce(Result<(), PipelineError>) + Send + 'static,
    ) -> Result<(), PipelineError> {
        if !self.capture_active() {
            return Err(PipelineError::CaptureNotActive);
        }
        if !self.store.contains(key) {
            return Err(PipelineError::UnknownKey(key));
        }
        if let Activity::Gathering(_) = self.activity {
            self.finish_gather();
        }
        self.stop_activity(PipelineError::Cancelled);
        self.sync_dataset();
        self.classifier.discard(&self.store)?;

        let on_progress: GatherProgress = Box::new(on_progress);
        let on_done: GatherDone = Box::new(on_done);
        self.activity = Activity::Gathering(GatherSession {
            key,
            buffer: Vec::new(),
            stop: CancelToken::new(),
            on_progress,
            on_done,
        });
        info!(%key, "Data gather started");
        Ok(())
    }

    /// Ask the running gather session to stop. It is stored at the next tick.
    pub fn end_data_gather(&mut self) {
        if let Activity::Gathering(session) = &self.activity {
            session.stop.cancel();
        }
    }

    /// Token that ends the running gather session when cancelled.
    pub fn gather_stop_token(&self) -> Option<CancelToken> {
        match &self.activity {
            Activity::Gathering(session) => Some(session.stop.clone()),
            _ => None,
        }
    }

    pub(super) fn gather_step(&mut self) {
        let stop_requested = match &self.activity {
            Activity::Gathering(session) => session.stop.is_cancelled(),
            _ => return,
        };
        if stop_requested {
            self.finish_gather();
            return;
        }
        if !self.capture_active() {
            warn!("Capture stopped during data gather; samples discarded");
            self.stop_activity(PipelineError::CaptureNotActive);
            return;
        }

        let (Some(source), Some(extractor)) = (self.source.as_mut(), self.extractor.as_ref())
        else {
            return;
        };
        let Some(frame) = source.current_frame() else {
            debug!("No frame available; gather tick skipped");
            return;
        };
        let values = match extractor.extract(&frame) {
            Ok(values) => values,
            Err(err) => {
                warn!("Feature extraction failed during gather: {err}");
                return;
            }
        };
        let mut scope = self.store.ledger().scope();
        let vector = scope.alloc(values).clone();
        if let Activity::Gathering(session) = &mut self.activity {
            session.buffer.push(vector);
            let count = session.buffer.len();
            (session.on_progress)(count);
        }
    }

    /// Store the running session's buffer and return to idle.
    pub(super) fn finish_gather(&mut self) {
        let Activity::Gathering(session) = std::mem::replace(&mut self.activity, Activity::Idle)
        else {
            return;
        };
        let GatherSession {
            key, buffer, on_done, ..
        } = session;
        let samples = buffer.len();
        let outcome = self
            .store
            .set_training_inputs(key, buffer)
            .map_err(PipelineError::from);
        match &outcome {
            Ok(()) => info!(%key, samples, "Data gather finished"),
            Err(err) => warn!(%key, "Failed to store gathered samples: {err}"),
        }
        self.sync_dataset();
        on_done(outcome);
    }
}
