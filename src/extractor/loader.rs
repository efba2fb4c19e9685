use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};

use crate::task::Pending;

use super::{ExtractorSource, FeatureExtractor, LoadError};

pub(crate) type LoadOutcome = Result<Arc<dyn FeatureExtractor>, LoadError>;

/// Loads an extractor at most once and shares the outcome.
///
/// The first [`load`](Self::load) spawns a background fetch plus warm-up;
/// every later call returns the same [`Pending`]. A failed load stays failed
/// for the lifetime of the loader; a panicking source fails with
/// [`LoadError::Abandoned`].
pub struct FeatureExtractorLoader {
    source: Arc<dyn ExtractorSource>,
    state: Mutex<Option<Pending<LoadOutcome>>>,
}

impl FeatureExtractorLoader {
    pub fn new(source: impl ExtractorSource) -> Self {
        Self {
            source: Arc::new(source),
            state: Mutex::new(None),
        }
    }

    pub fn load(&self) -> Pending<LoadOutcome> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pending) = state.as_ref() {
            return pending.clone();
        }
        let (pending, resolver) = Pending::new();
        *state = Some(pending.clone());
        drop(state);

        let source = Arc::clone(&self.source);
        let worker = resolver.clone();
        let spawned = thread::Builder::new()
            .name("cardlearn-extractor-load".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    fetch_and_warm(source.as_ref())
                }))
                .unwrap_or_else(|_| {
                    warn!("Feature extractor load panicked");
                    Err(LoadError::Abandoned)
                });
                match &outcome {
                    Ok(model) => info!(features = model.feature_len(), "Feature extractor ready"),
                    Err(err) => warn!("Feature extractor failed to load: {err}"),
                }
                worker.resolve(outcome);
            });
        if let Err(err) = spawned {
            warn!("Failed to spawn extractor load thread: {err}");
            resolver.resolve(Err(LoadError::Init(err.to_string())));
        }
        pending
    }

    /// The extractor, if loading has already succeeded.
    pub fn ready(&self) -> Option<Arc<dyn FeatureExtractor>> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .as_ref()
            .and_then(Pending::poll)
            .and_then(Result::ok)
    }

    /// The load failure, if loading has already failed.
    pub fn failure(&self) -> Option<LoadError> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .as_ref()
            .and_then(Pending::poll)
            .and_then(Result::err)
    }
}

fn fetch_and_warm(source: &dyn ExtractorSource) -> LoadOutcome {
    let model = source.fetch()?;
    model
        .warm_up()
        .map_err(|err| LoadError::WarmUp(err.to_string()))?;
    Ok(model)
}
