//! Shared completion cells and cancellation tokens.
//!
//! [`Pending`] is the result handle handed to callers of long operations
//! (extractor load, capture start, training). Any number of clones observe the
//! same outcome; the paired [`Resolver`] settles it exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Cell<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// Clonable handle to a value that may not be available yet.
pub struct Pending<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Write side of a [`Pending`]. The first call to [`Resolver::resolve`] wins.
pub struct Resolver<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Pending<T> {
    /// Create an unresolved cell and its resolver.
    pub fn new() -> (Self, Resolver<T>) {
        let cell = Arc::new(Cell {
            value: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            Self {
                cell: Arc::clone(&cell),
            },
            Resolver { cell },
        )
    }

    /// Create a cell that is already settled.
    pub fn resolved(value: T) -> Self {
        let (pending, resolver) = Self::new();
        resolver.resolve(value);
        pending
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().is_some()
    }

    /// Remove the value, leaving the cell unresolved for other observers.
    ///
    /// Intended for single-consumer cells.
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.cell
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Pending<T> {
    /// Non-blocking read of the outcome.
    pub fn poll(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Block until the outcome is available.
    pub fn wait(&self) -> T {
        let mut guard = self.lock();
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = self
                .cell
                .ready
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block for at most `timeout`; `None` if still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (guard, _) = self
            .cell
            .ready
            .wait_timeout_while(guard, timeout, |value| value.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }
}

impl<T> Resolver<T> {
    /// Settle the cell. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        let mut guard = self
            .cell
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        self.cell.ready.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.cell
            .value
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }
}

/// Cooperative cancellation flag checked at tick boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
