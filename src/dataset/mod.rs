//! Durable keyed collection of per-class feature samples and the trained model.
//!
//! SQLite is the source of truth; an in-memory mirror serves reads without I/O.
//! Mutations are serialized behind one lock, committed before the mirror
//! changes, and announced on the store's [`EventBus`] only after commit.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::app_dirs;
use crate::config::StorageSettings;
use crate::events::{BusEvent, EventBus};
use crate::tensor::{FeatureVector, TensorLedger};

mod read;
mod schema;
mod write;

#[cfg(test)]
mod tests;

/// Logical name under which the classifier head is persisted.
pub const MODEL_ARTIFACT_NAME: &str = "classifier";

/// Identifier of one learnable class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClassKey(pub u32);

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One class: its display name and gathered feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRecord {
    pub name: String,
    pub features: Vec<FeatureVector>,
}

/// Change notifications, dispatched after the change is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    AddCard { key: ClassKey },
    ChangeCard { key: ClassKey },
    DeleteCard { key: ClassKey },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    AddCard,
    ChangeCard,
    DeleteCard,
    Reset,
}

impl StoreEventKind {
    pub const ALL: [StoreEventKind; 4] = [
        StoreEventKind::AddCard,
        StoreEventKind::ChangeCard,
        StoreEventKind::DeleteCard,
        StoreEventKind::Reset,
    ];
}

impl BusEvent for StoreEvent {
    type Kind = StoreEventKind;

    fn kind(&self) -> StoreEventKind {
        match self {
            StoreEvent::AddCard { .. } => StoreEventKind::AddCard,
            StoreEvent::ChangeCard { .. } => StoreEventKind::ChangeCard,
            StoreEvent::DeleteCard { .. } => StoreEventKind::DeleteCard,
            StoreEvent::Reset => StoreEventKind::Reset,
        }
    }
}

impl StoreEvent {
    pub fn key(&self) -> Option<ClassKey> {
        match self {
            StoreEvent::AddCard { key }
            | StoreEvent::ChangeCard { key }
            | StoreEvent::DeleteCard { key } => Some(*key),
            StoreEvent::Reset => None,
        }
    }
}

/// Errors returned by [`DatasetStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No class with key {0}")]
    UnknownKey(ClassKey),
    #[error("The dataset has no classes")]
    EmptyDataset,
    #[error("No saved model named '{0}'")]
    ModelNotFound(String),
    #[error("Dataset transaction failed: {0}")]
    Transaction(#[from] rusqlite::Error),
    #[error("Dataset database is busy, please retry")]
    Busy,
    #[error("Stored record for key {key} is corrupt: {reason}")]
    CorruptRecord { key: ClassKey, reason: String },
    #[error("Model payload could not be encoded or decoded: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Could not create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) struct StoreInner {
    conn: Connection,
    cards: BTreeMap<ClassKey, ClassRecord>,
    next_id: u32,
}

/// SQLite-backed dataset with an in-memory mirror.
pub struct DatasetStore {
    inner: Mutex<StoreInner>,
    events: EventBus<StoreEvent>,
    pending_events: Mutex<VecDeque<StoreEvent>>,
    dispatching: AtomicBool,
    ledger: TensorLedger,
    path: PathBuf,
}

impl DatasetStore {
    /// Open (or create) the dataset database at `path`.
    pub fn open(path: impl AsRef<Path>, ledger: TensorLedger) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&path).map_err(write::map_sql_error)?;
        schema::apply_pragmas(&conn)?;
        schema::apply_schema(&conn)?;
        let (cards, next_id) = read::load_mirror(&conn, &ledger)?;
        info!(
            classes = cards.len(),
            next_id,
            "Opened dataset at {}",
            path.display()
        );
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                cards,
                next_id,
            }),
            events: EventBus::new(),
            pending_events: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            ledger,
            path,
        })
    }

    /// Open the dataset database configured under the app root.
    pub fn open_default(settings: &StorageSettings, ledger: TensorLedger) -> Result<Self, StoreError> {
        let root = app_dirs::app_root_dir().map_err(|err| match err {
            app_dirs::AppDirError::CreateDir { path, source } => StoreError::CreateDir { path, source },
            app_dirs::AppDirError::NoBaseDir => StoreError::CreateDir {
                path: PathBuf::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no suitable base directory for the dataset",
                ),
            },
        })?;
        Self::open(root.join(&settings.database_file), ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bus carrying [`StoreEvent`]s.
    pub fn events(&self) -> &EventBus<StoreEvent> {
        &self.events
    }

    /// Ledger tracking every feature vector this store holds.
    pub fn ledger(&self) -> &TensorLedger {
        &self.ledger
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event. Called with the store lock held so queue order matches commit order.
    fn enqueue(&self, event: StoreEvent) {
        self.pending_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(event);
    }

    /// Dispatch queued events in FIFO order.
    ///
    /// Re-entrant calls from handlers return immediately; the outer drain
    /// picks up anything they queued.
    fn flush_events(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self
                    .pending_events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pop_front();
                let Some(event) = next else {
                    break;
                };
                self.events.dispatch(&event);
            }
            self.dispatching.store(false, Ordering::Release);
            let drained = self
                .pending_events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_empty();
            if drained {
                return;
            }
        }
    }
}

impl fmt::Debug for DatasetStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetStore")
            .field("path", &self.path)
            .field("classes", &self.len())
            .finish()
    }
}
