//! Tracing setup shared by the pipeline runtime and the developer binaries.
//!
//! Every launch appends to its own `cardlearn_<timestamp>.log` under the app
//! logs directory. Launch logs beyond [`LoggingSettings::retained_files`] are
//! deleted oldest first, judged by the timestamp in the file name.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use thiserror::Error;
use time::{
    OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, filter::ParseError, fmt, prelude::*};

use crate::app_dirs::{self, AppDirError};
use crate::config::LoggingSettings;

const LOG_PREFIX: &str = "cardlearn_";
const LOG_SUFFIX: &str = ".log";
const FILE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
const LINE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Log file of the installed subscriber plus the guard flushing it.
static ACTIVE: OnceLock<(PathBuf, WorkerGuard)> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error(transparent)]
    Dirs(#[from] AppDirError),
    #[error("Log file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("Failed to format log file timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber and return this launch's log file.
///
/// `RUST_LOG` wins over the configured filter. Later calls return the first
/// launch's file without installing anything.
pub fn init(settings: &LoggingSettings) -> Result<PathBuf, LoggingError> {
    if let Some((path, _)) = ACTIVE.get() {
        return Ok(path.clone());
    }
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&settings.filter)?,
    };
    let dir = app_dirs::logs_dir()?;
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let path = dir.join(launch_log_name(OffsetDateTime::now_utc().to_offset(offset))?);
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| io_error(&path, source))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let timer = fmt::time::OffsetTime::new(offset, BorrowedFormatItem::from(LINE_STAMP));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_timer(timer.clone())
        .with_writer(writer);
    let stdout_layer = settings
        .stdout
        .then(|| fmt::layer().with_timer(timer).with_writer(io::stdout));
    let subscriber = Registry::default()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = ACTIVE.set((path.clone(), guard));

    let removed = prune_launch_logs(&dir, settings.retained_files)?;
    tracing::info!(removed, "Logging to {}", path.display());
    Ok(path)
}

fn parse_filter(directives: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(directives).map_err(|source| LoggingError::Filter {
        filter: directives.to_string(),
        source,
    })
}

fn launch_log_name(now: OffsetDateTime) -> Result<String, LoggingError> {
    Ok(format!("{LOG_PREFIX}{}{LOG_SUFFIX}", now.format(FILE_STAMP)?))
}

fn is_launch_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX))
}

/// Keep the `keep` newest launch logs; other files in `dir` are left alone.
fn prune_launch_logs(dir: &Path, keep: usize) -> Result<usize, LoggingError> {
    let mut launches: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| io_error(dir, source))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_launch_log(path))
        .collect();
    launches.sort_unstable_by(|a, b| b.file_name().cmp(&a.file_name()));
    let cut = keep.min(launches.len());
    let stale = launches.split_off(cut);
    for path in &stale {
        fs::remove_file(path).map_err(|source| io_error(path, source))?;
    }
    Ok(stale.len())
}

fn io_error(path: &Path, source: io::Error) -> LoggingError {
    LoggingError::Io {
        path: path.to_path_buf(),
        source,
    }
}
