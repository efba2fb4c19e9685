use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::defaults::{
    MAX_EPOCHS, MAX_INPUT_SIZE, MAX_RETAINED_LOGS, MAX_TICK_HZ, MIN_INPUT_SIZE, MIN_TICK_HZ,
    clamp_unit, default_allowed_hosts, default_batch_size, default_boundary,
    default_capture_height, default_capture_width, default_database_file, default_epochs,
    default_hidden_units, default_input_size, default_learning_rate, default_log_filter,
    default_log_to_stdout, default_max_download_bytes, default_min_samples,
    default_retained_logs, default_seed, default_smoothing, default_tick_hz,
};

/// All persisted settings, one TOML table per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub extractor: ExtractorSettings,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppSettings {
    /// Clamp out-of-range values back to usable ones.
    pub fn normalized(mut self) -> Self {
        let fallback = GateConfig::default();
        self.gate.smoothing = clamp_unit(self.gate.smoothing, fallback.smoothing);
        self.gate.boundary = clamp_unit(self.gate.boundary, fallback.boundary);
        self.training.epochs = self.training.epochs.clamp(1, MAX_EPOCHS);
        self.training.batch_size = self.training.batch_size.max(1);
        self.training.hidden_units = self.training.hidden_units.max(1);
        if !(self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0) {
            self.training.learning_rate = default_learning_rate();
        }
        self.capture.tick_hz = self.capture.tick_hz.clamp(MIN_TICK_HZ, MAX_TICK_HZ);
        self.capture.width = self.capture.width.max(1);
        self.capture.height = self.capture.height.max(1);
        self.extractor.input_size = self.extractor.input_size.clamp(MIN_INPUT_SIZE, MAX_INPUT_SIZE);
        self.extractor.allowed_hosts = self
            .extractor
            .allowed_hosts
            .into_iter()
            .map(|host| host.trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        if self.storage.database_file.trim().is_empty() {
            self.storage.database_file = default_database_file();
        }
        self.logging.retained_files = self.logging.retained_files.clamp(1, MAX_RETAINED_LOGS);
        if self.logging.filter.trim().is_empty() {
            self.logging.filter = default_log_filter();
        }
        self
    }
}

/// Where the frozen feature extractor comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorSettings {
    /// HTTPS location of the burnpack weights. `None` means a local file must already exist.
    #[serde(default)]
    pub url: Option<String>,
    /// Expected SHA-256 of the weights, lowercase hex.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    /// Square edge, in pixels, frames are resized to before extraction.
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            url: None,
            sha256: None,
            allowed_hosts: default_allowed_hosts(),
            input_size: default_input_size(),
            max_download_bytes: default_max_download_bytes(),
        }
    }
}

/// Classifier head training parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Samples every class needs before training may start.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            hidden_units: default_hidden_units(),
            learning_rate: default_learning_rate(),
            seed: default_seed(),
        }
    }
}

/// Smoothing parameters for [`crate::gate::ConfidenceGate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// EWMA weight given to the newest sample.
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,
    /// Maximum distance from 1.0 at which the signal counts as settled.
    #[serde(default = "default_boundary")]
    pub boundary: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            boundary: default_boundary(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Scheduler cadence in ticks per second.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_capture_width")]
    pub width: u32,
    #[serde(default = "default_capture_height")]
    pub height: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            width: default_capture_width(),
            height: default_capture_height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Dataset database file name, relative to the app root.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

/// Log output for the runtime and the developer binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Log files kept in the logs directory, newest first.
    #[serde(default = "default_retained_logs")]
    pub retained_files: usize,
    #[serde(default = "default_log_to_stdout")]
    pub stdout: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            retained_files: default_retained_logs(),
            stdout: default_log_to_stdout(),
        }
    }
}

/// Errors that may occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to create the config directory.
    #[error("Unable to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config to TOML at {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    /// No usable config directory found.
    #[error("No suitable config directory found")]
    NoConfigDir,
}
