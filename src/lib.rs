//! Teach a small on-device classifier to recognize flash-cards from a live camera feed.
/// Application directory helpers.
pub mod app_dirs;
/// Classifier head, training and persistence glue.
pub mod classifier;
/// Settings file handling.
pub mod config;
/// Durable per-class sample store.
pub mod dataset;
/// Typed publish/subscribe bus.
pub mod events;
/// Frozen feature extractor loading and inference.
pub mod extractor;
/// Frames and frame sources.
pub mod frame;
/// Confidence smoothing gate.
pub mod gate;
pub(crate) mod http_client;
/// Logging setup.
pub mod logging;
/// Capture/train/predict state machine.
pub mod pipeline;
/// Tick sources.
pub mod scheduler;
/// Completion cells and cancellation tokens.
pub mod task;
/// Ledger-tracked feature buffers.
pub mod tensor;
