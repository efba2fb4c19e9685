pub(super) const MIN_TICK_HZ: u32 = 1;
pub(super) const MAX_TICK_HZ: u32 = 240;
pub(super) const MIN_INPUT_SIZE: u32 = 32;
pub(super) const MAX_INPUT_SIZE: u32 = 1024;
pub(super) const MAX_EPOCHS: usize = 10_000;
pub(super) const MAX_RETAINED_LOGS: usize = 100;

pub(super) fn default_allowed_hosts() -> Vec<String> {
    vec![
        "huggingface.co".to_string(),
        "github.com".to_string(),
        "objects.githubusercontent.com".to_string(),
    ]
}

pub(super) fn default_input_size() -> u32 {
    224
}

pub(super) fn default_max_download_bytes() -> u64 {
    256 * 1024 * 1024
}

pub(super) fn default_min_samples() -> usize {
    100
}

pub(super) fn default_epochs() -> usize {
    10
}

pub(super) fn default_batch_size() -> usize {
    5
}

pub(super) fn default_hidden_units() -> usize {
    128
}

pub(super) fn default_learning_rate() -> f32 {
    0.001
}

pub(super) fn default_seed() -> u64 {
    0x5eed_ca2d
}

pub(super) fn default_smoothing() -> f32 {
    0.1
}

pub(super) fn default_boundary() -> f32 {
    0.05
}

pub(super) fn default_tick_hz() -> u32 {
    60
}

pub(super) fn default_capture_width() -> u32 {
    640
}

pub(super) fn default_capture_height() -> u32 {
    480
}

pub(super) fn default_database_file() -> String {
    "dataset.db".to_string()
}

pub(super) fn default_log_filter() -> String {
    "info".to_string()
}

pub(super) fn default_retained_logs() -> usize {
    10
}

pub(super) fn default_log_to_stdout() -> bool {
    true
}

pub(super) fn clamp_unit(value: f32, fallback: f32) -> f32 {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        value
    } else {
        fallback
    }
}
