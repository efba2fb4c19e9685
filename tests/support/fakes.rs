use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cardlearn::extractor::{ExtractError, ExtractorSource, FeatureExtractor, LoadError};
use cardlearn::frame::{CaptureError, Frame, FrameSource};

/// Camera that shows one solid colour, controllable from the test.
#[derive(Clone, Default)]
pub struct FakeCamera {
    streaming: Arc<AtomicBool>,
    color: Arc<Mutex<[u8; 3]>>,
    frames: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub fn show(&self, color: [u8; 3]) {
        *self.color.lock().unwrap() = color;
    }

    pub fn frames_served(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }
}

impl FrameSource for FakeCamera {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming()
    }

    fn current_frame(&mut self) -> Option<Frame> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Some(Frame::solid(8, 6, *self.color.lock().unwrap()))
    }

    fn stop(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
    }
}

/// Mean colour and its complement; cheap and linearly separable.
pub struct ColorExtractor;

pub const COLOR_FEATURES: usize = 6;

impl FeatureExtractor for ColorExtractor {
    fn feature_len(&self) -> usize {
        COLOR_FEATURES
    }

    fn input_size(&self) -> u32 {
        8
    }

    fn extract(&self, frame: &Frame) -> Result<Vec<f32>, ExtractError> {
        let pixels = frame.pixels();
        let count = (pixels.len() / 3).max(1) as f32;
        let mut mean = [0.0f32; 3];
        for pixel in pixels.chunks_exact(3) {
            for (slot, &value) in mean.iter_mut().zip(pixel) {
                *slot += f32::from(value) / 255.0;
            }
        }
        let mean = mean.map(|sum| sum / count);
        Ok(mean.iter().copied().chain(mean.iter().map(|v| 1.0 - v)).collect())
    }
}

/// Extractor source that counts fetches and may fail.
#[derive(Clone, Default)]
pub struct FakeExtractorSource {
    pub fetches: Arc<AtomicUsize>,
    pub fail: bool,
}

impl ExtractorSource for FakeExtractorSource {
    fn fetch(&self) -> Result<Arc<dyn FeatureExtractor>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LoadError::Download("network unreachable".into()));
        }
        Ok(Arc::new(ColorExtractor))
    }
}
