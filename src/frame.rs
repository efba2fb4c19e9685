//! Frames and the frame-source device contract.

use image::RgbImage;
use thiserror::Error;

use crate::extractor::LoadError;

/// One RGB8 frame, row-major, tightly packed.
#[derive(Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wrap raw RGB8 pixels. Returns `None` when the buffer length does not match.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(3)?;
        if width == 0 || height == 0 || pixels.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self::solid(width, height, [0, 0, 0])
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Errors surfaced while starting capture.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("No frame source is attached")]
    NotAttached,
    #[error("Frame source failed: {0}")]
    Device(String),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// A live camera-like device.
pub trait FrameSource: Send {
    /// Ask the device to begin producing frames. Streaming may start later.
    fn start(&mut self) -> Result<(), CaptureError>;
    /// Whether frames are currently flowing.
    fn is_streaming(&self) -> bool;
    /// The most recent frame, if one is available.
    fn current_frame(&mut self) -> Option<Frame>;
    fn stop(&mut self);
}
