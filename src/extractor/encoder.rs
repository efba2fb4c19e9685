use std::path::Path;
use std::sync::Mutex;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::TensorData;
use burn_store::{BurnpackStore, ModuleSnapshot};
use image::imageops::{self, FilterType};

use crate::frame::Frame;

use super::{ExtractError, FEATURE_LEN, FeatureExtractor, LoadError};

type CpuBackend = NdArray;

const CHANNELS: [usize; 5] = [3, 16, 32, 64, 128];

/// Frozen convolutional image encoder.
///
/// Four stride-2 conv blocks, a global average over the spatial dims and a
/// linear projection to [`FEATURE_LEN`] features.
#[derive(Module, Debug)]
pub struct FrozenEncoder<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    projection: Linear<B>,
}

impl<B: Backend> FrozenEncoder<B> {
    /// Randomly initialized encoder; weights are normally loaded on top.
    pub fn new(device: &B::Device) -> Self {
        let conv = |index: usize| {
            Conv2dConfig::new([CHANNELS[index], CHANNELS[index + 1]], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device)
        };
        Self {
            conv1: conv(0),
            conv2: conv(1),
            conv3: conv(2),
            conv4: conv(3),
            projection: LinearConfig::new(CHANNELS[4], FEATURE_LEN)
                .with_bias(true)
                .init(device),
        }
    }

    /// Load weights from a burnpack file.
    pub fn from_file(path: &Path, device: &B::Device) -> Result<Self, String> {
        let path = path
            .to_str()
            .ok_or_else(|| "Encoder burnpack path contains invalid UTF-8".to_string())?;
        let mut model = Self::new(device);
        let mut store = BurnpackStore::from_file(path);
        model
            .load_from(&mut store)
            .map_err(|err| format!("Failed to load burnpack {path}: {err:?}"))?;
        Ok(model)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = burn::tensor::activation::relu(self.conv1.forward(input));
        let x = burn::tensor::activation::relu(self.conv2.forward(x));
        let x = burn::tensor::activation::relu(self.conv3.forward(x));
        let x = burn::tensor::activation::relu(self.conv4.forward(x));
        let [batch, channels, _, _] = x.dims();
        let pooled = x.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        self.projection.forward(pooled)
    }
}

/// [`FeatureExtractor`] backed by a [`FrozenEncoder`] on the CPU backend.
pub struct BurnExtractor {
    model: Mutex<FrozenEncoder<CpuBackend>>,
    device: NdArrayDevice,
    input_size: u32,
}

impl BurnExtractor {
    pub fn from_burnpack(path: &Path, input_size: u32) -> Result<Self, LoadError> {
        if !path.exists() {
            return Err(LoadError::Missing(path.to_path_buf()));
        }
        let device = NdArrayDevice::default();
        let model = FrozenEncoder::<CpuBackend>::from_file(path, &device).map_err(LoadError::Init)?;
        Ok(Self::with_model(model, device, input_size))
    }

    /// Wrap an already constructed encoder.
    pub fn with_model(model: FrozenEncoder<CpuBackend>, device: NdArrayDevice, input_size: u32) -> Self {
        Self {
            model: Mutex::new(model),
            device,
            input_size: input_size.max(1),
        }
    }

    fn prepare(&self, frame: &Frame) -> Result<Vec<f32>, ExtractError> {
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| ExtractError::Frame("pixel buffer does not match dimensions".into()))?;
        let size = self.input_size;
        let resized = if image.width() == size && image.height() == size {
            image
        } else {
            imageops::resize(&image, size, size, FilterType::Triangle)
        };
        let plane = (size * size) as usize;
        let mut chw = vec![0.0_f32; plane * 3];
        for (index, pixel) in resized.pixels().enumerate() {
            for channel in 0..3 {
                chw[channel * plane + index] = f32::from(pixel.0[channel]) / 255.0;
            }
        }
        Ok(chw)
    }
}

impl FeatureExtractor for BurnExtractor {
    fn feature_len(&self) -> usize {
        FEATURE_LEN
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn extract(&self, frame: &Frame) -> Result<Vec<f32>, ExtractError> {
        let input = self.prepare(frame)?;
        let size = self.input_size as usize;
        let model = self
            .model
            .lock()
            .map_err(|_| ExtractError::Inference("encoder lock poisoned".into()))?;
        let tensor = Tensor::<CpuBackend, 4>::from_data(
            TensorData::new(input, [1, 3, size, size]),
            &self.device,
        );
        let data = model.forward(tensor).into_data();
        let features = data
            .as_slice::<f32>()
            .map_err(|err| ExtractError::Inference(format!("{err:?}")))?
            .to_vec();
        if features.len() != FEATURE_LEN {
            return Err(ExtractError::OutputLength {
                expected: FEATURE_LEN,
                actual: features.len(),
            });
        }
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(input_size: u32) -> BurnExtractor {
        let device = NdArrayDevice::default();
        BurnExtractor::with_model(FrozenEncoder::new(&device), device, input_size)
    }

    #[test]
    fn extract_resizes_and_produces_fixed_length() {
        let extractor = extractor(32);
        let features = extractor.extract(&Frame::solid(48, 40, [200, 10, 90])).unwrap();
        assert_eq!(features.len(), FEATURE_LEN);
        assert!(features.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn warm_up_runs_a_zero_frame() {
        assert!(extractor(32).warm_up().is_ok());
    }

    #[test]
    fn identical_frames_give_identical_features() {
        let extractor = extractor(32);
        let frame = Frame::solid(32, 32, [5, 6, 7]);
        assert_eq!(extractor.extract(&frame).unwrap(), extractor.extract(&frame).unwrap());
    }

    #[test]
    fn missing_burnpack_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = BurnExtractor::from_burnpack(&dir.path().join("nope.bpk"), 224)
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Missing(_)));
    }
}
