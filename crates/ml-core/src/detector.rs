use thiserror::Error;
use video_ingest::Frame;

use crate::boxes::DetectionBox;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("unsupported frame format")]
    UnsupportedFormat,
    #[error("frame {width}x{height} with {bytes} bytes cannot be fed to the detector")]
    FrameSize { width: i32, height: i32, bytes: usize },
    #[error("model error: {0}")]
    Model(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Maps one frame to the boxes worth showing.
///
/// Implementations apply their confidence threshold and class filter before
/// returning, so callers never post-filter.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError>;

    fn name(&self) -> &str {
        "detector"
    }
}

#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

#[cfg(feature = "with-tch")]
mod torch {
    use std::{path::Path, sync::Mutex};

    use tch::{self, Device, Kind, Tensor};
    use video_ingest::Frame;

    use super::{DetectionError, Detector};
    use crate::{
        boxes::DetectionBox,
        yolo::{DecodeOptions, decode_predictions, frame_to_chw, into_boxes},
    };

    /// TorchScript-exported YOLOv8 model.
    pub struct TorchDetector {
        module: Mutex<tch::CModule>,
        device: Device,
        input_size: (u32, u32),
        options: DecodeOptions,
    }

    impl TorchDetector {
        /// Load a TorchScript module onto `device`.
        pub fn new<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            input_size: (u32, u32),
            options: DecodeOptions,
        ) -> Result<Self, DetectionError> {
            let module = tch::CModule::load_on_device(model_path, device)
                .map_err(|err| DetectionError::Model(err.to_string()))?;
            Ok(Self {
                module: Mutex::new(module),
                device,
                input_size,
                options,
            })
        }

        pub fn device(&self) -> Device {
            self.device
        }
    }

    impl Detector for TorchDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
            let (in_w, in_h) = self.input_size;
            let chw = frame_to_chw(frame, self.input_size)?;
            let input = Tensor::from_slice(&chw)
                .view([1, 3, in_h as i64, in_w as i64])
                .to_device(self.device);

            let output = {
                let module = self
                    .module
                    .lock()
                    .map_err(|_| DetectionError::Model("detector module poisoned".into()))?;
                module
                    .forward_ts(&[input])
                    .map_err(|err| DetectionError::Model(err.to_string()))?
            };

            let shape = output.size();
            if shape.len() != 3 || shape[0] != 1 {
                return Err(DetectionError::Model(format!(
                    "unexpected detector output shape: {shape:?}"
                )));
            }
            let channels = shape[1] as usize;
            let flat = output
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1]);
            let values = Vec::<f32>::try_from(&flat)
                .map_err(|err| DetectionError::Model(err.to_string()))?;

            let candidates = decode_predictions(&values, channels, &self.options)?;
            Ok(into_boxes(
                &candidates,
                self.input_size,
                (frame.width, frame.height),
                &self.options,
            ))
        }

        fn name(&self) -> &str {
            "torchscript-yolov8"
        }
    }
}
