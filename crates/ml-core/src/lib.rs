//! Detection types and model glue.
//!
//! The `with-tch` feature pulls in libtorch and enables
//! [`detector::TorchDetector`]; everything else builds without it.

pub mod boxes;
pub mod detector;
pub mod yolo;

pub use boxes::{DetectionBox, InvalidBox};
pub use detector::{DetectionError, Detector};
pub use yolo::{DecodeOptions, HOT_DOG_CLASS};

#[cfg(feature = "with-tch")]
pub use tch;
