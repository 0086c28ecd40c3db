//! Frame acquisition for the alert pipeline.
//!
//! Everything that produces pixels implements [`FrameSource`]; the capture loop
//! polls it once per tick.

#[cfg(feature = "with-opencv")]
mod camera;
mod ffmpeg;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::DeviceSource;
pub use ffmpeg::{FfmpegScreenSource, GrabBackend, screen_grab_args};
pub use types::{CaptureError, CaptureRegion, Frame, FrameFormat, FrameSource};
