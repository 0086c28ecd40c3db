use std::{fmt, time::Duration};

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from the screen or a video source.
///
/// A frame is owned by exactly one pipeline stage at a time; it is moved, never
/// shared mutably, from the capture loop into the detection worker.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a BGR8 pixel buffer, checking that its length matches the dimensions.
    pub fn bgr8(
        data: Vec<u8>,
        width: i32,
        height: i32,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        if width <= 0 || height <= 0 {
            return Err(CaptureError::NoSurface);
        }
        let expected = FrameFormat::Bgr8.frame_bytes(width, height);
        if data.len() != expected {
            return Err(CaptureError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }

    pub fn frame_bytes(self, width: i32, height: i32) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * self.bytes_per_pixel()
    }
}

/// Screen rectangle to grab, in desktop pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureRegion {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("capture target has no drawable surface")]
    NoSurface,
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("no frame arrived within {0:?}")]
    Timeout(Duration),
    #[error("frame source closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pull-based producer of frames, polled once per capture tick.
pub trait FrameSource: Send {
    /// Grab one frame. Errors are fatal to the capture session.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Short description used in logs and spans.
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr8_rejects_mismatched_buffer() {
        let err = Frame::bgr8(vec![0; 10], 2, 2, 0).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::BufferSize {
                expected: 12,
                actual: 10
            }
        ));
    }

    #[test]
    fn bgr8_rejects_empty_surface() {
        assert!(matches!(
            Frame::bgr8(Vec::new(), 0, 4, 0),
            Err(CaptureError::NoSurface)
        ));
    }

    #[test]
    fn debug_output_omits_pixels() {
        let frame = Frame::bgr8(vec![7; 3 * 4 * 2], 4, 2, 42).unwrap();
        let text = format!("{frame:?}");
        assert!(text.contains("bytes: 24"));
        assert!(!text.contains("7, 7"));
    }
}
