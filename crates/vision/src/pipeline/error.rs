//! Error types raised by the pipeline.
//!
//! Capture and detection errors come from their own crates and are wrapped
//! here; playback and snapshot failures are local to this crate.

use std::{io, path::PathBuf};

use ml_core::DetectionError;
use thiserror::Error;
use video_ingest::CaptureError;

/// Failures surfaced by an [`OverlaySession`](crate::pipeline::OverlaySession).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("playback failed: {0}")]
    Playback(#[from] PlaybackError),
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session was stopped and cannot be restarted")]
    SessionConsumed,
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Alert sound could not be played.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("sound file {} not found", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Snapshot JPEG could not be encoded or written.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("frame {width}x{height} does not match its pixel buffer")]
    FrameSize { width: i32, height: i32 },
    #[error("failed to encode JPEG: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
