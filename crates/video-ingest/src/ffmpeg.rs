//! FFmpeg-backed desktop grabber.
//!
//! FFmpeg writes raw BGR24 frames to stdout; a reader thread keeps only the
//! newest frame so `capture()` never hands out a backlog.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::types::{CaptureError, CaptureRegion, Frame, FrameFormat, FrameSource};

/// Platform screen-grab device understood by FFmpeg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrabBackend {
    X11,
    Gdi,
    AvFoundation,
}

impl GrabBackend {
    pub fn native() -> Self {
        if cfg!(target_os = "windows") {
            GrabBackend::Gdi
        } else if cfg!(target_os = "macos") {
            GrabBackend::AvFoundation
        } else {
            GrabBackend::X11
        }
    }
}

/// Build the FFmpeg argument list grabbing `region` at `fps` as raw BGR24.
pub fn screen_grab_args(
    backend: GrabBackend,
    region: CaptureRegion,
    fps: u32,
    display: &str,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let size = format!("{}x{}", region.width, region.height);
    let rate = fps.max(1).to_string();

    match backend {
        GrabBackend::X11 => {
            args.extend([
                "-f".into(),
                "x11grab".into(),
                "-framerate".into(),
                rate,
                "-video_size".into(),
                size,
                "-i".into(),
                format!("{display}+{},{}", region.left, region.top),
            ]);
        }
        GrabBackend::Gdi => {
            args.extend([
                "-f".into(),
                "gdigrab".into(),
                "-framerate".into(),
                rate,
                "-offset_x".into(),
                region.left.to_string(),
                "-offset_y".into(),
                region.top.to_string(),
                "-video_size".into(),
                size,
                "-i".into(),
                "desktop".into(),
            ]);
        }
        GrabBackend::AvFoundation => {
            args.extend([
                "-f".into(),
                "avfoundation".into(),
                "-framerate".into(),
                rate,
                "-capture_cursor".into(),
                "0".into(),
                "-i".into(),
                format!("{display}:none"),
                "-vf".into(),
                format!(
                    "crop={}:{}:{}:{}",
                    region.width, region.height, region.left, region.top
                ),
            ]);
        }
    }

    args.extend(
        ["-pix_fmt", "bgr24", "-f", "rawvideo", "-"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Screen region source driven by an FFmpeg child process.
pub struct FfmpegScreenSource {
    child: Child,
    frames: Receiver<Result<Frame, CaptureError>>,
    region: CaptureRegion,
    frame_timeout: Duration,
}

impl FfmpegScreenSource {
    /// Spawn FFmpeg on the native grab backend.
    ///
    /// `display` is the X11 display (`:0.0`) or the AVFoundation screen index;
    /// it is ignored on Windows.
    pub fn spawn(region: CaptureRegion, fps: u32, display: &str) -> Result<Self, CaptureError> {
        if region.width <= 0 || region.height <= 0 {
            return Err(CaptureError::NoSurface);
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(screen_grab_args(GrabBackend::native(), region, fps, display))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| CaptureError::Open {
            uri: format!("ffmpeg screen grab ({err})"),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let (tx, rx) = bounded(1);
        let drain = rx.clone();
        let size = (region.width, region.height);
        thread::Builder::new()
            .name("ffmpeg-screen-reader".into())
            .spawn(move || {
                if let Err(err) = read_frames(stdout, size, &tx, &drain) {
                    let _ = offer_latest(&tx, &drain, Err(err));
                }
            })?;

        debug!(
            "Screen grab started: {}x{} at ({}, {}), {} fps",
            region.width, region.height, region.left, region.top, fps
        );

        // Generous first-frame allowance: FFmpeg needs a moment to open the device.
        let frame_timeout = Duration::from_millis((3_000 / fps.max(1) as u64).max(2_000));
        Ok(Self {
            child,
            frames: rx,
            region,
            frame_timeout,
        })
    }
}

impl FrameSource for FfmpegScreenSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        match self.frames.recv_timeout(self.frame_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(self.frame_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn describe(&self) -> String {
        format!(
            "screen {}x{}+{}+{}",
            self.region.width, self.region.height, self.region.left, self.region.top
        )
    }
}

impl Drop for FfmpegScreenSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_frames(
    mut stdout: ChildStdout,
    size: (i32, i32),
    tx: &Sender<Result<Frame, CaptureError>>,
    drain: &Receiver<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = FrameFormat::Bgr8.frame_bytes(size.0, size.1);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        stdout.read_exact(&mut buffer)?;
        let frame = Frame {
            data: buffer.clone(),
            width: size.0,
            height: size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        };
        if !offer_latest(tx, drain, Ok(frame)) {
            warn!("screen grab consumer went away; stopping reader");
            return Ok(());
        }
    }
}

/// Replace whatever frame is still waiting with `item`. Returns `false` once the
/// consumer has hung up.
fn offer_latest<T>(tx: &Sender<T>, drain: &Receiver<T>, item: T) -> bool {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                let _ = drain.try_recv();
                item = back;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> CaptureRegion {
        CaptureRegion {
            left: 10,
            top: 20,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn x11_args_encode_offset_in_input() {
        let args = screen_grab_args(GrabBackend::X11, region(), 5, ":0.0");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], ":0.0+10,20");
        assert!(args.windows(2).any(|w| w[0] == "-video_size" && w[1] == "640x480"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn gdi_args_use_offsets() {
        let args = screen_grab_args(GrabBackend::Gdi, region(), 0, "");
        assert!(args.windows(2).any(|w| w[0] == "-offset_x" && w[1] == "10"));
        assert!(args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "1"));
        assert!(args.contains(&"desktop".to_string()));
    }

    #[test]
    fn avfoundation_crops_region() {
        let args = screen_grab_args(GrabBackend::AvFoundation, region(), 10, "1");
        assert!(args.contains(&"crop=640:480:10:20".to_string()));
        assert!(args.contains(&"1:none".to_string()));
    }

    #[test]
    fn offer_latest_keeps_only_newest() {
        let (tx, rx) = bounded(1);
        assert!(offer_latest(&tx, &rx, 1));
        assert!(offer_latest(&tx, &rx, 2));
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn offer_latest_reports_hangup() {
        let (tx, rx) = bounded::<u8>(1);
        drop(rx);
        let (_unrelated_tx, unrelated_rx) = bounded::<u8>(1);
        assert!(!offer_latest(&tx, &unrelated_rx, 3));
    }
}
