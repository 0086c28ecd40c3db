//! Rate-limited capture loop feeding the detection worker.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::pipeline::{
    shutdown::ShutdownSignal,
    snapshot::SnapshotWriter,
    state::{DetectionSnapshot, SharedDetectionState},
    worker::DetectionWorker,
};

const HEARTBEAT_EVERY: u64 = 30;

/// What the loop does with each tick's freshest result.
pub enum FrameForward {
    /// Nothing; the overlay is driven by the worker's result callback.
    Overlay,
    Callback(Box<dyn FnMut(&DetectionSnapshot) + Send>),
    Save(SnapshotWriter),
}

impl fmt::Debug for FrameForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameForward::Overlay => f.write_str("Overlay"),
            FrameForward::Callback(_) => f.write_str("Callback"),
            FrameForward::Save(writer) => write!(f, "Save({})", writer.dir().display()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub submitted: u64,
    pub dropped: u64,
    pub saved: u64,
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    /// `None` captures without detection.
    worker: Option<DetectionWorker>,
    state: SharedDetectionState,
    forward: FrameForward,
    shutdown: ShutdownSignal,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        worker: Option<DetectionWorker>,
        state: SharedDetectionState,
        forward: FrameForward,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            worker,
            state,
            forward,
            shutdown,
        }
    }

    /// Pull frames at `target_fps` until shutdown or a capture failure.
    ///
    /// The source is dropped when this returns.
    pub fn run(mut self, target_fps: u32) -> Result<CaptureStats, CaptureError> {
        let period = Duration::from_secs_f64(1.0 / f64::from(target_fps.max(1)));
        let mut stats = CaptureStats::default();
        let mut smoothed_fps: f32 = 0.0;
        let mut last_instant = Instant::now();

        info!(
            "capture started: {} at {target_fps} fps (detection {})",
            self.source.describe(),
            if self.worker.is_some() { "on" } else { "off" }
        );

        while !self.shutdown.is_triggered() {
            let tick_start = Instant::now();
            let seq = stats.frames;

            let frame = tracing::info_span!("capture.frame", frame = seq).in_scope(|| {
                self.source.capture().inspect_err(|err| {
                    error!("capture failed after {seq} frames: {err}");
                    metrics::counter!("vision_capture_failures_total").increment(1);
                })
            })?;
            stats.frames += 1;
            metrics::counter!("vision_frames_captured_total").increment(1);

            let elapsed = tick_start.duration_since(last_instant).as_secs_f32();
            last_instant = tick_start;
            if seq > 0 && elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                smoothed_fps = if smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * smoothed_fps + 0.1 * instant
                };
                metrics::histogram!("vision_capture_frame_interval_seconds")
                    .record(f64::from(elapsed));
            }
            metrics::gauge!("vision_pipeline_fps").set(f64::from(smoothed_fps));

            if stats.frames % HEARTBEAT_EVERY == 0 {
                debug!(
                    "Capture heartbeat: frame #{}, {:.1} fps, ts={}, dropped={}",
                    stats.frames, smoothed_fps, frame.timestamp_ms, stats.dropped
                );
            }

            match self.worker.as_ref() {
                Some(worker) => {
                    if !worker.is_paused() {
                        if worker.submit(frame) {
                            stats.submitted += 1;
                        } else {
                            stats.dropped += 1;
                            metrics::counter!("vision_capture_dropped_frames_total").increment(1);
                        }
                    }
                    let snapshot = self.state.snapshot();
                    self.forward_detection(&snapshot, seq, &mut stats);
                }
                None => self.forward_raw(frame, seq, &mut stats),
            }

            if let Some(rest) = period.checked_sub(tick_start.elapsed()) {
                if self.shutdown.wait_timeout(rest) {
                    break;
                }
            }
        }

        info!(
            "capture stopped: {} frames, {} submitted, {} dropped",
            stats.frames, stats.submitted, stats.dropped
        );
        Ok(stats)
    }

    fn forward_detection(
        &mut self,
        snapshot: &DetectionSnapshot,
        seq: u64,
        stats: &mut CaptureStats,
    ) {
        match &mut self.forward {
            FrameForward::Overlay => {}
            FrameForward::Callback(callback) => callback(snapshot),
            FrameForward::Save(writer) => match writer.write_detection(snapshot, seq) {
                Ok(Some(path)) => {
                    stats.saved += 1;
                    if !snapshot.boxes.is_empty() {
                        info!(
                            "detected {} object(s), saved {}",
                            snapshot.boxes.len(),
                            path.display()
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("failed to save snapshot: {err}"),
            },
        }
    }

    fn forward_raw(&mut self, frame: Frame, seq: u64, stats: &mut CaptureStats) {
        match &mut self.forward {
            FrameForward::Overlay => {}
            FrameForward::Callback(callback) => callback(&DetectionSnapshot {
                frame: Some(Arc::new(frame)),
                boxes: Vec::new(),
                last_update_ms: None,
                generation: seq + 1,
            }),
            FrameForward::Save(writer) => match writer.write_raw(&frame, seq) {
                Ok(_) => stats.saved += 1,
                Err(err) => warn!("failed to save frame: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ml_core::{DetectionBox, DetectionError, Detector};

    use super::*;
    use crate::pipeline::clock::ManualClock;

    /// Yields `frames` frames, then fails.
    struct ScriptedSource {
        remaining: usize,
        next_ts: i64,
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<Frame, CaptureError> {
            if self.remaining == 0 {
                return Err(CaptureError::Closed);
            }
            self.remaining -= 1;
            self.next_ts += 1;
            Frame::bgr8(vec![0; 12], 2, 2, self.next_ts)
        }
    }

    struct OneBox;

    impl Detector for OneBox {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
            let b = DetectionBox::new(0, 0, 1, 1, "hot dog", 0.9)
                .map_err(|err| DetectionError::Model(err.to_string()))?;
            Ok(vec![b])
        }
    }

    #[test]
    fn raw_mode_forwards_every_frame_then_reports_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let capture = CaptureLoop::new(
            Box::new(ScriptedSource {
                remaining: 3,
                next_ts: 0,
            }),
            None,
            SharedDetectionState::new(),
            FrameForward::Callback(Box::new(move |snap| {
                sink.lock()
                    .unwrap()
                    .push(snap.frame.as_ref().map(|f| f.timestamp_ms))
            })),
            ShutdownSignal::new(),
        );

        let err = capture.run(1_000).unwrap_err();
        assert!(matches!(err, CaptureError::Closed));
        assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn cancelled_loop_captures_nothing() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let capture = CaptureLoop::new(
            Box::new(ScriptedSource {
                remaining: 0,
                next_ts: 0,
            }),
            None,
            SharedDetectionState::new(),
            FrameForward::Overlay,
            shutdown,
        );
        assert_eq!(capture.run(30).unwrap(), CaptureStats::default());
    }

    #[test]
    fn detection_mode_submits_frames() {
        let state = SharedDetectionState::new();
        let shutdown = ShutdownSignal::new();
        let worker = DetectionWorker::new(
            Arc::new(OneBox),
            state.clone(),
            Arc::new(ManualClock::new(0)),
            shutdown.clone(),
        );
        let capture = CaptureLoop::new(
            Box::new(ScriptedSource {
                remaining: 5,
                next_ts: 0,
            }),
            Some(worker.clone()),
            state.clone(),
            FrameForward::Overlay,
            shutdown,
        );

        assert!(capture.run(200).is_err());
        for handle in worker.take_in_flight() {
            handle.join().unwrap();
        }
        assert_eq!(state.snapshot().boxes.len(), 1);
    }
}
