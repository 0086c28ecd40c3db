//! Overlay session: owns the capture, detection and watchdog threads.
//!
//! A session is one-shot. `start` spawns the threads, `stop` cancels them,
//! waits a bounded time for each to finish and releases every collaborator.
//! A stopped session cannot be started again.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ml_core::{DetectionBox, Detector};
use tracing::{error, info, warn};
use video_ingest::{CaptureError, FrameSource};

use crate::pipeline::{
    capture::{CaptureLoop, FrameForward},
    clock::{MonotonicClock, SharedClock},
    config::{OutputMode, PipelineConfig},
    display::{DisplayEvent, DisplayPublisher},
    error::PipelineError,
    notify::{NotificationState, SoundPlayer},
    overlay::Overlay,
    shutdown::ShutdownSignal,
    snapshot::SnapshotWriter,
    state::{DetectionSnapshot, SharedDetectionState},
    telemetry,
    watchdog::spawn_watchdog,
    worker::DetectionWorker,
};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
}

/// Collaborators consumed by the first `start`.
struct SessionParts {
    source: Box<dyn FrameSource>,
    forward: FrameForward,
}

struct RunningSession {
    shutdown: ShutdownSignal,
    state: SharedDetectionState,
    worker: DetectionWorker,
    capture: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

struct Lifecycle {
    state: SessionState,
    parts: Option<SessionParts>,
    running: Option<RunningSession>,
}

pub struct OverlaySession {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    clock: SharedClock,
    overlay: Arc<Overlay>,
    display: DisplayPublisher,
    paused: AtomicBool,
    failure: Arc<Mutex<Option<CaptureError>>>,
    lifecycle: Mutex<Lifecycle>,
}

pub struct SessionBuilder {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    source: Box<dyn FrameSource>,
    display: DisplayPublisher,
    player: Option<Box<dyn SoundPlayer>>,
    clock: Option<SharedClock>,
    forward: Option<FrameForward>,
}

impl SessionBuilder {
    /// Alert backend. Without one the session never plays sounds.
    pub fn player(mut self, player: Box<dyn SoundPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the forward derived from [`PipelineConfig::output`].
    pub fn forward(mut self, forward: FrameForward) -> Self {
        self.forward = Some(forward);
        self
    }

    pub fn build(self) -> Result<OverlaySession, PipelineError> {
        let forward = match self.forward {
            Some(forward) => forward,
            None => match self.config.output {
                OutputMode::Overlay => FrameForward::Overlay,
                OutputMode::SaveToDisk => FrameForward::Save(SnapshotWriter::new(
                    self.config.save_dir.clone(),
                    self.config.jpeg_quality,
                )?),
            },
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let overlay = Arc::new(Overlay::new(
            &self.config,
            self.player,
            clock.clone(),
            self.display.clone(),
        ));

        Ok(OverlaySession {
            config: self.config,
            detector: self.detector,
            clock,
            overlay,
            display: self.display,
            paused: AtomicBool::new(false),
            failure: Arc::new(Mutex::new(None)),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                parts: Some(SessionParts {
                    source: self.source,
                    forward,
                }),
                running: None,
            }),
        })
    }
}

impl OverlaySession {
    pub fn builder(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        source: Box<dyn FrameSource>,
        display: DisplayPublisher,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            detector,
            source,
            display,
            player: None,
            clock: None,
            forward: None,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn the capture and watchdog threads.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SessionState::Idle {
            return Err(PipelineError::AlreadyRunning);
        }
        let parts = lifecycle
            .parts
            .take()
            .ok_or(PipelineError::SessionConsumed)?;

        let shutdown = ShutdownSignal::new();
        let state = SharedDetectionState::new();
        let worker = DetectionWorker::new(
            self.detector.clone(),
            state.clone(),
            self.clock.clone(),
            shutdown.clone(),
        );
        worker.set_paused(self.paused.load(Ordering::SeqCst));
        if matches!(parts.forward, FrameForward::Overlay) {
            let overlay = self.overlay.clone();
            worker.subscribe(move |boxes| {
                overlay.update_boxes(boxes.to_vec());
            });
        }

        let capture_loop = CaptureLoop::new(
            parts.source,
            self.config.detection_enabled.then(|| worker.clone()),
            state.clone(),
            parts.forward,
            shutdown.clone(),
        );
        let target_fps = self.config.target_fps;
        let failure = self.failure.clone();
        let display = self.display.clone();
        let capture_shutdown = shutdown.clone();
        let capture = telemetry::spawn_thread("capture-loop", move || {
            if let Err(err) = capture_loop.run(target_fps) {
                error!("capture loop ended: {err}");
                display.publish(DisplayEvent::SessionFailed {
                    reason: err.to_string(),
                });
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                capture_shutdown.trigger();
            }
        })
        .map_err(|source| PipelineError::Spawn {
            name: "capture",
            source,
        })?;

        let watchdog = spawn_watchdog(
            self.overlay.clone(),
            Duration::from_millis(self.config.watchdog_period_ms),
            shutdown.clone(),
        );
        let (watchdog, spawn_error) = match watchdog {
            Ok(handle) => (Some(handle), None),
            Err(source) => {
                shutdown.trigger();
                (None, Some(source))
            }
        };

        lifecycle.state = SessionState::Running;
        lifecycle.running = Some(RunningSession {
            shutdown,
            state,
            worker,
            capture,
            watchdog,
        });

        if let Some(source) = spawn_error {
            return Err(PipelineError::Spawn {
                name: "watchdog",
                source,
            });
        }
        info!(
            "overlay session started (fps {}, hide after {} ms)",
            self.config.target_fps, self.config.hide_timeout_ms
        );
        Ok(())
    }

    /// `Stopping` once cancellation was requested, including after a capture
    /// failure, until `stop` finishes teardown.
    pub fn state(&self) -> SessionState {
        let lifecycle = self.lifecycle();
        match (&lifecycle.state, &lifecycle.running) {
            (SessionState::Running, Some(running)) if running.shutdown.is_triggered() => {
                SessionState::Stopping
            }
            (state, _) => *state,
        }
    }

    /// Cancel every thread, wait at most `join_timeout_ms` for them and
    /// release resources. Threads that miss the deadline are detached.
    ///
    /// A no-op unless the session is running. Returns the capture failure
    /// that ended the session, if any.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let running = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != SessionState::Running {
                return Ok(());
            }
            lifecycle.state = SessionState::Stopping;
            lifecycle.running.take()
        };

        if let Some(running) = running {
            running.shutdown.trigger();
            let deadline = Instant::now() + Duration::from_millis(self.config.join_timeout_ms);

            join_bounded("capture", running.capture, deadline);
            if let Some(watchdog) = running.watchdog {
                join_bounded("watchdog", watchdog, deadline);
            }
            for handle in running.worker.take_in_flight() {
                join_bounded("detection", handle, deadline);
            }
            running.state.clear_and_close();
        }
        self.overlay.reset();

        self.lifecycle().state = SessionState::Idle;
        info!("overlay session stopped");

        match self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(PipelineError::Capture(err)),
            None => Ok(()),
        }
    }

    /// Push boxes to the overlay as if a detection had just finished.
    pub fn update_boxes(&self, boxes: Vec<DetectionBox>) -> bool {
        self.overlay.update_boxes(boxes)
    }

    /// Run one watchdog check now. Returns `true` if boxes were hidden.
    pub fn tick_watchdog(&self) -> bool {
        self.overlay.tick()
    }

    /// Latest detection result, or an empty snapshot when not running.
    pub fn snapshot(&self) -> DetectionSnapshot {
        self.lifecycle()
            .running
            .as_ref()
            .map(|running| running.state.snapshot())
            .unwrap_or_default()
    }

    pub fn is_overlay_visible(&self) -> bool {
        self.overlay.is_visible()
    }

    pub fn overlay_boxes(&self) -> Vec<DetectionBox> {
        self.overlay.boxes()
    }

    pub fn notification_state(&self) -> NotificationState {
        self.overlay.notification_state()
    }

    /// Stop offering frames to the detector; capture keeps running.
    pub fn set_detection_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if let Some(running) = self.lifecycle().running.as_ref() {
            running.worker.set_paused(paused);
        }
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.overlay.set_notifications_enabled(enabled);
    }
}

impl Drop for OverlaySession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("session ended with error: {err}");
        }
    }
}

/// Join `handle` unless `deadline` passes first, in which case it is detached.
fn join_bounded(name: &str, handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} thread did not finish before the join deadline, detaching");
            metrics::counter!("vision_threads_detached_total").increment(1);
            return false;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    if handle.join().is_err() {
        warn!("{name} thread panicked");
    }
    true
}
