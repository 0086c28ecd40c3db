//! Boxes currently on screen, their visibility, and the alert throttle.
//!
//! Written by the detection thread (through [`Overlay::update_boxes`]) and the
//! watchdog thread (through [`Overlay::tick`]). Display events are published
//! while the lock is held so the display sees them in state order. Alert
//! playback happens after the lock is released.

use std::sync::{Mutex, MutexGuard, PoisonError};

use ml_core::DetectionBox;

use crate::pipeline::{
    clock::SharedClock,
    config::PipelineConfig,
    display::{DisplayEvent, DisplayPublisher},
    notify::{NotificationState, NotificationThrottler, PendingAlert, SoundPlayer},
    watchdog::OverlayVisibility,
};

pub struct Overlay {
    inner: Mutex<OverlayState>,
    clock: SharedClock,
    display: DisplayPublisher,
}

struct OverlayState {
    boxes: Vec<DetectionBox>,
    last_update_ms: Option<u64>,
    visibility: OverlayVisibility,
    throttler: NotificationThrottler,
}

impl Overlay {
    pub fn new(
        config: &PipelineConfig,
        player: Option<Box<dyn SoundPlayer>>,
        clock: SharedClock,
        display: DisplayPublisher,
    ) -> Self {
        Self {
            inner: Mutex::new(OverlayState {
                boxes: Vec::new(),
                last_update_ms: None,
                visibility: OverlayVisibility::new(config.hide_timeout_ms),
                throttler: NotificationThrottler::new(
                    config.notifications_enabled,
                    config.min_interval_ms,
                    config.sound_file.clone(),
                    player,
                ),
            }),
            clock,
            display,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OverlayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the displayed boxes and make them visible.
    ///
    /// Any call, including one with an empty list, counts as a fresh update
    /// for the watchdog. Returns whether an alert sound was started.
    pub fn update_boxes(&self, boxes: Vec<DetectionBox>) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let previous = state.boxes.len();
        state.boxes = boxes;
        state.last_update_ms = Some(now);
        let revealed = state.visibility.reveal();

        self.display.publish(DisplayEvent::BoxesUpdated {
            boxes: state.boxes.clone(),
        });
        if revealed {
            self.display
                .publish(DisplayEvent::VisibilityChanged { visible: true });
        }

        let OverlayState { boxes, throttler, .. } = &mut *state;
        let alert = throttler.claim(boxes, previous, now);
        drop(state);
        alert.is_some_and(PendingAlert::play)
    }

    /// Watchdog step. Returns `true` when this call hid the boxes.
    pub fn tick(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let last = state.last_update_ms;
        if !state.visibility.check(last, now) {
            return false;
        }
        metrics::counter!("vision_overlay_hidden_total").increment(1);
        self.display
            .publish(DisplayEvent::VisibilityChanged { visible: false });
        true
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visibility.show_boxes
    }

    pub fn boxes(&self) -> Vec<DetectionBox> {
        self.lock().boxes.clone()
    }

    pub fn last_update_ms(&self) -> Option<u64> {
        self.lock().last_update_ms
    }

    pub fn notification_state(&self) -> NotificationState {
        self.lock().throttler.state()
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.lock().throttler.set_enabled(enabled);
    }

    /// Return to the freshly constructed state and release the sound player.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.boxes.clear();
        state.last_update_ms = None;
        state.visibility = OverlayVisibility::new(state.visibility.hide_timeout_ms);
        state.throttler.release();
    }
}
