//! Handoff from pipeline threads to the display layer.
//!
//! Pipeline threads never call into the display directly. They publish
//! [`DisplayEvent`]s on an unbounded channel which the display loop drains on
//! its own tick and replays into a [`DisplaySink`].

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use ml_core::DetectionBox;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisplayEvent {
    BoxesUpdated { boxes: Vec<DetectionBox> },
    VisibilityChanged { visible: bool },
    SessionFailed { reason: String },
}

/// Whatever renders boxes for the user.
pub trait DisplaySink {
    fn on_boxes_updated(&mut self, boxes: &[DetectionBox]);
    fn on_visibility_changed(&mut self, visible: bool);
    fn on_session_error(&mut self, _reason: &str) {}

    fn apply(&mut self, event: &DisplayEvent) {
        match event {
            DisplayEvent::BoxesUpdated { boxes } => self.on_boxes_updated(boxes),
            DisplayEvent::VisibilityChanged { visible } => self.on_visibility_changed(*visible),
            DisplayEvent::SessionFailed { reason } => self.on_session_error(reason),
        }
    }
}

/// Sending half, cloned into the overlay and the capture thread.
#[derive(Clone)]
pub struct DisplayPublisher {
    tx: Sender<DisplayEvent>,
}

impl DisplayPublisher {
    /// Events sent after the display loop went away are dropped.
    pub fn publish(&self, event: DisplayEvent) {
        let _ = self.tx.send(event);
    }
}

/// Receiving half owned by the display loop.
pub struct DisplayEvents {
    rx: Receiver<DisplayEvent>,
}

impl DisplayEvents {
    pub fn try_next(&self) -> Option<DisplayEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or once
    /// every publisher is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DisplayEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Replay every pending event into `sink`, returning how many were applied.
    pub fn drain(&self, sink: &mut dyn DisplaySink) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            sink.apply(&event);
            applied += 1;
        }
        applied
    }
}

pub fn display_channel() -> (DisplayPublisher, DisplayEvents) {
    let (tx, rx) = unbounded();
    (DisplayPublisher { tx }, DisplayEvents { rx })
}
