//! Staleness watchdog hiding overlay boxes once detections stop arriving.
//!
//! The decision itself lives in [`OverlayVisibility::check`], a pure function
//! of the last update time and "now". The thread spawned by
//! [`spawn_watchdog`] only wakes up periodically and asks the overlay to
//! apply it.

use std::{io, sync::Arc, thread::JoinHandle, time::Duration};

use tracing::debug;

use crate::pipeline::{overlay::Overlay, shutdown::ShutdownSignal, telemetry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayVisibility {
    pub show_boxes: bool,
    pub hide_timeout_ms: u64,
}

impl OverlayVisibility {
    /// Boxes start visible, matching a freshly shown overlay.
    pub fn new(hide_timeout_ms: u64) -> Self {
        Self {
            show_boxes: true,
            hide_timeout_ms,
        }
    }

    /// Force boxes visible. Returns `true` if they were hidden before.
    pub fn reveal(&mut self) -> bool {
        let was_hidden = !self.show_boxes;
        self.show_boxes = true;
        was_hidden
    }

    /// Hide boxes whose last update is older than the timeout.
    ///
    /// Returns `true` only on a visible to hidden transition. Without any
    /// prior update nothing happens.
    pub fn check(&mut self, last_update_ms: Option<u64>, now_ms: u64) -> bool {
        let Some(last) = last_update_ms else {
            return false;
        };
        if !self.show_boxes {
            return false;
        }
        if now_ms.saturating_sub(last) > self.hide_timeout_ms {
            self.show_boxes = false;
            return true;
        }
        false
    }
}

/// Spawn the thread that ticks `overlay` every `period` until shutdown.
pub fn spawn_watchdog(
    overlay: Arc<Overlay>,
    period: Duration,
    shutdown: ShutdownSignal,
) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("staleness-watchdog", move || {
        while !shutdown.wait_timeout(period) {
            if overlay.tick() {
                debug!("overlay boxes hidden after inactivity");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_prior_update_means_no_action() {
        let mut vis = OverlayVisibility::new(3_000);
        assert!(!vis.check(None, 1_000_000));
        assert!(vis.show_boxes);
    }

    #[test]
    fn hides_only_after_timeout_elapsed() {
        let mut vis = OverlayVisibility::new(3_000);
        assert!(!vis.check(Some(0), 1_000));
        assert!(!vis.check(Some(0), 3_000));
        assert!(vis.show_boxes);
        assert!(vis.check(Some(0), 3_100));
        assert!(!vis.show_boxes);
        // already hidden: no second transition
        assert!(!vis.check(Some(0), 9_000));
    }

    #[test]
    fn reveal_reports_transition() {
        let mut vis = OverlayVisibility::new(10);
        assert!(!vis.reveal());
        assert!(vis.check(Some(0), 11));
        assert!(vis.reveal());
        assert!(vis.show_boxes);
    }
}
