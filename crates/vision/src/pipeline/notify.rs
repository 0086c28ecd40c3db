//! Rate-limited audio alerts for new detections.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use ml_core::DetectionBox;
use tracing::{debug, warn};

use crate::pipeline::error::PlaybackError;

/// Audio backend used for alerts.
pub trait SoundPlayer: Send {
    fn play(&mut self, path: &Path) -> Result<(), PlaybackError>;
    fn stop(&mut self);
    fn is_playing(&mut self) -> bool;
}

type SharedPlayer = Arc<Mutex<Box<dyn SoundPlayer>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotificationState {
    pub enabled: bool,
    pub min_interval_ms: u64,
    /// `None` until the first sound was attempted.
    pub last_sound_ms: Option<u64>,
}

/// Decides when an alert is due. The player sits behind its own lock so the
/// decision can be taken under the overlay lock and the playback outside it.
pub struct NotificationThrottler {
    state: NotificationState,
    sound_file: PathBuf,
    player: Option<SharedPlayer>,
}

/// An alert the throttler already counted against the interval.
#[must_use = "the alert only sounds once `play` is called"]
pub struct PendingAlert {
    player: SharedPlayer,
    sound_file: PathBuf,
    boxes: usize,
}

impl PendingAlert {
    /// Restart the alert sound. Returns whether playback started.
    pub fn play(self) -> bool {
        let mut player = self.player.lock().unwrap_or_else(PoisonError::into_inner);
        if player.is_playing() {
            player.stop();
        }
        match player.play(&self.sound_file) {
            Ok(()) => {
                debug!("alert played for {} boxes", self.boxes);
                metrics::counter!("vision_alerts_played_total").increment(1);
                true
            }
            Err(err) => {
                warn!("alert playback failed: {err}");
                metrics::counter!("vision_alert_failures_total").increment(1);
                false
            }
        }
    }
}

impl NotificationThrottler {
    pub fn new(
        enabled: bool,
        min_interval_ms: u64,
        sound_file: impl Into<PathBuf>,
        player: Option<Box<dyn SoundPlayer>>,
    ) -> Self {
        Self {
            state: NotificationState {
                enabled,
                min_interval_ms,
                last_sound_ms: None,
            },
            sound_file: sound_file.into(),
            player: player.map(|p| Arc::new(Mutex::new(p))),
        }
    }

    pub fn state(&self) -> NotificationState {
        self.state
    }

    pub fn has_player(&self) -> bool {
        self.player.is_some()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.state.enabled = enabled;
    }

    /// Claim an alert if this batch brings more boxes than the previous one
    /// and the minimum interval has passed. The claim stamps the interval
    /// whether or not the later playback succeeds.
    pub fn claim(
        &mut self,
        boxes: &[DetectionBox],
        previous: usize,
        now_ms: u64,
    ) -> Option<PendingAlert> {
        if !self.state.enabled || boxes.is_empty() || boxes.len() <= previous {
            return None;
        }
        let player = self.player.as_ref()?;
        if let Some(last) = self.state.last_sound_ms {
            if now_ms.saturating_sub(last) < self.state.min_interval_ms {
                return None;
            }
        }

        self.state.last_sound_ms = Some(now_ms);
        Some(PendingAlert {
            player: player.clone(),
            sound_file: self.sound_file.clone(),
            boxes: boxes.len(),
        })
    }

    /// [`claim`](Self::claim) and play in one step. Returns whether a sound
    /// started.
    pub fn maybe_notify(&mut self, boxes: &[DetectionBox], previous: usize, now_ms: u64) -> bool {
        self.claim(boxes, previous, now_ms)
            .is_some_and(PendingAlert::play)
    }

    /// Stop any running sound, drop the player and forget the last alert.
    pub fn release(&mut self) {
        self.state.last_sound_ms = None;
        if let Some(player) = self.player.take() {
            player.lock().unwrap_or_else(PoisonError::into_inner).stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct PlayerLog {
        pub plays: usize,
        pub stops: usize,
        pub playing: bool,
    }

    /// Records calls; optionally fails every play.
    pub(crate) struct RecordingPlayer {
        pub log: Arc<Mutex<PlayerLog>>,
        pub fail: bool,
    }

    impl RecordingPlayer {
        pub(crate) fn new() -> (Self, Arc<Mutex<PlayerLog>>) {
            let log = Arc::new(Mutex::new(PlayerLog::default()));
            (
                Self {
                    log: log.clone(),
                    fail: false,
                },
                log,
            )
        }
    }

    impl SoundPlayer for RecordingPlayer {
        fn play(&mut self, path: &Path) -> Result<(), PlaybackError> {
            if self.fail {
                return Err(PlaybackError::MissingFile(path.to_path_buf()));
            }
            let mut log = self.log.lock().unwrap();
            log.plays += 1;
            log.playing = true;
            Ok(())
        }

        fn stop(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.stops += 1;
            log.playing = false;
        }

        fn is_playing(&mut self) -> bool {
            self.log.lock().unwrap().playing
        }
    }

    fn b(n: i32) -> DetectionBox {
        DetectionBox::new(n, n, n + 10, n + 10, "hot dog", 0.9).unwrap()
    }

    fn throttler() -> (NotificationThrottler, Arc<Mutex<PlayerLog>>) {
        let (player, log) = RecordingPlayer::new();
        (
            NotificationThrottler::new(true, 2_000, "alert.mp3", Some(Box::new(player))),
            log,
        )
    }

    #[test]
    fn interval_gates_repeat_alerts() {
        let (mut t, log) = throttler();
        assert!(t.maybe_notify(&[b(1)], 0, 500));
        assert_eq!(t.state().last_sound_ms, Some(500));

        assert!(!t.maybe_notify(&[b(1), b(2)], 1, 1_000));
        assert_eq!(t.state().last_sound_ms, Some(500));

        assert!(t.maybe_notify(&[b(1), b(2)], 1, 2_600));
        assert_eq!(t.state().last_sound_ms, Some(2_600));

        let log = log.lock().unwrap();
        assert_eq!(log.plays, 2);
        // the first sound was still "playing" and got restarted
        assert_eq!(log.stops, 1);
    }

    #[test]
    fn empty_or_shrinking_batches_never_play() {
        let (mut t, log) = throttler();
        assert!(!t.maybe_notify(&[], 0, 10_000));
        assert!(!t.maybe_notify(&[b(1)], 1, 20_000));
        assert!(!t.maybe_notify(&[b(1)], 3, 30_000));
        assert_eq!(log.lock().unwrap().plays, 0);
        assert_eq!(t.state().last_sound_ms, None);
    }

    #[test]
    fn disabled_or_missing_player_is_silent() {
        let (mut t, log) = throttler();
        t.set_enabled(false);
        assert!(!t.maybe_notify(&[b(1)], 0, 100));
        t.set_enabled(true);
        assert!(t.maybe_notify(&[b(1)], 0, 100));
        assert_eq!(log.lock().unwrap().plays, 1);

        let mut silent = NotificationThrottler::new(true, 0, "alert.mp3", None);
        assert!(!silent.maybe_notify(&[b(1)], 0, 100));
    }

    #[test]
    fn failed_playback_still_updates_interval() {
        let (mut player, log) = RecordingPlayer::new();
        player.fail = true;
        let mut t = NotificationThrottler::new(true, 2_000, "alert.mp3", Some(Box::new(player)));
        assert!(!t.maybe_notify(&[b(1)], 0, 700));
        assert_eq!(t.state().last_sound_ms, Some(700));
        assert_eq!(log.lock().unwrap().plays, 0);
    }

    #[test]
    fn release_stops_and_drops_player() {
        let (mut t, log) = throttler();
        assert!(t.maybe_notify(&[b(1)], 0, 0));
        t.release();
        assert!(!t.has_player());
        assert_eq!(t.state().last_sound_ms, None);
        assert_eq!(log.lock().unwrap().stops, 1);
    }

    #[test]
    fn claim_stamps_interval_before_playback() {
        let (mut t, log) = throttler();
        let alert = t.claim(&[b(1)], 0, 400).unwrap();
        assert_eq!(t.state().last_sound_ms, Some(400));
        assert!(t.claim(&[b(1), b(2)], 1, 900).is_none());
        assert_eq!(log.lock().unwrap().plays, 0);

        assert!(alert.play());
        assert_eq!(log.lock().unwrap().plays, 1);
    }
}
