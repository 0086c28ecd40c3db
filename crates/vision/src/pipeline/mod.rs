//! Capture → detection → overlay pipeline.

pub mod capture;
pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod notify;
pub mod overlay;
pub mod session;
pub mod shutdown;
pub mod snapshot;
pub mod sound;
pub mod state;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use capture::{CaptureLoop, CaptureStats, FrameForward};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{OutputMode, PipelineCliArgs, PipelineConfig, TelemetryOptions};
pub use display::{DisplayEvent, DisplayEvents, DisplayPublisher, DisplaySink, display_channel};
pub use error::{PipelineError, PlaybackError, SnapshotError};
pub use notify::{NotificationState, NotificationThrottler, PendingAlert, SoundPlayer};
pub use overlay::Overlay;
pub use session::{OverlaySession, SessionBuilder, SessionState};
pub use shutdown::ShutdownSignal;
pub use snapshot::SnapshotWriter;
pub use sound::CommandSoundPlayer;
pub use state::{DetectionSnapshot, SharedDetectionState};
pub use watchdog::OverlayVisibility;
pub use worker::DetectionWorker;
