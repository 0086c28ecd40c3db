//! Configuration for the overlay pipeline.
//!
//! CLI arguments are translated once into a [`PipelineConfig`] which the
//! session and its threads read without re-parsing flags.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;

pub const DEFAULT_TARGET_FPS: u32 = 10;
pub const DEFAULT_HIDE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_WATCHDOG_PERIOD_MS: u64 = 1_000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;
pub const DEFAULT_SOUND_FILE: &str = "sounds/hotdog_alert.mp3";
pub const DEFAULT_SAVE_DIR: &str = "screenshots";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
/// Where the capture loop sends each tick's snapshot.
pub enum OutputMode {
    /// Boxes flow to the overlay through the detection callback.
    #[default]
    Overlay,
    /// Annotated (or raw) frames are written as JPEG files.
    SaveToDisk,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Write the Prometheus exposition to this file on shutdown.
    pub metrics_dump_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    /// Capture rate the loop tries to hold.
    pub target_fps: u32,
    /// Boxes older than this are hidden by the watchdog.
    pub hide_timeout_ms: u64,
    /// Minimum gap between two alert sounds.
    pub min_interval_ms: u64,
    pub notifications_enabled: bool,
    /// Alert sound played on new detections.
    pub sound_file: PathBuf,
    /// How often the staleness watchdog wakes up.
    pub watchdog_period_ms: u64,
    /// Upper bound on joining worker threads during `stop`.
    pub join_timeout_ms: u64,
    /// When false, frames bypass the detector entirely.
    pub detection_enabled: bool,
    pub output: OutputMode,
    /// Directory used by [`OutputMode::SaveToDisk`].
    pub save_dir: PathBuf,
    pub jpeg_quality: u8,
    pub telemetry: TelemetryOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            hide_timeout_ms: DEFAULT_HIDE_TIMEOUT_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            notifications_enabled: true,
            sound_file: PathBuf::from(DEFAULT_SOUND_FILE),
            watchdog_period_ms: DEFAULT_WATCHDOG_PERIOD_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            detection_enabled: true,
            output: OutputMode::Overlay,
            save_dir: PathBuf::from(DEFAULT_SAVE_DIR),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// Pipeline flags shared by every front end.
#[derive(Debug, Default, Args)]
pub struct PipelineCliArgs {
    /// Target capture rate in frames per second.
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<u32>,
    /// Hide boxes after this many milliseconds without a detection.
    #[arg(long = "hide-timeout-ms", value_name = "MS")]
    pub hide_timeout_ms: Option<u64>,
    /// Minimum milliseconds between two alert sounds.
    #[arg(long = "min-interval-ms", value_name = "MS")]
    pub min_interval_ms: Option<u64>,
    /// Disable audio alerts.
    #[arg(long = "mute", action = clap::ArgAction::SetTrue)]
    pub mute: bool,
    /// Alert sound file.
    #[arg(long = "sound", value_name = "PATH")]
    pub sound_file: Option<PathBuf>,
    /// Staleness watchdog period in milliseconds.
    #[arg(long = "watchdog-period-ms", value_name = "MS")]
    pub watchdog_period_ms: Option<u64>,
    /// Bound on waiting for worker threads at shutdown.
    #[arg(long = "join-timeout-ms", value_name = "MS")]
    pub join_timeout_ms: Option<u64>,
    /// Capture without running the detector.
    #[arg(long = "no-detection", action = clap::ArgAction::SetTrue)]
    pub no_detection: bool,
    /// Write frames to disk instead of driving the overlay.
    #[arg(long = "save", action = clap::ArgAction::SetTrue)]
    pub save: bool,
    /// Output directory for `--save`.
    #[arg(long = "save-dir", value_name = "DIR")]
    pub save_dir: Option<PathBuf>,
    /// JPEG quality used for saved frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<i32>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Write Prometheus metrics to a file on exit.
    #[arg(long = "metrics-dump", value_name = "PATH")]
    pub metrics_dump: Option<PathBuf>,
}

impl TryFrom<PipelineCliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineCliArgs) -> Result<Self> {
        let defaults = PipelineConfig::default();

        let target_fps = args.fps.unwrap_or(defaults.target_fps);
        if target_fps == 0 {
            bail!("--fps must be at least 1");
        }

        let hide_timeout_ms = positive_ms(
            "--hide-timeout-ms",
            args.hide_timeout_ms,
            defaults.hide_timeout_ms,
        )?;
        let min_interval_ms = positive_ms(
            "--min-interval-ms",
            args.min_interval_ms,
            defaults.min_interval_ms,
        )?;
        let watchdog_period_ms = positive_ms(
            "--watchdog-period-ms",
            args.watchdog_period_ms,
            defaults.watchdog_period_ms,
        )?;
        let join_timeout_ms = positive_ms(
            "--join-timeout-ms",
            args.join_timeout_ms,
            defaults.join_timeout_ms,
        )?;

        let jpeg_quality = args.jpeg_quality.unwrap_or(defaults.jpeg_quality as i32);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        if args.save_dir.is_some() && !args.save {
            bail!("--save-dir requires --save");
        }

        let output = if args.save {
            OutputMode::SaveToDisk
        } else {
            OutputMode::Overlay
        };

        Ok(Self {
            target_fps,
            hide_timeout_ms,
            min_interval_ms,
            notifications_enabled: !args.mute,
            sound_file: args.sound_file.unwrap_or(defaults.sound_file),
            watchdog_period_ms,
            join_timeout_ms,
            detection_enabled: !args.no_detection,
            output,
            save_dir: args.save_dir.unwrap_or(defaults.save_dir),
            jpeg_quality: jpeg_quality as u8,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_dump_path: args.metrics_dump,
            },
        })
    }
}

fn positive_ms(flag: &str, value: Option<u64>, default: u64) -> Result<u64> {
    let value = value.unwrap_or(default);
    if value == 0 {
        bail!("{flag} must be at least 1");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_give_defaults() {
        let config = PipelineConfig::try_from(PipelineCliArgs::default()).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.hide_timeout_ms, 3_000);
        assert_eq!(config.min_interval_ms, 2_000);
        assert!(config.notifications_enabled);
    }

    #[test]
    fn rejects_zero_rates_and_timeouts() {
        let args = PipelineCliArgs {
            fps: Some(0),
            ..Default::default()
        };
        assert!(PipelineConfig::try_from(args).is_err());

        let args = PipelineCliArgs {
            join_timeout_ms: Some(0),
            ..Default::default()
        };
        let err = PipelineConfig::try_from(args).unwrap_err();
        assert!(err.to_string().contains("--join-timeout-ms"));
    }

    #[test]
    fn rejects_out_of_range_quality() {
        for quality in [0, 101, -5] {
            let args = PipelineCliArgs {
                jpeg_quality: Some(quality),
                ..Default::default()
            };
            assert!(PipelineConfig::try_from(args).is_err(), "quality {quality}");
        }
    }

    #[test]
    fn save_flags_select_disk_output() {
        let args = PipelineCliArgs {
            save: true,
            save_dir: Some(PathBuf::from("/tmp/frames")),
            mute: true,
            no_detection: true,
            ..Default::default()
        };
        let config = PipelineConfig::try_from(args).unwrap();
        assert_eq!(config.output, OutputMode::SaveToDisk);
        assert_eq!(config.save_dir, PathBuf::from("/tmp/frames"));
        assert!(!config.notifications_enabled);
        assert!(!config.detection_enabled);
    }

    #[test]
    fn save_dir_without_save_is_rejected() {
        let args = PipelineCliArgs {
            save_dir: Some(PathBuf::from("out")),
            ..Default::default()
        };
        assert!(PipelineConfig::try_from(args).is_err());
    }
}
