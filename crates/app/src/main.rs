mod cli;
mod sinks;

use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use ml_core::{DetectionBox, DetectionError, Detector};
use tracing::{info, warn};
use video_ingest::{FfmpegScreenSource, Frame, FrameSource};
use vision::{
    CommandSoundPlayer, DisplaySink, OverlaySession, SessionState, ShutdownSignal, SoundPlayer,
    display_channel, telemetry,
};

use crate::{
    cli::{AlerterConfig, Cli, DisplayKind, SourceConfig},
    sinks::{JsonLinesSink, LogSink},
};

/// How often the display loop drains pipeline events.
const DISPLAY_TICK: Duration = Duration::from_millis(50);

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = AlerterConfig::try_from(Cli::parse())?;
    let _telemetry_guard = telemetry::enter_runtime(&config.pipeline.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = ShutdownSignal::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || handler_shutdown.trigger())
        .context("failed to install Ctrl+C handler")?;

    let detector = build_detector(&config)?;
    let source = open_source(&config)?;
    let (publisher, events) = display_channel();

    let mut builder =
        OverlaySession::builder(config.pipeline.clone(), detector, source, publisher);
    if let Some(player) = build_player(&config) {
        builder = builder.player(player);
    }
    let session = builder.build().context("failed to set up overlay session")?;

    let mut sink: Box<dyn DisplaySink> = match config.display {
        DisplayKind::Log => Box::new(LogSink::default()),
        DisplayKind::Json => Box::new(JsonLinesSink::new(io::stdout())),
    };

    session.start().context("failed to start overlay session")?;
    info!("watching for detections, press Ctrl+C to stop");

    let started = Instant::now();
    while !shutdown.wait_timeout(DISPLAY_TICK) {
        events.drain(sink.as_mut());
        if session.state() == SessionState::Stopping {
            break;
        }
        if config.duration.is_some_and(|limit| started.elapsed() >= limit) {
            info!("run duration reached");
            break;
        }
    }

    let outcome = session.stop();
    events.drain(sink.as_mut());
    outcome.context("overlay session failed")?;
    Ok(())
}

fn open_source(config: &AlerterConfig) -> Result<Box<dyn FrameSource>> {
    match &config.source {
        SourceConfig::Screen { region, display } => {
            let source = FfmpegScreenSource::spawn(*region, config.pipeline.target_fps, display)
                .context("failed to start screen capture")?;
            Ok(Box::new(source))
        }
        #[cfg(feature = "with-opencv")]
        SourceConfig::Device { uri, size } => {
            let source = video_ingest::DeviceSource::open(
                uri,
                *size,
                f64::from(config.pipeline.target_fps),
            )
            .with_context(|| format!("failed to open device {uri}"))?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "with-opencv"))]
        SourceConfig::Device { .. } => {
            bail!("device capture requires building with --features with-opencv")
        }
    }
}

/// Stand-in used when frames are captured without detection.
struct DetectionDisabled;

impl Detector for DetectionDisabled {
    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionBox>, DetectionError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

fn build_detector(config: &AlerterConfig) -> Result<Arc<dyn Detector>> {
    if !config.pipeline.detection_enabled {
        return Ok(Arc::new(DetectionDisabled));
    }
    let Some(model_path) = config.detector.model_path.as_ref() else {
        bail!("Missing model. Provide --model <path> or run with --no-detection.");
    };
    load_model(config, model_path)
}

#[cfg(feature = "with-tch")]
fn load_model(config: &AlerterConfig, model_path: &std::path::Path) -> Result<Arc<dyn Detector>> {
    use ml_core::{detector::TorchDetector, tch::Device};

    let device = if config.detector.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    info!("loading {} on {device:?}", model_path.display());
    let detector = TorchDetector::new(
        model_path,
        device,
        config.detector.input_size,
        config.detector.decode.clone(),
    )
    .with_context(|| format!("failed to load model {}", model_path.display()))?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_model(_config: &AlerterConfig, model_path: &std::path::Path) -> Result<Arc<dyn Detector>> {
    bail!(
        "cannot load {}: built without libtorch support (enable --features with-tch)",
        model_path.display()
    )
}

/// Sound player for alerts, or `None` when alerts are off or the file is missing.
fn build_player(config: &AlerterConfig) -> Option<Box<dyn SoundPlayer>> {
    if !config.pipeline.notifications_enabled {
        return None;
    }
    match CommandSoundPlayer::for_file(&config.pipeline.sound_file) {
        Ok(player) => Some(Box::new(player)),
        Err(err) => {
            warn!("{err}; audio alerts disabled");
            None
        }
    }
}
