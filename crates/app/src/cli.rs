//! Command line parsing for the alerter binary.
//!
//! Flags are validated once into an [`AlerterConfig`]; nothing downstream
//! looks at raw arguments again.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, ValueEnum};
use ml_core::{DecodeOptions, HOT_DOG_CLASS};
use video_ingest::CaptureRegion;
use vision::{PipelineCliArgs, PipelineConfig};

const DEFAULT_REGION: CaptureRegion = CaptureRegion {
    left: 0,
    top: 0,
    width: 1920,
    height: 1080,
};
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Parser)]
#[command(
    name = "hotdog-alerter",
    version,
    about = "Watch the screen for hot dogs, box them and play an alert"
)]
pub struct Cli {
    #[command(flatten)]
    pub pipeline: PipelineCliArgs,
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub detector: DetectorArgs,
    /// How detection events are rendered.
    #[arg(long = "output-format", value_enum, default_value_t = DisplayKind::Log)]
    pub display: DisplayKind,
    /// Stop automatically after this many seconds.
    #[arg(long = "duration-secs", value_name = "SECS")]
    pub duration_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DisplayKind {
    /// Human readable log lines.
    Log,
    /// One JSON object per event on stdout.
    Json,
}

#[derive(Debug, Default, Args)]
pub struct SourceArgs {
    /// Screen rectangle to watch as LEFT,TOP,WIDTH,HEIGHT.
    #[arg(long = "region", value_name = "L,T,W,H", value_parser = parse_region)]
    pub region: Option<CaptureRegion>,
    /// X11 display (Linux) or input device name passed to ffmpeg.
    #[arg(long = "screen", value_name = "NAME")]
    pub screen: Option<String>,
    /// Read from a camera index, file or stream instead of the screen.
    #[arg(long = "device", value_name = "URI", conflicts_with = "region")]
    pub device: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct DetectorArgs {
    /// TorchScript YOLOv8 export.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Minimum detection confidence, in (0, 1].
    #[arg(long = "confidence", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// IoU above which overlapping boxes are merged.
    #[arg(long = "iou", value_name = "IOU")]
    pub iou: Option<f32>,
    /// Class to detect as ID=LABEL; repeatable. Defaults to 52=hot dog.
    #[arg(long = "class", value_name = "ID=LABEL", value_parser = parse_class)]
    pub classes: Vec<(i64, String)>,
    /// Square model input size in pixels.
    #[arg(long = "input-size", value_name = "PX")]
    pub input_size: Option<u32>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceConfig {
    Screen {
        region: CaptureRegion,
        display: String,
    },
    Device {
        uri: String,
        size: (i32, i32),
    },
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    pub input_size: (u32, u32),
    pub use_cpu: bool,
    pub decode: DecodeOptions,
}

#[derive(Clone, Debug)]
pub struct AlerterConfig {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub display: DisplayKind,
    pub duration: Option<Duration>,
}

impl TryFrom<Cli> for AlerterConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let pipeline = PipelineConfig::try_from(cli.pipeline).context("invalid pipeline flags")?;

        let region = cli.source.region.unwrap_or(DEFAULT_REGION);
        let source = match cli.source.device {
            Some(uri) => SourceConfig::Device {
                uri,
                size: (region.width, region.height),
            },
            None => SourceConfig::Screen {
                region,
                display: cli.source.screen.unwrap_or_else(default_screen),
            },
        };

        let defaults = DecodeOptions::default();
        let confidence = cli
            .detector
            .confidence
            .unwrap_or(defaults.confidence_threshold);
        if !(confidence > 0.0 && confidence <= 1.0) {
            bail!("--confidence must be in (0, 1], got {confidence}");
        }
        let iou = cli.detector.iou.unwrap_or(defaults.iou_threshold);
        if !(iou > 0.0 && iou <= 1.0) {
            bail!("--iou must be in (0, 1], got {iou}");
        }
        let classes = if cli.detector.classes.is_empty() {
            defaults.classes.clone()
        } else {
            cli.detector.classes.into_iter().collect::<BTreeMap<_, _>>()
        };

        let input_size = cli.detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE);
        if input_size == 0 || input_size % 32 != 0 {
            bail!("--input-size must be a positive multiple of 32");
        }

        if pipeline.detection_enabled && cli.detector.model.is_none() {
            bail!("Missing model. Provide --model <path> or run with --no-detection.");
        }

        Ok(Self {
            pipeline,
            source,
            detector: DetectorConfig {
                model_path: cli.detector.model,
                input_size: (input_size, input_size),
                use_cpu: cli.detector.use_cpu,
                decode: DecodeOptions {
                    confidence_threshold: confidence,
                    iou_threshold: iou,
                    classes,
                    ..defaults
                },
            },
            display: cli.display,
            duration: cli.duration_secs.map(Duration::from_secs),
        })
    }
}

fn default_screen() -> String {
    std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string())
}

fn parse_region(raw: &str) -> Result<CaptureRegion> {
    let parts: Vec<i32> = raw
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("region {raw:?} is not four integers"))?;
    let [left, top, width, height] = parts[..] else {
        return Err(anyhow!("region {raw:?} must be LEFT,TOP,WIDTH,HEIGHT"));
    };
    if width <= 0 || height <= 0 {
        bail!("region width and height must be positive");
    }
    Ok(CaptureRegion {
        left,
        top,
        width,
        height,
    })
}

fn parse_class(raw: &str) -> Result<(i64, String)> {
    let (id, label) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("class {raw:?} must be ID=LABEL"))?;
    let id: i64 = id
        .trim()
        .parse()
        .with_context(|| format!("class id {id:?} is not an integer"))?;
    if id < 0 {
        bail!("class id must not be negative");
    }
    let label = label.trim();
    if label.is_empty() {
        bail!("class {id} needs a label");
    }
    Ok((id, label.to_string()))
}
