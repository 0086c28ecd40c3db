//! YOLOv8 tensor preparation and output decoding.
//!
//! Nothing here touches libtorch, so the maths is shared by every backend and
//! testable on plain slices.

use std::{cmp::Ordering, collections::BTreeMap};

use image::{ImageBuffer, Rgb, imageops::FilterType};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{boxes::DetectionBox, detector::DetectionError};

/// COCO class id of "hot dog".
pub const HOT_DOG_CLASS: i64 = 52;

/// Filtering applied to raw model output before boxes leave the detector.
#[derive(Clone, Debug)]
pub struct DecodeOptions {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Class ids to keep, with display labels. Empty keeps every class.
    pub classes: BTreeMap<i64, String>,
    pub max_detections: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            iou_threshold: 0.4,
            classes: BTreeMap::from([(HOT_DOG_CLASS, "hot dog".to_string())]),
            max_detections: 512,
        }
    }
}

impl DecodeOptions {
    fn allows(&self, class_id: i64) -> bool {
        self.classes.is_empty() || self.classes.contains_key(&class_id)
    }

    fn label_for(&self, class_id: i64) -> String {
        self.classes
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class {class_id}"))
    }
}

/// Scored box in model input coordinates, `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// Convert a BGR8 frame into a normalised RGB CHW buffer of `input_size`.
pub fn frame_to_chw(frame: &Frame, input_size: (u32, u32)) -> Result<Vec<f32>, DetectionError> {
    if !matches!(frame.format, FrameFormat::Bgr8) {
        return Err(DetectionError::UnsupportedFormat);
    }
    let expected = frame.format.frame_bytes(frame.width, frame.height);
    if frame.width <= 0 || frame.height <= 0 || frame.data.len() != expected {
        return Err(DetectionError::FrameSize {
            width: frame.width,
            height: frame.height,
            bytes: frame.data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
        frame.width as u32,
        frame.height as u32,
        rgb,
    )
    .ok_or(DetectionError::FrameSize {
        width: frame.width,
        height: frame.height,
        bytes: frame.data.len(),
    })?;

    let (in_w, in_h) = input_size;
    let image = if image.dimensions() != (in_w, in_h) {
        image::imageops::resize(&image, in_w, in_h, FilterType::Triangle)
    } else {
        image
    };

    let plane = (in_w * in_h) as usize;
    let mut chw = vec![0f32; plane * 3];
    for (idx, pixel) in image.pixels().enumerate() {
        for channel in 0..3 {
            chw[channel * plane + idx] = pixel[channel] as f32 / 255.0;
        }
    }
    Ok(chw)
}

/// Decode a channel-major `[4 + classes, predictions]` YOLOv8 head.
///
/// Rows 0..4 hold centre-x, centre-y, width, height; the remaining rows hold
/// per-class scores. Results are thresholded, class filtered and suppressed.
pub fn decode_predictions(
    output: &[f32],
    channels: usize,
    opts: &DecodeOptions,
) -> Result<Vec<Candidate>, DetectionError> {
    if channels < 5 {
        return Err(DetectionError::Model(format!(
            "detector output requires at least 5 channels, got {channels}"
        )));
    }
    if output.len() % channels != 0 {
        return Err(DetectionError::Model(format!(
            "detector output of {} values does not divide into {channels} channels",
            output.len()
        )));
    }

    let predictions = output.len() / channels;
    let at = |channel: usize, idx: usize| output[channel * predictions + idx];

    let mut candidates = Vec::new();
    for idx in 0..predictions {
        let mut best: Option<(i64, f32)> = None;
        for channel in 4..channels {
            let class_id = (channel - 4) as i64;
            if !opts.allows(class_id) {
                continue;
            }
            let score = at(channel, idx);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((class_id, score));
            }
        }
        let Some((class_id, score)) = best else {
            continue;
        };
        if score < opts.confidence_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, idx), at(1, idx), at(2, idx), at(3, idx));
        candidates.push(Candidate {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class_id,
        });
    }

    let mut kept = non_max_suppression(candidates, opts.iou_threshold);
    kept.truncate(opts.max_detections);
    Ok(kept)
}

/// Greedy per-class suppression, highest score first.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Rescale candidates from model input space to frame pixels.
///
/// Boxes that collapse to zero width or height after clamping are dropped.
pub fn into_boxes(
    candidates: &[Candidate],
    input_size: (u32, u32),
    frame_size: (i32, i32),
    opts: &DecodeOptions,
) -> Vec<DetectionBox> {
    let (in_w, in_h) = input_size;
    let (frame_w, frame_h) = frame_size;
    let scale_x = if in_w > 0 { frame_w as f32 / in_w as f32 } else { 1.0 };
    let scale_y = if in_h > 0 { frame_h as f32 / in_h as f32 } else { 1.0 };
    let max_x = (frame_w - 1).max(0) as f32;
    let max_y = (frame_h - 1).max(0) as f32;

    candidates
        .iter()
        .filter_map(|c| {
            let x1 = (c.bbox[0] * scale_x).clamp(0.0, max_x).round() as i32;
            let y1 = (c.bbox[1] * scale_y).clamp(0.0, max_y).round() as i32;
            let x2 = (c.bbox[2] * scale_x).clamp(0.0, max_x).round() as i32;
            let y2 = (c.bbox[3] * scale_y).clamp(0.0, max_y).round() as i32;
            match DetectionBox::new(
                x1,
                y1,
                x2,
                y2,
                opts.label_for(c.class_id),
                c.score.clamp(0.0, 1.0),
            ) {
                Ok(b) => Some(b),
                Err(err) => {
                    debug!("dropping detection: {err}");
                    None
                }
            }
        })
        .collect()
}
