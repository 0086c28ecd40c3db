//! JPEG snapshots of captured frames, optionally annotated with detections.

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ml_core::DetectionBox;
use video_ingest::Frame;

use crate::pipeline::{error::SnapshotError, state::DetectionSnapshot};

/// File prefix for frames that went through the detector.
pub const ANNOTATED_PREFIX: &str = "hotdog_screen";
/// File prefix for frames captured with detection disabled.
pub const RAW_PREFIX: &str = "screen";

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 3;

/// `<prefix>_<YYYYmmdd-HHMMSS>_<seq:04>.jpg`
pub fn snapshot_file_name(prefix: &str, at: DateTime<Local>, seq: u64) -> String {
    format!("{prefix}_{}_{seq:04}.jpg", at.format("%Y%m%d-%H%M%S"))
}

pub struct SnapshotWriter {
    dir: PathBuf,
    quality: u8,
    last_generation: Option<u64>,
}

impl SnapshotWriter {
    /// Creates `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, quality: u8) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            quality: quality.clamp(1, 100),
            last_generation: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the snapshot's frame with its boxes drawn on.
    ///
    /// Skipped (returns `Ok(None)`) when there is no frame yet or the
    /// snapshot's generation was already written.
    pub fn write_detection(
        &mut self,
        snapshot: &DetectionSnapshot,
        seq: u64,
    ) -> Result<Option<PathBuf>, SnapshotError> {
        let Some(frame) = snapshot.frame.as_deref() else {
            return Ok(None);
        };
        if self.last_generation == Some(snapshot.generation) {
            return Ok(None);
        }
        let image = annotate_frame(frame, &snapshot.boxes)?;
        let path = self.encode(ANNOTATED_PREFIX, seq, &image)?;
        self.last_generation = Some(snapshot.generation);
        Ok(Some(path))
    }

    /// Write a frame as captured.
    pub fn write_raw(&self, frame: &Frame, seq: u64) -> Result<PathBuf, SnapshotError> {
        let image = frame_to_rgb(frame)?;
        self.encode(RAW_PREFIX, seq, &image)
    }

    fn encode(&self, prefix: &str, seq: u64, image: &RgbImage) -> Result<PathBuf, SnapshotError> {
        let path = self.dir.join(snapshot_file_name(prefix, Local::now(), seq));
        let file = fs::File::create(&path).map_err(|source| SnapshotError::Write {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(image)?;
        writer.flush().map_err(|source| SnapshotError::Write {
            path: path.clone(),
            source,
        })?;
        metrics::counter!("vision_snapshots_written_total", "kind" => prefix.to_string())
            .increment(1);
        Ok(path)
    }
}

fn frame_to_rgb(frame: &Frame) -> Result<RgbImage, SnapshotError> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    if frame.width <= 0 || frame.height <= 0 {
        return Err(SnapshotError::FrameSize {
            width: frame.width,
            height: frame.height,
        });
    }
    ImageBuffer::from_raw(frame.width as u32, frame.height as u32, rgb).ok_or(
        SnapshotError::FrameSize {
            width: frame.width,
            height: frame.height,
        },
    )
}

/// Draw boxes and `<label> <confidence>%` captions onto an RGB copy of `frame`.
pub fn annotate_frame(frame: &Frame, boxes: &[DetectionBox]) -> Result<RgbImage, SnapshotError> {
    let mut image = frame_to_rgb(frame)?;

    for b in boxes {
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut image,
                b.x1() + inset,
                b.y1() + inset,
                b.x2() - inset,
                b.y2() - inset,
                BOX_COLOR,
            );
        }
    }

    for b in boxes {
        let text = format!("{} {:.0}%", b.label(), b.confidence() * 100.0);
        let label_x = b.x1();
        let label_y = (b.y1() - 12).max(0);
        let text_width = text.chars().count() as i32 * 6;
        fill_rect(
            &mut image,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            LABEL_BG,
        );
        draw_label(&mut image, label_x + 1, label_y + 1, &text, BOX_COLOR);
    }

    Ok(image)
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if left > right || top > bottom {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let l = left.clamp(0, width - 1);
    let r = right.clamp(0, width - 1);
    let t = top.clamp(0, height - 1);
    let b = bottom.clamp(0, height - 1);

    for x in l..=r {
        if (0..height).contains(&top) {
            image.put_pixel(x as u32, top as u32, color);
        }
        if (0..height).contains(&bottom) {
            image.put_pixel(x as u32, bottom as u32, color);
        }
    }
    for y in t..=b {
        if (0..width).contains(&left) {
            image.put_pixel(left as u32, y as u32, color);
        }
        if (0..width).contains(&right) {
            image.put_pixel(right as u32, y as u32, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if !(0..height).contains(&py) {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && (0..width).contains(&px) {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += 6;
    }
}

/// 5x7 bitmap font covering digits, `%`, and the letters of common labels.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn gray_frame(w: i32, h: i32) -> Frame {
        Frame::bgr8(vec![40; (w * h * 3) as usize], w, h, 0).unwrap()
    }

    #[test]
    fn file_name_follows_prefix_timestamp_sequence() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_eq!(
            snapshot_file_name(ANNOTATED_PREFIX, at, 7),
            "hotdog_screen_20240309-070502_0007.jpg"
        );
        assert_eq!(
            snapshot_file_name(RAW_PREFIX, at, 12345),
            "screen_20240309-070502_12345.jpg"
        );
    }

    #[test]
    fn annotation_draws_box_outline() {
        let frame = gray_frame(64, 48);
        let b = DetectionBox::new(10, 20, 40, 44, "hot dog", 0.9).unwrap();
        let image = annotate_frame(&frame, &[b]).unwrap();
        assert_eq!(image.get_pixel(10, 30), &BOX_COLOR);
        assert_eq!(image.get_pixel(40, 30), &BOX_COLOR);
        assert_eq!(image.get_pixel(25, 35), &Rgb([40, 40, 40]));
    }

    #[test]
    fn detection_writes_once_per_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path().join("shots"), 80).unwrap();
        let mut snapshot = DetectionSnapshot {
            frame: Some(Arc::new(gray_frame(16, 16))),
            boxes: vec![DetectionBox::new(1, 1, 8, 8, "hot dog", 0.5).unwrap()],
            last_update_ms: Some(10),
            generation: 1,
        };

        let first = writer.write_detection(&snapshot, 0).unwrap().unwrap();
        assert!(first.exists());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("hotdog_screen_") && name.ends_with("_0000.jpg"));
        assert!(writer.write_detection(&snapshot, 1).unwrap().is_none());

        snapshot.generation = 2;
        assert!(writer.write_detection(&snapshot, 2).unwrap().is_some());
        assert_eq!(fs::read_dir(writer.dir()).unwrap().count(), 2);
    }

    #[test]
    fn empty_snapshot_is_skipped_and_raw_frames_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SnapshotWriter::new(dir.path(), 90).unwrap();
        assert!(
            writer
                .write_detection(&DetectionSnapshot::default(), 0)
                .unwrap()
                .is_none()
        );
        let path = writer.write_raw(&gray_frame(8, 8), 3).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }
}
