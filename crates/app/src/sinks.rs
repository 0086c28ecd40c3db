//! Headless display layers fed from the pipeline's event channel.

use std::io::Write;

use ml_core::DetectionBox;
use tracing::{error, info, warn};
use vision::{DisplayEvent, DisplaySink};

/// Reports overlay changes through the log.
#[derive(Default)]
pub struct LogSink {
    visible: bool,
}

impl DisplaySink for LogSink {
    fn on_boxes_updated(&mut self, boxes: &[DetectionBox]) {
        self.visible = true;
        if boxes.is_empty() {
            return;
        }
        let summary: Vec<String> = boxes
            .iter()
            .map(|b| {
                format!(
                    "{} {:.0}% at ({}, {})-({}, {})",
                    b.label(),
                    b.confidence() * 100.0,
                    b.x1(),
                    b.y1(),
                    b.x2(),
                    b.y2()
                )
            })
            .collect();
        info!("{} object(s) on screen: {}", boxes.len(), summary.join("; "));
    }

    fn on_visibility_changed(&mut self, visible: bool) {
        if visible != self.visible {
            info!("overlay {}", if visible { "shown" } else { "hidden" });
        }
        self.visible = visible;
    }

    fn on_session_error(&mut self, reason: &str) {
        error!("capture session failed: {reason}");
    }
}

/// Writes one JSON object per event.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn emit(&mut self, event: &DisplayEvent) {
        let written = serde_json::to_writer(&mut self.out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(err) = written {
            warn!("failed to write display event: {err}");
        }
    }
}

impl<W: Write> DisplaySink for JsonLinesSink<W> {
    fn on_boxes_updated(&mut self, boxes: &[DetectionBox]) {
        self.emit(&DisplayEvent::BoxesUpdated {
            boxes: boxes.to_vec(),
        });
    }

    fn on_visibility_changed(&mut self, visible: bool) {
        self.emit(&DisplayEvent::VisibilityChanged { visible });
    }

    fn on_session_error(&mut self, reason: &str) {
        self.emit(&DisplayEvent::SessionFailed {
            reason: reason.to_string(),
        });
    }

    fn apply(&mut self, event: &DisplayEvent) {
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_sink_writes_one_line_per_event() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let b = DetectionBox::new(1, 2, 3, 4, "hot dog", 0.5).unwrap();
        sink.apply(&DisplayEvent::BoxesUpdated { boxes: vec![b] });
        sink.on_visibility_changed(false);

        let text = String::from_utf8(sink.out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "boxes_updated");
        assert_eq!(lines[0]["boxes"][0]["label"], "hot dog");
        assert_eq!(lines[1]["event"], "visibility_changed");
        assert_eq!(lines[1]["visible"], false);
    }
}
