use serde::Serialize;
use thiserror::Error;

/// Axis-aligned detection in frame pixel coordinates.
///
/// Fields are private so a constructed box always satisfies `x1 < x2`,
/// `y1 < y2` and `0 <= confidence <= 1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionBox {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    label: String,
    confidence: f32,
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidBox {
    #[error("degenerate box ({x1}, {y1}) -> ({x2}, {y2})")]
    Degenerate { x1: i32, y1: i32, x2: i32, y2: i32 },
    #[error("confidence {0} outside [0, 1]")]
    Confidence(f32),
}

impl DetectionBox {
    pub fn new(
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        label: impl Into<String>,
        confidence: f32,
    ) -> Result<Self, InvalidBox> {
        if x1 >= x2 || y1 >= y2 {
            return Err(InvalidBox::Degenerate { x1, y1, x2, y2 });
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(InvalidBox::Confidence(confidence));
        }
        Ok(Self {
            x1,
            y1,
            x2,
            y2,
            label: label.into(),
            confidence,
        })
    }

    pub fn x1(&self) -> i32 {
        self.x1
    }

    pub fn y1(&self) -> i32 {
        self.y1
    }

    pub fn x2(&self) -> i32 {
        self.x2
    }

    pub fn y2(&self) -> i32 {
        self.y2
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// `[x1, y1, x2, y2]`
    pub fn corners(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}
