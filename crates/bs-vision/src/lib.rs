use bs_capture::Rect;
use serde::{Deserialize, Serialize};

pub mod color;
pub mod compass;
pub mod engine;
pub mod nms;
pub mod template;
pub mod text;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bs_data::DetectionMethod as MethodHint;
pub use color::RedMask;
pub use compass::NeedleEstimator;
pub use engine::{DetectionEngine, EngineTuning, TargetSpec};
pub use nms::non_max_suppression;
pub use template::Template;
pub use text::{Charset, TesseractRecognizer, TextRecognizer, TextWord};

/// Which detector produced a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Template,
    Text,
}

/// How a whole detection result was obtained. `TextFallback` means the
/// template path was tried first and came back empty, so scores are OCR confidences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    Template,
    Text,
    TextFallback,
}

/// One detection, in frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub score: f64,
    pub method: Method,
    pub label: String,
}

impl DetectionBox {
    pub fn new(rect: Rect, score: f64, method: Method, label: impl Into<String>) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            w: rect.w,
            h: rect.h,
            score,
            method,
            label: label.into(),
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    pub fn center(&self) -> (f64, f64) {
        self.rect().center()
    }
}

/// Deduplicated boxes for one target, best first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    pub boxes: Vec<DetectionBox>,
    pub best_score: f64,
    pub method: Option<DetectedBy>,
}

impl Detection {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_boxes(boxes: Vec<DetectionBox>, method: DetectedBy) -> Self {
        if boxes.is_empty() {
            return Self::empty();
        }
        let best_score = boxes.iter().map(|b| b.score).fold(0.0, f64::max);
        Self {
            boxes,
            best_score,
            method: Some(method),
        }
    }

    pub fn found(&self) -> bool {
        !self.boxes.is_empty()
    }

    pub fn best(&self) -> Option<&DetectionBox> {
        self.boxes.first()
    }
}
