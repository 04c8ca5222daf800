use bs_capture::{CaptureStatus, Rect};
use bs_vision::{DetectedBy, Detection, DetectionBox};
use bs_world::{CompassState, TileTrack, WorldOffset, WorldTile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::calibration::CalibrationOverride;
use crate::input::{PlannedClick, PlannedInput};
use crate::skills::phase::{Phase, Transition};

/// Found/count/confidence/method for one detection category
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryReport {
    pub found: bool,
    pub count: usize,
    pub confidence: f64,
    pub method: Option<DetectedBy>,
    pub boxes: Vec<Rect>,
}

impl CategoryReport {
    pub fn from_detection(det: &Detection) -> Self {
        Self::from_boxes(&det.boxes, det.method)
    }

    pub fn from_boxes(boxes: &[DetectionBox], method: Option<DetectedBy>) -> Self {
        Self {
            found: !boxes.is_empty(),
            count: boxes.len(),
            confidence: boxes.iter().map(|b| b.score).fold(0.0, f64::max),
            method: if boxes.is_empty() { None } else { method },
            boxes: boxes.iter().map(|b| b.rect()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackReport {
    pub id: u64,
    pub row: i32,
    pub col: i32,
    pub velocity_row: f64,
    pub velocity_col: f64,
    pub hover_confirmed: bool,
    pub locked: bool,
}

impl TrackReport {
    pub fn new(track: &TileTrack, locked: Option<u64>) -> Self {
        Self {
            id: track.id,
            row: track.row,
            col: track.col,
            velocity_row: track.velocity_row,
            velocity_col: track.velocity_col,
            hover_confirmed: track.hover_confirmed,
            locked: locked == Some(track.id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompassReport {
    pub angle_deg: Option<f64>,
    pub staleness_s: Option<f64>,
    pub drift: bool,
}

impl CompassReport {
    pub fn new(state: &CompassState, now: f64) -> Self {
        Self {
            angle_deg: state.angle_deg,
            staleness_s: state.staleness(now),
            drift: state.drift_flag,
        }
    }
}

/// Everything observers learn about one decision cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub timestamp: f64,
    pub phase: Phase,
    pub target: CategoryReport,
    pub prompt: CategoryReport,
    pub prepare: CategoryReport,
    pub weapon: CategoryReport,
    pub battle: CategoryReport,
    pub planned_clicks: Vec<PlannedClick>,
    /// Clicks plus pointer moves and key presses, in execution order
    pub inputs: Vec<PlannedInput>,
    pub tracks: Vec<TrackReport>,
    pub compass: CompassReport,
    pub world_offset: Option<WorldOffset>,
    pub world_tile: Option<WorldTile>,
    pub detections_total: u64,
    pub transition: Option<Transition>,
    pub click_attempts: BTreeMap<String, u32>,
    pub confidence_history: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub paused: bool,
    pub skill: Option<String>,
    pub cycles: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub detections_total: u64,
    pub last_report: Option<CycleReport>,
    pub capture: CaptureStatus,
    pub calibration: Vec<CalibrationOverride>,
}

/// Shared status. Readers get a copy; writers hold the lock only to swap fields.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<RuntimeStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        let mut status = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    pub fn snapshot(&self) -> RuntimeStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_vision::Method;

    #[test]
    fn test_category_from_boxes() {
        let boxes = vec![
            DetectionBox::new(Rect::new(0, 0, 10, 10), 0.7, Method::Text, "a"),
            DetectionBox::new(Rect::new(20, 0, 10, 10), 0.9, Method::Text, "a"),
        ];
        let report = CategoryReport::from_boxes(&boxes, Some(DetectedBy::Text));
        assert!(report.found);
        assert_eq!(report.count, 2);
        assert!((report.confidence - 0.9).abs() < 1e-9);
        assert_eq!(report.boxes[1], Rect::new(20, 0, 10, 10));

        let empty = CategoryReport::from_boxes(&[], Some(DetectedBy::Text));
        assert!(!empty.found);
        assert_eq!(empty.method, None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let board = StatusBoard::new();
        board.update(|s| {
            s.running = true;
            s.cycles = 3;
        });
        let snap = board.snapshot();
        board.update(|s| s.cycles = 4);
        assert_eq!(snap.cycles, 3);
        assert!(snap.running);
        assert_eq!(board.snapshot().cycles, 4);
    }
}
