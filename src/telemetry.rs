use bs_capture::Rect;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

use crate::skills::phase::Phase;

/// Default number of events kept for observers
pub const TIMELINE_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Detect,
    Confirm,
    Click,
    Transition,
    Calibration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    /// Seconds since the unix epoch
    pub ts: f64,
    pub time: String,
    pub phase: Option<Phase>,
    pub kind: EventKind,
    pub label: String,
    pub region: Option<Rect>,
    pub boxes: Vec<Rect>,
    pub confidence: f64,
    pub click: Option<(i32, i32)>,
    pub note: Option<String>,
}

impl TelemetryEvent {
    pub fn new(ts: f64, phase: Option<Phase>, kind: EventKind, label: impl Into<String>) -> Self {
        let time = DateTime::<Utc>::from_timestamp_millis((ts * 1000.0) as i64)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Self {
            ts,
            time,
            phase,
            kind,
            label: label.into(),
            region: None,
            boxes: Vec::new(),
            confidence: 0.0,
            click: None,
            note: None,
        }
    }

    pub fn region(mut self, region: Option<Rect>) -> Self {
        self.region = region;
        self
    }

    pub fn boxes(mut self, boxes: Vec<Rect>) -> Self {
        self.boxes = boxes;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn click(mut self, x: i32, y: i32) -> Self {
        self.click = Some((x, y));
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Bounded ring of recent events. Writers hold the lock only to append.
pub struct Timeline {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(TIMELINE_CAPACITY)
    }
}

impl Timeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: TelemetryEvent) {
        debug!(
            "event {:?} {} conf={:.2}{}",
            event.kind,
            event.label,
            event.confidence,
            event
                .note
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default()
        );
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Copies of the newest `n` events, oldest first.
    pub fn last(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
