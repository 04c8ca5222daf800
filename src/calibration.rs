//! ROI auto-calibration.
//!
//! When a template detector misses but the text pass finds the same target,
//! the frame is captured and a background job sweeps candidate ROIs for the
//! one where the template scores best. Accepted ROIs become overrides that
//! the detection engine reads at the start of every frame.

use anyhow::{Context, Result};
use bs_capture::{now_secs, Frame, Rect, ScreenRegion};
use bs_data::{CalibrationSettings, Settings};
use bs_vision::template::zncc_map;
use bs_vision::{DetectionBox, Template};
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::telemetry::{EventKind, TelemetryEvent, Timeline};

const X_STEPS: usize = 18;
const Y_STEPS: usize = 18;
const W_STEPS: usize = 12;
const H_STEPS: usize = 10;
/// Margins around the search centre, as fractions of the frame
const HINT_MARGIN: f64 = 0.25;
const PREVIOUS_MARGIN: f64 = 0.08;
const MAX_MATCHES: usize = 32;

/// Which detector a template serves; decides where its ROI may live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detector {
    Nameplate,
    Attack,
}

impl Detector {
    pub fn search_bounds(&self) -> ScreenRegion {
        match self {
            Detector::Nameplate => ScreenRegion::new(0.05, 0.05, 0.90, 0.80),
            Detector::Attack => ScreenRegion::FULL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOverride {
    pub template_id: String,
    pub detector: Detector,
    /// Relative to the capture region, so it survives resolution changes
    pub roi: ScreenRegion,
    pub score: f64,
    pub success_streak: u32,
    pub stable: bool,
    pub last_capture_path: Option<PathBuf>,
    pub updated_ts: f64,
}

/// Best ROI a sweep found
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiMatch {
    pub rect: Rect,
    pub score: f64,
}

#[derive(Debug, Default)]
struct TemplateState {
    disagreements: u32,
    last_hit_ts: Option<f64>,
    last_capture_ts: Option<f64>,
    last_hint: Option<((f64, f64), f64)>,
    job_in_progress: bool,
    last_skip: Option<&'static str>,
}

#[derive(Debug, Default)]
struct Table {
    overrides: BTreeMap<String, CalibrationOverride>,
    states: HashMap<String, TemplateState>,
}

pub struct AutoCalibrator {
    settings: CalibrationSettings,
    overrides_path: PathBuf,
    capture_dir: PathBuf,
    table: Mutex<Table>,
    timeline: Arc<Timeline>,
}

impl AutoCalibrator {
    /// Load persisted overrides. A missing file starts an empty table.
    pub fn load(settings: &Settings, timeline: Arc<Timeline>) -> Result<Self> {
        let overrides_path = settings.data_path(&settings.calibration.overrides_path);
        let capture_dir = settings.data_path(&settings.calibration.capture_dir);

        let overrides: BTreeMap<String, CalibrationOverride> = if overrides_path.exists() {
            let content = std::fs::read_to_string(&overrides_path)
                .with_context(|| format!("Failed to read {}", overrides_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", overrides_path.display()))?
        } else {
            BTreeMap::new()
        };
        info!(
            "Loaded {} ROI overrides from {}",
            overrides.len(),
            overrides_path.display()
        );

        Ok(Self {
            settings: settings.calibration.clone(),
            overrides_path,
            capture_dir,
            table: Mutex::new(Table {
                overrides,
                states: HashMap::new(),
            }),
            timeline,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, now: f64, label: &str, template_id: &str, detail: Option<String>) {
        let note = match detail {
            Some(d) => format!("{} {}", template_id, d),
            None => template_id.to_string(),
        };
        self.timeline.push(
            TelemetryEvent::new(now, None, EventKind::Calibration, label).note(note),
        );
    }

    /// Override ROI for `template_id` in a `width` x `height` frame
    pub fn active_roi(&self, template_id: &str, width: u32, height: u32) -> Option<Rect> {
        self.lock()
            .overrides
            .get(template_id)
            .map(|o| o.roi.to_rect(width, height))
    }

    pub fn get(&self, template_id: &str) -> Option<CalibrationOverride> {
        self.lock().overrides.get(template_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<CalibrationOverride> {
        self.lock().overrides.values().cloned().collect()
    }

    /// The template detector found its target.
    pub fn report_hit(&self, template_id: &str, now: f64) {
        let mut became_stable = None;
        {
            let mut table = self.lock();
            let state = table.states.entry(template_id.to_string()).or_default();
            state.last_hit_ts = Some(now);
            state.disagreements = 0;
            state.last_skip = None;
            if let Some(o) = table.overrides.get_mut(template_id) {
                o.success_streak += 1;
                if !o.stable && o.success_streak >= self.settings.stable_enter_streak {
                    o.stable = true;
                    became_stable = Some(table.overrides.clone());
                }
            }
        }
        if let Some(overrides) = became_stable {
            info!("ROI override for {} is stable", template_id);
            self.emit(now, "STABLE", template_id, None);
            if let Err(e) = self.persist(&overrides) {
                warn!("Failed to persist ROI overrides: {:#}", e);
            }
        }
    }

    /// The template missed but text found the target at `hint`.
    /// Returns a job when a capture was taken and a sweep should run.
    pub fn report_disagreement(
        &self,
        detector: Detector,
        template: &Arc<Template>,
        frame: &Frame,
        hint: &DetectionBox,
        now: f64,
    ) -> Option<CalibrationJob> {
        if !self.settings.enabled {
            return None;
        }
        let template_id = template.id.as_str();
        let hint_center = hint.center();

        let (previous, unstable) = {
            let mut guard = self.lock();
            let table = &mut *guard;
            let state = table.states.entry(template_id.to_string()).or_default();
            let existing = table.overrides.get_mut(template_id);

            let mut unstable = false;
            let skip = if state.job_in_progress {
                Some("job_in_progress")
            } else {
                match existing {
                    Some(o) if o.stable => {
                        state.disagreements += 1;
                        if state.disagreements < self.settings.stable_exit_disagreements {
                            Some("stable_single_fallback")
                        } else {
                            o.stable = false;
                            o.success_streak = 0;
                            unstable = true;
                            None
                        }
                    }
                    Some(o) => {
                        o.success_streak = 0;
                        None
                    }
                    None => None,
                }
            };
            let skip = skip.or_else(|| {
                if state
                    .last_hit_ts
                    .is_some_and(|t| now - t < self.settings.recent_success_window_s)
                {
                    Some("recent_success")
                } else if state
                    .last_capture_ts
                    .is_some_and(|t| now - t < self.settings.capture_cooldown_s)
                {
                    Some("cooldown")
                } else if state.last_hint.is_some_and(|((x, y), conf)| {
                    let moved = ((x - hint_center.0).powi(2) + (y - hint_center.1).powi(2)).sqrt();
                    moved < self.settings.duplicate_px
                        && (conf - hint.score).abs() < self.settings.duplicate_confidence
                }) {
                    Some("duplicate")
                } else {
                    None
                }
            });

            if let Some(reason) = skip {
                let first = state.last_skip != Some(reason);
                state.last_skip = Some(reason);
                drop(guard);
                debug!("Calibration for {} skipped: {}", template_id, reason);
                if first {
                    self.emit(now, "skip", template_id, Some(reason.to_string()));
                }
                return None;
            }

            state.job_in_progress = true;
            state.last_capture_ts = Some(now);
            state.last_hint = Some((hint_center, hint.score));
            state.last_skip = None;
            let previous = table
                .overrides
                .get(template_id)
                .map(|o| o.roi.to_rect(frame.width(), frame.height()));
            (previous, unstable)
        };

        if unstable {
            info!("ROI override for {} lost stability", template_id);
            self.emit(now, "UNSTABLE", template_id, None);
        }

        let capture_dir = match self.capture(template_id, detector, frame, hint, now) {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!("Calibration capture for {} failed: {:#}", template_id, e);
                None
            }
        };

        self.emit(
            now,
            "BEGIN",
            template_id,
            Some(format!("hint {:?} conf {:.2}", hint.rect(), hint.score)),
        );

        Some(CalibrationJob {
            template_id: template_id.to_string(),
            detector,
            template: template.clone(),
            gray: image::imageops::grayscale(&frame.image),
            hint: hint.rect(),
            previous,
            capture_dir,
            min_score: self.settings.search_min_score,
        })
    }

    /// Write `frame.png` and `fallback.json` into a fresh timestamped folder.
    fn capture(
        &self,
        template_id: &str,
        detector: Detector,
        frame: &Frame,
        hint: &DetectionBox,
        now: f64,
    ) -> Result<PathBuf> {
        let stamp = DateTime::<Utc>::from_timestamp_millis((now * 1000.0) as i64)
            .map(|t| t.format("%Y%m%d_%H%M%S_%3f").to_string())
            .unwrap_or_else(|| format!("{:.0}", now * 1000.0));
        let dir = self.capture_dir.join(format!("{}_{}", template_id, stamp));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        frame
            .image
            .save(dir.join("frame.png"))
            .with_context(|| format!("Failed to save frame into {}", dir.display()))?;

        let fallback = serde_json::json!({
            "template_id": template_id,
            "detector": detector,
            "hint": hint,
            "frame_size": [frame.width(), frame.height()],
            "origin": [frame.origin.0, frame.origin.1],
            "ts": now,
        });
        std::fs::write(dir.join("fallback.json"), serde_json::to_string_pretty(&fallback)?)
            .with_context(|| format!("Failed to write fallback.json into {}", dir.display()))?;
        debug!("Calibration capture written to {}", dir.display());
        Ok(dir)
    }

    /// Apply a finished sweep. Returns whether a new override was accepted.
    pub fn complete(&self, job: &CalibrationJob, found: Option<RoiMatch>, now: f64) -> bool {
        let (w, h) = job.gray.dimensions();
        let candidate = {
            let mut table = self.lock();
            if let Some(state) = table.states.get_mut(&job.template_id) {
                state.job_in_progress = false;
            }
            let has_override = table.overrides.contains_key(&job.template_id);
            let threshold = if has_override {
                self.settings.accept_threshold
            } else {
                self.settings.bootstrap_threshold
            };

            match found {
                Some(m) if m.score >= threshold => {
                    let o = CalibrationOverride {
                        template_id: job.template_id.clone(),
                        detector: job.detector,
                        roi: ScreenRegion::from_rect(&m.rect, w, h),
                        score: m.score,
                        success_streak: 0,
                        stable: false,
                        last_capture_path: job.capture_dir.clone(),
                        updated_ts: now,
                    };
                    let mut overrides = table.overrides.clone();
                    overrides.insert(job.template_id.clone(), o.clone());
                    Ok((o, overrides))
                }
                other => Err((other.map(|m| m.score), threshold)),
            }
        };

        let applied = match candidate {
            Ok((o, overrides)) => match self.persist(&overrides) {
                Ok(()) => {
                    info!(
                        "ROI override for {} applied: {:?} score {:.3}",
                        job.template_id, o.roi, o.score
                    );
                    self.emit(
                        now,
                        "APPLY",
                        &job.template_id,
                        Some(format!("score {:.3}", o.score)),
                    );
                    self.lock().overrides.insert(job.template_id.clone(), o);
                    true
                }
                Err(e) => {
                    warn!("Failed to persist ROI override for {}: {:#}", job.template_id, e);
                    self.emit(now, "NO_MATCH", &job.template_id, Some("persist failed".into()));
                    false
                }
            },
            Err((score, threshold)) => {
                let detail = match score {
                    Some(s) => format!("best {:.3} < {:.2}", s, threshold),
                    None => "no candidate".to_string(),
                };
                info!("ROI calibration for {}: no match ({})", job.template_id, detail);
                self.emit(now, "NO_MATCH", &job.template_id, Some(detail));
                false
            }
        };

        if let Some(dir) = &job.capture_dir {
            let record = serde_json::json!({
                "template_id": job.template_id,
                "applied": applied,
                "roi": found.map(|m| m.rect),
                "score": found.map(|m| m.score),
            });
            let written = serde_json::to_string_pretty(&record)
                .map_err(anyhow::Error::from)
                .and_then(|s| std::fs::write(dir.join("calibration.json"), s).map_err(Into::into));
            if let Err(e) = written {
                warn!("Failed to write calibration.json: {:#}", e);
            }
        }

        self.emit(now, "END", &job.template_id, None);
        applied
    }

    /// Forget an in-flight job that will never complete.
    pub fn abandon(&self, template_id: &str) {
        if let Some(state) = self.lock().states.get_mut(template_id) {
            state.job_in_progress = false;
        }
    }

    /// Write the table to a temp file then rename it over the real one.
    fn persist(&self, overrides: &BTreeMap<String, CalibrationOverride>) -> Result<()> {
        write_atomic(&self.overrides_path, &serde_json::to_string_pretty(overrides)?)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// A frame snapshot and everything needed to search it, detached from the loop
pub struct CalibrationJob {
    pub template_id: String,
    pub detector: Detector,
    template: Arc<Template>,
    gray: GrayImage,
    hint: Rect,
    previous: Option<Rect>,
    capture_dir: Option<PathBuf>,
    min_score: f64,
}

impl CalibrationJob {
    /// Where this job searches: around the last good ROI when there is one,
    /// otherwise around the text hint, clipped to the detector's bounds.
    fn search_window(&self) -> Option<Rect> {
        let (w, h) = self.gray.dimensions();
        let (centre, margin) = match self.previous {
            Some(prev) => (prev, PREVIOUS_MARGIN),
            None => (self.hint, HINT_MARGIN),
        };
        let mx = (margin * w as f64).round() as i32;
        let my = (margin * h as f64).round() as i32;
        let window = Rect::new(
            centre.x - mx,
            centre.y - my,
            centre.w + 2 * mx,
            centre.h + 2 * my,
        );
        window.intersection(&self.detector.search_bounds().to_rect(w, h))
    }

    /// Sweep candidate ROIs and return the best-scoring one that contains a
    /// template placement, preferring the smallest area among equals.
    pub fn run(&self) -> Option<RoiMatch> {
        let window = self.search_window()?;
        let crop = image::imageops::crop_imm(
            &self.gray,
            window.x as u32,
            window.y as u32,
            window.w as u32,
            window.h as u32,
        )
        .to_image();
        let map = zncc_map(&crop, self.template.gray())?;

        let (tw, th) = (self.template.width() as i32, self.template.height() as i32);
        let mut matches: Vec<(Rect, f64)> = map
            .peaks(self.min_score as f32)
            .into_iter()
            .map(|(x, y, s)| {
                (
                    Rect::new(window.x + x as i32, window.y + y as i32, tw, th),
                    s as f64,
                )
            })
            .collect();
        if matches.is_empty() {
            debug!("Calibration sweep for {}: no placement >= {:.2}", self.template_id, self.min_score);
            return None;
        }
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(MAX_MATCHES);

        let min_w = (tw * 3 / 2).max(tw + 8).min(window.w);
        let min_h = (th * 3 / 2).max(th + 8).min(window.h);
        let mut best: Option<RoiMatch> = None;

        for wi in 0..W_STEPS {
            let cw = lerp(min_w, window.w, wi, W_STEPS);
            for hi in 0..H_STEPS {
                let ch = lerp(min_h, window.h, hi, H_STEPS);
                for xi in 0..X_STEPS {
                    let cx = lerp(window.x, window.right() - cw, xi, X_STEPS);
                    for yi in 0..Y_STEPS {
                        let cy = lerp(window.y, window.bottom() - ch, yi, Y_STEPS);
                        let candidate = Rect::new(cx, cy, cw, ch);
                        let score = matches
                            .iter()
                            .filter(|(r, _)| candidate.contains_rect(r))
                            .map(|(_, s)| *s)
                            .fold(f64::NEG_INFINITY, f64::max);
                        if !score.is_finite() {
                            continue;
                        }
                        let better = match &best {
                            None => true,
                            Some(b) => {
                                score > b.score + 1e-9
                                    || ((score - b.score).abs() <= 1e-9
                                        && candidate.area() < b.rect.area())
                            }
                        };
                        if better {
                            best = Some(RoiMatch {
                                rect: candidate,
                                score,
                            });
                        }
                    }
                }
            }
        }

        if let Some(b) = &best {
            debug!(
                "Calibration sweep for {}: best {:?} score {:.3}",
                self.template_id, b.rect, b.score
            );
        }
        best
    }
}

/// `i`-th of `steps` evenly spaced values from `lo` to `hi`
fn lerp(lo: i32, hi: i32, i: usize, steps: usize) -> i32 {
    if steps <= 1 || hi <= lo {
        return lo;
    }
    lo + ((hi - lo) as f64 * i as f64 / (steps - 1) as f64).round() as i32
}

/// Runs sweeps off the decision loop. Jobs arrive over a bounded channel;
/// the worker ends when every sender is dropped.
pub fn spawn_worker(calibrator: Arc<AutoCalibrator>) -> (mpsc::Sender<CalibrationJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CalibrationJob>(4);
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let template_id = job.template_id.clone();
            let result = tokio::task::spawn_blocking(move || {
                let found = job.run();
                (job, found)
            })
            .await;
            match result {
                Ok((job, found)) => {
                    calibrator.complete(&job, found, now_secs());
                }
                Err(e) => {
                    warn!("Calibration job for {} failed: {}", template_id, e);
                    calibrator.abandon(&template_id);
                }
            }
        }
        debug!("Calibration worker stopped");
    });
    (tx, handle)
}
