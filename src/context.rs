use anyhow::Result;
use bs_capture::Frame;
use bs_data::Settings;
use bs_vision::{DetectionEngine, EngineTuning, TextRecognizer};
use bs_world::{CompassState, GridState, TileCoord, TileGrid, TileTracker, TrackerTuning, WorldTile};
use std::sync::Arc;

use crate::calibration::{AutoCalibrator, CalibrationJob};
use crate::input::PlannedInput;
use crate::navigation::compass::ALIGN_LABEL;
use crate::navigation::{OrientationNormalizer, WorldAnchor};
use crate::skills::phase::Phase;
use crate::telemetry::{EventKind, TelemetryEvent, Timeline};

/// Result of the per-cycle navigation upkeep
#[derive(Debug, Clone, Default)]
pub struct NavigationStep {
    pub inputs: Vec<PlannedInput>,
    pub compass: CompassState,
    pub world_tile: Option<WorldTile>,
}

/// Everything a skill works with. Owned by the decision loop and handed to
/// the active skill one frame at a time.
pub struct RuntimeContext {
    pub settings: Settings,
    pub engine: DetectionEngine,
    pub grid: GridState,
    pub tracker: TileTracker,
    pub compass: OrientationNormalizer,
    pub anchor: WorldAnchor,
    pub calibrator: Arc<AutoCalibrator>,
    pub timeline: Arc<Timeline>,
    /// Captured calibration work waiting for the background worker
    pub pending_jobs: Vec<CalibrationJob>,
    pub detections_total: u64,
}

impl RuntimeContext {
    pub fn new(
        settings: Settings,
        recognizer: Arc<dyn TextRecognizer>,
        timeline: Arc<Timeline>,
    ) -> Result<Self> {
        let calibrator = Arc::new(AutoCalibrator::load(&settings, timeline.clone())?);
        let engine = DetectionEngine::new(recognizer, EngineTuning::from(&settings.tuning));
        let grid = GridState::new(settings.grid.samples.clone(), settings.grid.max_error_px);
        let tracker = TileTracker::new(TrackerTuning::from(&settings.tuning));
        let compass = OrientationNormalizer::new(settings.compass.clone());
        let anchor = WorldAnchor::new(settings.minimap.clone())?;

        Ok(Self {
            settings,
            engine,
            grid,
            tracker,
            compass,
            anchor,
            calibrator,
            timeline,
            pending_jobs: Vec::new(),
            detections_total: 0,
        })
    }

    /// Compass correction and world anchor refresh for this frame.
    pub fn navigate(&mut self, frame: &Frame, phase: Phase) -> NavigationStep {
        let now = frame.timestamp;
        let mut step = NavigationStep::default();

        if self.compass.enabled() {
            let outcome = self.compass.sample_and_align(frame, now);
            if let Some(correction) = outcome.correction {
                let angle = outcome.state.angle_deg.unwrap_or_default();
                self.timeline.push(
                    TelemetryEvent::new(now, Some(phase), EventKind::Calibration, ALIGN_LABEL)
                        .note(format!("{:.1} deg", angle)),
                );
                step.inputs.push(correction);
            }
            if outcome.drift_started {
                self.grid.invalidate("compass drift");
                self.tracker.clear();
                self.anchor.request();
            }
        }
        step.compass = self.compass.state();

        if self.anchor.enabled() {
            let player = self.grid.current().map(|g| self.player_tile(g, frame));
            step.world_tile =
                self.anchor
                    .maybe_refresh(frame, now, &self.engine, player, &mut step.inputs);
        }

        step
    }

    /// The grid for this frame, or `None` while tile-dependent decisions are
    /// off: no samples, a failed fit, or compass drift.
    pub fn active_grid(&mut self, width: u32, height: u32) -> Option<TileGrid> {
        if self.compass.state().drift_flag {
            return None;
        }
        self.grid.ensure(width, height).copied()
    }

    pub fn player_tile(&self, grid: &TileGrid, frame: &Frame) -> TileCoord {
        grid.player_tile(frame.width(), frame.height(), self.settings.grid.player_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_data::GridSample;
    use bs_vision::testing::GlyphRecognizer;
    use image::RgbaImage;

    fn context(dir: &std::path::Path, settings: Settings) -> RuntimeContext {
        let settings = Settings {
            data_dir: dir.to_path_buf(),
            ..settings
        };
        RuntimeContext::new(settings, Arc::new(GlyphRecognizer::new()), Arc::new(Timeline::default()))
            .unwrap()
    }

    #[test]
    fn test_grid_off_without_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Settings::default());
        assert!(ctx.active_grid(400, 300).is_none());
    }

    #[test]
    fn test_grid_from_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.grid.samples = vec![
            GridSample { x: 0.0, y: 0.0, row: 0, col: 0 },
            GridSample { x: 0.5, y: 0.0, row: 0, col: 5 },
            GridSample { x: 0.0, y: 0.8, row: 6, col: 0 },
            GridSample { x: 0.5, y: 0.8, row: 6, col: 5 },
        ];
        let mut ctx = context(dir.path(), settings);
        let grid = ctx.active_grid(400, 300).unwrap();
        assert!((grid.tile_size - 40.0).abs() < 1e-6);

        let frame = Frame::new(RgbaImage::new(400, 300), (0, 0), 0.0);
        assert_eq!(ctx.player_tile(&grid, &frame), TileCoord::new(3, 5));
    }

    #[test]
    fn test_navigation_disabled_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Settings::default());
        let frame = Frame::new(RgbaImage::new(400, 300), (0, 0), 0.0);
        let step = ctx.navigate(&frame, Phase::Scan);
        assert!(step.inputs.is_empty());
        assert!(step.world_tile.is_none());
        assert_eq!(step.compass, CompassState::default());
    }
}
