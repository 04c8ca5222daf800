use bs_capture::{crop_region, Frame};
use bs_data::CompassSettings;
use bs_vision::NeedleEstimator;
use bs_world::CompassState;
use tracing::{debug, info, warn};

use crate::input::PlannedInput;

pub const ALIGN_LABEL: &str = "compass_align";

#[derive(Debug, Clone, PartialEq)]
pub struct AlignOutcome {
    pub state: CompassState,
    /// At most one rotation per cycle
    pub correction: Option<PlannedInput>,
    /// The drift flag was raised this cycle
    pub drift_started: bool,
}

/// Keeps the view north-up. Owns the compass state; nothing else writes it.
#[derive(Debug, Clone)]
pub struct OrientationNormalizer {
    settings: CompassSettings,
    estimator: NeedleEstimator,
    state: CompassState,
    aligned: bool,
    unconverged: u32,
}

impl OrientationNormalizer {
    pub fn new(settings: CompassSettings) -> Self {
        let estimator = NeedleEstimator::new(settings.min_needle_area);
        Self {
            settings,
            estimator,
            state: CompassState::default(),
            aligned: false,
            unconverged: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn state(&self) -> CompassState {
        self.state
    }

    pub fn sample_and_align(&mut self, frame: &Frame, now: f64) -> AlignOutcome {
        let crop = crop_region(&frame.image, &self.settings.roi);
        let mut outcome = AlignOutcome {
            state: self.state,
            correction: None,
            drift_started: false,
        };

        let angle = match self.estimator.estimate(&crop) {
            Some(a) => a,
            None => {
                // An unreadable needle counts as a cycle without convergence
                debug!("Compass needle not found");
                self.state.angle_deg = None;
                self.aligned = false;
                self.count_unconverged(&mut outcome, "needle unreadable");
                outcome.state = self.state;
                return outcome;
            }
        };
        self.state.angle_deg = Some(angle);

        // Hysteresis: tight tolerance to become aligned, looser to stay aligned
        let tolerance = if self.aligned {
            self.settings.drift_tolerance_deg
        } else {
            self.settings.align_tolerance_deg
        };

        if angle.abs() <= tolerance {
            self.aligned = true;
            self.unconverged = 0;
            self.state.last_aligned_ts = Some(now);
            if self.state.drift_flag {
                self.state.drift_flag = false;
                info!("Compass converged at {:.1} deg, drift cleared", angle);
            }
        } else {
            self.aligned = false;
            let key = if angle > 0.0 { "left" } else { "right" };
            let hold = (angle.abs() / self.settings.rotation_rate_deg_s.max(1.0))
                .max(self.settings.min_hold_s)
                .min(self.settings.max_hold_s);
            debug!("Compass at {:.1} deg, rotating {} for {:.2}s", angle, key, hold);
            outcome.correction = Some(PlannedInput::Key {
                key: key.to_string(),
                hold_s: hold,
                label: ALIGN_LABEL.to_string(),
            });

            self.count_unconverged(&mut outcome, &format!("{:.1} deg", angle));
        }

        outcome.state = self.state;
        outcome
    }

    fn count_unconverged(&mut self, outcome: &mut AlignOutcome, detail: &str) {
        self.unconverged += 1;
        if self.unconverged >= self.settings.max_unconverged && !self.state.drift_flag {
            self.state.drift_flag = true;
            outcome.drift_started = true;
            warn!(
                "Compass not converged after {} cycles ({}), drift flagged",
                self.unconverged, detail
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_capture::ScreenRegion;
    use image::{Rgba, RgbaImage};

    const NEEDLE_RED: Rgba<u8> = Rgba([230, 25, 25, 255]);

    fn dial(angle_deg: f64) -> Frame {
        let mut img = RgbaImage::from_pixel(80, 80, Rgba([20, 20, 30, 255]));
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let (ux, uy) = (sin, -cos);
        for step in -8..=30 {
            let t = step as f64;
            let half = if step < 0 { 4.0 } else { 4.0 * (1.0 - t / 34.0) };
            let mut s = -half;
            while s <= half {
                let x = 40.0 + ux * t - uy * s;
                let y = 40.0 + uy * t + ux * s;
                img.put_pixel(x.round() as u32, y.round() as u32, NEEDLE_RED);
                s += 0.5;
            }
        }
        Frame::new(img, (0, 0), 0.0)
    }

    fn normalizer() -> OrientationNormalizer {
        OrientationNormalizer::new(CompassSettings {
            enabled: true,
            roi: ScreenRegion::FULL,
            ..Default::default()
        })
    }

    fn key_of(outcome: &AlignOutcome) -> Option<(String, f64)> {
        match &outcome.correction {
            Some(PlannedInput::Key { key, hold_s, .. }) => Some((key.clone(), *hold_s)),
            _ => None,
        }
    }

    #[test]
    fn test_aligned_needle_needs_no_input() {
        let mut n = normalizer();
        let out = n.sample_and_align(&dial(0.0), 3.0);
        assert!(out.correction.is_none());
        assert_eq!(out.state.last_aligned_ts, Some(3.0));
        assert_eq!(out.state.staleness(4.5), Some(1.5));
    }

    #[test]
    fn test_correction_direction_and_hold() {
        let mut n = normalizer();
        let (key, hold) = key_of(&n.sample_and_align(&dial(30.0), 0.0)).unwrap();
        assert_eq!(key, "left");
        assert!(hold > 0.16 && hold < 0.35, "hold {}", hold);

        let (key, hold) = key_of(&n.sample_and_align(&dial(-120.0), 0.1)).unwrap();
        assert_eq!(key, "right");
        assert!((hold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_hysteresis() {
        let wide = || {
            OrientationNormalizer::new(CompassSettings {
                enabled: true,
                roi: ScreenRegion::FULL,
                drift_tolerance_deg: 20.0,
                ..Default::default()
            })
        };
        let mut fresh = wide();
        assert!(fresh.sample_and_align(&dial(12.0), 0.0).correction.is_some());

        let mut n = wide();
        n.sample_and_align(&dial(0.0), 0.0);
        // inside the drift tolerance once aligned
        assert!(n.sample_and_align(&dial(12.0), 0.1).correction.is_none());
        assert!(n.sample_and_align(&dial(45.0), 0.2).correction.is_some());
    }

    #[test]
    fn test_drift_flag_after_unconverged_cycles() {
        let mut n = normalizer();
        let mut started = 0;
        for i in 0..8 {
            let out = n.sample_and_align(&dial(90.0), i as f64 * 0.1);
            if out.drift_started {
                started += 1;
                assert_eq!(i, 4);
            }
        }
        assert_eq!(started, 1);
        assert!(n.state().drift_flag);

        let out = n.sample_and_align(&dial(0.0), 1.0);
        assert!(!out.state.drift_flag);
    }

    #[test]
    fn test_missing_needle_clears_angle() {
        let mut n = normalizer();
        n.sample_and_align(&dial(20.0), 0.0);
        let blank = Frame::new(RgbaImage::from_pixel(80, 80, Rgba([20, 20, 30, 255])), (0, 0), 0.1);
        let out = n.sample_and_align(&blank, 0.1);
        assert_eq!(out.state.angle_deg, None);
        assert!(out.correction.is_none());
    }

    #[test]
    fn test_unreadable_needle_counts_toward_drift() {
        let mut n = normalizer();
        let blank = Frame::new(RgbaImage::from_pixel(80, 80, Rgba([20, 20, 30, 255])), (0, 0), 0.0);
        let mut started = Vec::new();
        for i in 0..6 {
            let out = n.sample_and_align(&blank, i as f64 * 0.1);
            assert!(out.correction.is_none());
            if out.drift_started {
                started.push(i);
            }
        }
        assert_eq!(started, vec![4]);
        assert!(n.state().drift_flag);

        // a readable, aligned needle clears it
        assert!(!n.sample_and_align(&dial(0.0), 1.0).state.drift_flag);
    }
}
