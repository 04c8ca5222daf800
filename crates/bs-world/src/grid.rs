use anyhow::{bail, Result};
use bs_capture::Rect;
use bs_data::GridSample;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Grid cell address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub row: i32,
    pub col: i32,
}

impl TileCoord {
    pub fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    pub fn chebyshev(&self, other: &TileCoord) -> i32 {
        (self.row - other.row).abs().max((self.col - other.col).abs())
    }

    /// Same tile or one king-move away.
    pub fn is_adjacent(&self, other: &TileCoord) -> bool {
        self.chebyshev(other) <= 1
    }

    /// One king-move from `self` towards `target`.
    pub fn step_toward(&self, target: &TileCoord) -> TileCoord {
        TileCoord::new(
            self.row + (target.row - self.row).signum(),
            self.col + (target.col - self.col).signum(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn distance(&self, other: &PixelPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl PixelRect {
    pub fn center(&self) -> PixelPoint {
        PixelPoint::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.x.round() as i32,
            self.y.round() as i32,
            self.w.round() as i32,
            self.h.round() as i32,
        )
    }
}

/// A pixel position known to be the top-left corner of `tile`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub pixel: PixelPoint,
    pub tile: TileCoord,
}

/// Rectangle anchored to a tile centre, in tile units
#[derive(Debug, Clone, Copy, PartialEq)]
struct TileOffsetRect {
    dx: f64,
    dy: f64,
    w: f64,
    h: f64,
}

/// Floating action label above the tile
const HOVER_LABEL: TileOffsetRect = TileOffsetRect {
    dx: -0.6,
    dy: -1.2,
    w: 1.2,
    h: 0.6,
};

/// Right-click menu opening to the right of the tile
const CONTEXT_MENU: TileOffsetRect = TileOffsetRect {
    dx: 0.5,
    dy: -0.75,
    w: 1.4,
    h: 1.7,
};

/// Similarity transform from (col, row) grid space to frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileGrid {
    /// Pixel position of the top-left corner of tile (0, 0)
    pub origin: PixelPoint,
    pub tile_size: f64,
    /// Clockwise rotation of the grid's column axis, degrees
    pub rotation_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridFit {
    pub grid: TileGrid,
    /// Mean distance between samples and their fitted corners
    pub mean_error_px: f64,
    /// Mean distance of each sample from a grid fitted without it.
    /// `None` below 3 samples.
    pub holdout_error_px: Option<f64>,
}

impl GridFit {
    /// Error the fit is judged by: held-out when available.
    pub fn acceptance_error(&self) -> f64 {
        self.holdout_error_px.unwrap_or(self.mean_error_px)
    }
}

impl TileGrid {
    pub fn axis_aligned(origin: PixelPoint, tile_size: f64) -> Self {
        Self {
            origin,
            tile_size,
            rotation_deg: 0.0,
        }
    }

    /// Least-squares similarity fit (scale, rotation, translation) of the samples.
    pub fn calibrate(samples: &[CalibrationSample]) -> Result<GridFit> {
        let grid = Self::fit_similarity(samples)?;
        Ok(GridFit {
            grid,
            mean_error_px: grid.mean_error(samples),
            holdout_error_px: Self::holdout_error(samples),
        })
    }

    fn fit_similarity(samples: &[CalibrationSample]) -> Result<TileGrid> {
        if samples.len() < 2 {
            bail!("Grid calibration needs at least 2 samples, got {}", samples.len());
        }
        let n = samples.len() as f64;
        let (qx, qy) = samples.iter().fold((0.0, 0.0), |acc, s| {
            (acc.0 + s.tile.col as f64, acc.1 + s.tile.row as f64)
        });
        let (px, py) = samples
            .iter()
            .fold((0.0, 0.0), |acc, s| (acc.0 + s.pixel.x, acc.1 + s.pixel.y));
        let (qx, qy, px, py) = (qx / n, qy / n, px / n, py / n);

        let (mut a, mut b, mut spread) = (0.0, 0.0, 0.0);
        for s in samples {
            let (ux, uy) = (s.tile.col as f64 - qx, s.tile.row as f64 - qy);
            let (vx, vy) = (s.pixel.x - px, s.pixel.y - py);
            a += ux * vx + uy * vy;
            b += ux * vy - uy * vx;
            spread += ux * ux + uy * uy;
        }
        if spread == 0.0 {
            bail!("Grid calibration samples all name the same tile");
        }
        let theta = b.atan2(a);
        let scale = (a * a + b * b).sqrt() / spread;
        if scale < 1.0 {
            bail!("Grid calibration produced a degenerate tile size {:.3}", scale);
        }

        let (sin, cos) = theta.sin_cos();
        let origin = PixelPoint::new(
            px - scale * (cos * qx - sin * qy),
            py - scale * (sin * qx + cos * qy),
        );
        Ok(TileGrid {
            origin,
            tile_size: scale,
            rotation_deg: theta.to_degrees(),
        })
    }

    /// Leave-one-out error: refit without each sample and measure how far
    /// the refit puts it. Refits that cannot be solved are skipped.
    pub fn holdout_error(samples: &[CalibrationSample]) -> Option<f64> {
        if samples.len() < 3 {
            return None;
        }
        let mut errors = Vec::with_capacity(samples.len());
        let mut rest = Vec::with_capacity(samples.len() - 1);
        for (i, held) in samples.iter().enumerate() {
            rest.clear();
            rest.extend(samples.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, s)| *s));
            if let Ok(grid) = Self::fit_similarity(&rest) {
                errors.push(grid.mean_error(std::slice::from_ref(held)));
            }
        }
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }

    /// Mean pixel distance between samples and where the grid puts their corners.
    pub fn mean_error(&self, samples: &[CalibrationSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples
            .iter()
            .map(|s| {
                self.grid_to_pixel(s.tile.row as f64, s.tile.col as f64)
                    .distance(&s.pixel)
            })
            .sum::<f64>()
            / samples.len() as f64
    }

    fn grid_to_pixel(&self, row: f64, col: f64) -> PixelPoint {
        let (sin, cos) = self.rotation_deg.to_radians().sin_cos();
        PixelPoint::new(
            self.origin.x + self.tile_size * (cos * col - sin * row),
            self.origin.y + self.tile_size * (sin * col + cos * row),
        )
    }

    /// Continuous (row, col) of a pixel.
    fn pixel_to_grid(&self, p: PixelPoint) -> (f64, f64) {
        let (sin, cos) = self.rotation_deg.to_radians().sin_cos();
        let (dx, dy) = (p.x - self.origin.x, p.y - self.origin.y);
        let col = (cos * dx + sin * dy) / self.tile_size;
        let row = (-sin * dx + cos * dy) / self.tile_size;
        (row, col)
    }

    pub fn to_tile(&self, p: PixelPoint) -> TileCoord {
        let (row, col) = self.pixel_to_grid(p);
        TileCoord::new(row.floor() as i32, col.floor() as i32)
    }

    /// Pixel bounds of a tile cell (the bounding box when the grid is rotated).
    pub fn to_pixel(&self, tile: TileCoord) -> PixelRect {
        let (r, c) = (tile.row as f64, tile.col as f64);
        let corners = [
            self.grid_to_pixel(r, c),
            self.grid_to_pixel(r, c + 1.0),
            self.grid_to_pixel(r + 1.0, c),
            self.grid_to_pixel(r + 1.0, c + 1.0),
        ];
        let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        PixelRect {
            x: min_x,
            y: min_y,
            w: max_x - min_x,
            h: max_y - min_y,
        }
    }

    pub fn tile_center(&self, tile: TileCoord) -> PixelPoint {
        self.grid_to_pixel(tile.row as f64 + 0.5, tile.col as f64 + 0.5)
    }

    fn anchored(&self, tile: TileCoord, offset: TileOffsetRect) -> Rect {
        let c = self.tile_center(tile);
        let s = self.tile_size;
        PixelRect {
            x: c.x + offset.dx * s,
            y: c.y + offset.dy * s,
            w: offset.w * s,
            h: offset.h * s,
        }
        .to_rect()
    }

    /// Where the floating action label appears when the pointer rests on `tile`.
    pub fn hover_label_rect(&self, tile: TileCoord) -> Rect {
        self.anchored(tile, HOVER_LABEL)
    }

    /// Where the context menu for `tile` opens.
    pub fn context_menu_rect(&self, tile: TileCoord) -> Rect {
        self.anchored(tile, CONTEXT_MENU)
    }

    /// Tile under `point` (fractions of a `width` x `height` frame).
    pub fn player_tile(&self, width: u32, height: u32, point: (f64, f64)) -> TileCoord {
        self.to_tile(PixelPoint::new(
            point.0 * width as f64,
            point.1 * height as f64,
        ))
    }
}

/// The grid in use for the current frame geometry. Recalibrates from the
/// configured samples on first use, after invalidation, and on frame size changes.
#[derive(Debug, Clone)]
pub struct GridState {
    samples: Vec<GridSample>,
    max_error_px: f64,
    grid: Option<TileGrid>,
    fit_error: Option<f64>,
    frame_size: Option<(u32, u32)>,
    failed_size: Option<(u32, u32)>,
}

impl GridState {
    pub fn new(samples: Vec<GridSample>, max_error_px: f64) -> Self {
        Self {
            samples,
            max_error_px,
            grid: None,
            fit_error: None,
            frame_size: None,
            failed_size: None,
        }
    }

    /// No samples means tile tracking is off.
    pub fn is_configured(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn current(&self) -> Option<&TileGrid> {
        self.grid.as_ref()
    }

    pub fn fit_error(&self) -> Option<f64> {
        self.fit_error
    }

    pub fn invalidate(&mut self, reason: &str) {
        if self.grid.is_some() {
            info!("Tile grid invalidated: {}", reason);
        }
        self.grid = None;
        self.fit_error = None;
        self.frame_size = None;
        self.failed_size = None;
    }

    /// Grid for a `width` x `height` frame, recalibrating when needed.
    pub fn ensure(&mut self, width: u32, height: u32) -> Option<&TileGrid> {
        if !self.is_configured() {
            return None;
        }
        let size = (width, height);
        if self.grid.is_some() && self.frame_size == Some(size) {
            return self.grid.as_ref();
        }
        if self.failed_size == Some(size) {
            return None;
        }
        if self.frame_size.is_some_and(|s| s != size) {
            info!("Frame size changed to {}x{}, recalibrating tile grid", width, height);
        }

        let samples: Vec<CalibrationSample> = self
            .samples
            .iter()
            .map(|s| CalibrationSample {
                pixel: PixelPoint::new(s.x * width as f64, s.y * height as f64),
                tile: TileCoord::new(s.row, s.col),
            })
            .collect();

        match TileGrid::calibrate(&samples) {
            Ok(fit) if fit.acceptance_error() <= self.max_error_px => {
                info!(
                    "Tile grid calibrated: tile {:.1}px, rotation {:.2} deg, error {:.3}px (held-out {:.3}px)",
                    fit.grid.tile_size,
                    fit.grid.rotation_deg,
                    fit.mean_error_px,
                    fit.acceptance_error()
                );
                self.grid = Some(fit.grid);
                self.fit_error = Some(fit.acceptance_error());
                self.frame_size = Some(size);
                self.failed_size = None;
            }
            Ok(fit) => {
                warn!(
                    "Tile grid held-out error {:.2}px exceeds {:.2}px, tile tracking off",
                    fit.acceptance_error(),
                    self.max_error_px
                );
                self.grid = None;
                self.failed_size = Some(size);
            }
            Err(e) => {
                warn!("Tile grid calibration failed: {:#}", e);
                self.grid = None;
                self.failed_size = Some(size);
            }
        }
        self.grid.as_ref()
    }
}
