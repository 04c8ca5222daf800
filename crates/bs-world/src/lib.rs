use serde::{Deserialize, Serialize};

pub mod grid;
pub mod tracker;

pub use grid::{CalibrationSample, GridFit, GridState, PixelPoint, PixelRect, TileCoord, TileGrid};
pub use tracker::{MoveEvent, Observation, TileTrack, TileTracker, TrackerTuning, TrackerUpdate};

/// Last known compass reading. Only the orientation normalizer writes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompassState {
    /// Needle angle, 0 = north, positive = clockwise. `None` before the first reading.
    pub angle_deg: Option<f64>,
    pub last_aligned_ts: Option<f64>,
    /// Alignment has not converged; tile-dependent decisions are suspended.
    pub drift_flag: bool,
}

impl CompassState {
    /// Seconds since the view was last confirmed north-aligned.
    pub fn staleness(&self, now: f64) -> Option<f64> {
        self.last_aligned_ts.map(|t| (now - t).max(0.0))
    }
}

/// Absolute tile position, as read from the minimap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTile {
    pub x: i32,
    pub y: i32,
}

/// World tile minus local grid tile (x pairs with col, y with row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldOffset {
    pub dx: i32,
    pub dy: i32,
}

impl WorldOffset {
    pub fn between(world: WorldTile, local: TileCoord) -> Self {
        Self {
            dx: world.x - local.col,
            dy: world.y - local.row,
        }
    }

    pub fn to_world(&self, local: TileCoord) -> WorldTile {
        WorldTile {
            x: local.col + self.dx,
            y: local.row + self.dy,
        }
    }
}
