use anyhow::{Context, Result};
use bs_capture::Frame;
use bs_data::MinimapSettings;
use bs_vision::{Charset, DetectionEngine};
use bs_world::{TileCoord, WorldOffset, WorldTile};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::input::PlannedInput;

#[derive(Debug, Clone, Copy, PartialEq)]
enum AnchorPhase {
    Idle,
    /// Toggle pressed at `since`, waiting for the coordinates to render
    Opening { since: f64 },
}

/// Periodically reads the absolute player tile off the minimap and keeps the
/// world-to-local offset. Runs as a step of the decision cycle; the surface
/// delay is observed across cycles rather than by sleeping.
#[derive(Debug)]
pub struct WorldAnchor {
    settings: MinimapSettings,
    phase: AnchorPhase,
    last_refresh: Option<f64>,
    requested: bool,
    world_tile: Option<WorldTile>,
    offset: Option<WorldOffset>,
    numbers: Regex,
}

impl WorldAnchor {
    pub fn new(settings: MinimapSettings) -> Result<Self> {
        Ok(Self {
            settings,
            phase: AnchorPhase::Idle,
            last_refresh: None,
            requested: false,
            world_tile: None,
            offset: None,
            numbers: Regex::new(r"-?\d+").context("Failed to build coordinate pattern")?,
        })
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Refresh on the next cycle regardless of the interval.
    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn world_tile(&self) -> Option<WorldTile> {
        self.world_tile
    }

    pub fn offset(&self) -> Option<WorldOffset> {
        self.offset
    }

    fn due(&self, now: f64) -> bool {
        self.requested
            || self
                .last_refresh
                .map_or(true, |t| now - t >= self.settings.interval_s)
    }

    fn toggle(&self, label: &str) -> PlannedInput {
        PlannedInput::Key {
            key: self.settings.toggle_key.clone(),
            hold_s: 0.0,
            label: label.to_string(),
        }
    }

    /// Advance the refresh. Toggle presses are appended to `inputs`.
    /// Returns the tile when a reading landed this cycle.
    pub fn maybe_refresh(
        &mut self,
        frame: &Frame,
        now: f64,
        engine: &DetectionEngine,
        player: Option<TileCoord>,
        inputs: &mut Vec<PlannedInput>,
    ) -> Option<WorldTile> {
        if !self.settings.enabled {
            return None;
        }

        match self.phase {
            AnchorPhase::Idle => {
                if !self.due(now) {
                    return None;
                }
                self.requested = false;
                // A surface someone already opened reads straight away
                if let Some(tile) = self.read(frame, engine) {
                    debug!("Minimap already open");
                    self.store(tile, player, now);
                    inputs.push(self.toggle("minimap_close"));
                    return Some(tile);
                }
                inputs.push(self.toggle("minimap_open"));
                self.phase = AnchorPhase::Opening { since: now };
                None
            }
            AnchorPhase::Opening { since } => {
                let elapsed = now - since;
                if elapsed < self.settings.open_delay_s {
                    return None;
                }
                if let Some(tile) = self.read(frame, engine) {
                    self.store(tile, player, now);
                    inputs.push(self.toggle("minimap_close"));
                    self.phase = AnchorPhase::Idle;
                    return Some(tile);
                }
                if elapsed >= self.settings.open_delay_s + self.settings.read_timeout_s {
                    warn!("Minimap coordinates unreadable after {:.1}s, giving up", elapsed);
                    inputs.push(self.toggle("minimap_close"));
                    self.phase = AnchorPhase::Idle;
                    self.last_refresh = Some(now);
                }
                None
            }
        }
    }

    fn read(&self, frame: &Frame, engine: &DetectionEngine) -> Option<WorldTile> {
        let rect = self
            .settings
            .coords_roi
            .to_rect(frame.width(), frame.height());
        let text = engine
            .read_words(frame, rect, Charset::Coordinates)
            .into_iter()
            .map(|w| w.text)
            .collect::<Vec<_>>()
            .join(" ");
        self.parse(&text)
    }

    /// First two integers are the world (x, y).
    fn parse(&self, text: &str) -> Option<WorldTile> {
        let mut values = self
            .numbers
            .find_iter(text)
            .filter_map(|m| m.as_str().parse::<i32>().ok());
        let x = values.next()?;
        let y = values.next()?;
        Some(WorldTile { x, y })
    }

    fn store(&mut self, tile: WorldTile, player: Option<TileCoord>, now: f64) {
        self.world_tile = Some(tile);
        self.last_refresh = Some(now);
        if let Some(local) = player {
            self.offset = Some(WorldOffset::between(tile, local));
        }
        info!(
            "World anchor at ({}, {}), offset {:?}",
            tile.x, tile.y, self.offset
        );
    }
}
