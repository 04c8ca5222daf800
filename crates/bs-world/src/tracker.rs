use crate::grid::TileCoord;
use bs_data::Tuning;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerTuning {
    /// Unobserved tracks live this long on prediction
    pub grace_s: f64,
    /// Grace for the locked track
    pub lock_grace_s: f64,
    /// Weight of the previous velocity in the moving average, 0.0-1.0
    pub velocity_decay: f64,
}

impl Default for TrackerTuning {
    fn default() -> Self {
        Self::from(&Tuning::default())
    }
}

impl From<&Tuning> for TrackerTuning {
    fn from(t: &Tuning) -> Self {
        Self {
            grace_s: t.track_grace_s,
            lock_grace_s: t.lock_grace_s,
            velocity_decay: t.velocity_decay,
        }
    }
}

/// A target detection projected onto the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub tile: TileCoord,
    pub score: f64,
}

/// One tracked target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTrack {
    pub id: u64,
    pub row: i32,
    pub col: i32,
    /// Tiles per second
    pub velocity_row: f64,
    pub velocity_col: f64,
    pub last_seen_ts: f64,
    pub hover_confirmed: bool,
    pub prediction_expiry_ts: f64,
    /// Last observed position, the base for extrapolation
    #[serde(skip)]
    observed: TileCoord,
}

impl TileTrack {
    pub fn tile(&self) -> TileCoord {
        TileCoord::new(self.row, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveEvent {
    pub track_id: u64,
    pub from: TileCoord,
    pub to: TileCoord,
    /// Moved by extrapolation rather than an observation
    pub predicted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    pub tracks: Vec<TileTrack>,
    pub moves: Vec<MoveEvent>,
    pub spawned: Vec<u64>,
    pub dropped: Vec<u64>,
}

/// Keeps one track per target across frames. Positions change by at most
/// one king-move per update; farther observations start new tracks.
#[derive(Debug, Clone)]
pub struct TileTracker {
    tuning: TrackerTuning,
    tracks: Vec<TileTrack>,
    next_id: u64,
    locked: Option<u64>,
}

impl TileTracker {
    pub fn new(tuning: TrackerTuning) -> Self {
        Self {
            tuning,
            tracks: Vec::new(),
            next_id: 1,
            locked: None,
        }
    }

    pub fn tracks(&self) -> &[TileTrack] {
        &self.tracks
    }

    pub fn get(&self, id: u64) -> Option<&TileTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn locked_id(&self) -> Option<u64> {
        self.locked
    }

    pub fn locked(&self) -> Option<&TileTrack> {
        self.locked.and_then(|id| self.get(id))
    }

    /// Make `id` the interaction target, replacing any previous lock.
    /// The previous target drops back to the normal grace.
    pub fn lock(&mut self, id: u64) -> bool {
        if !self.tracks.iter().any(|t| t.id == id) {
            return false;
        }
        if self.locked != Some(id) {
            self.unlock();
        }
        let grace = self.tuning.lock_grace_s;
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(track) => {
                track.prediction_expiry_ts = track.last_seen_ts + grace;
                self.locked = Some(id);
                debug!("Track {} locked", id);
                true
            }
            None => false,
        }
    }

    pub fn unlock(&mut self) {
        if let Some(id) = self.locked.take() {
            let grace = self.tuning.grace_s;
            if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
                track.prediction_expiry_ts = track.last_seen_ts + grace;
            }
        }
    }

    pub fn set_hover_confirmed(&mut self, id: u64, confirmed: bool) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
            track.hover_confirmed = confirmed;
        }
    }

    /// Track nearest to `tile` within one king-move.
    pub fn nearest(&self, tile: &TileCoord) -> Option<&TileTrack> {
        self.tracks
            .iter()
            .filter(|t| t.tile().chebyshev(tile) <= 1)
            .min_by_key(|t| (t.tile().chebyshev(tile), t.id))
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.locked = None;
    }

    fn grace_for(&self, id: u64) -> f64 {
        if self.locked == Some(id) {
            self.tuning.lock_grace_s
        } else {
            self.tuning.grace_s
        }
    }

    pub fn update(&mut self, observations: &[Observation], now: f64) -> TrackerUpdate {
        let mut update = TrackerUpdate::default();

        // Expired tracks go first so they cannot claim an observation
        let locked = self.locked;
        self.tracks.retain(|t| {
            let keep = now <= t.prediction_expiry_ts;
            if !keep {
                update.dropped.push(t.id);
            }
            keep
        });
        if let Some(id) = locked {
            if update.dropped.contains(&id) {
                debug!("Locked track {} expired", id);
                self.locked = None;
            }
        }

        let mut order: Vec<usize> = (0..observations.len()).collect();
        order.sort_by(|&a, &b| {
            observations[b]
                .score
                .partial_cmp(&observations[a].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut claimed = vec![false; self.tracks.len()];
        let mut fresh: Vec<TileCoord> = Vec::new();
        for idx in order {
            let obs = observations[idx];
            let candidate = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, t)| !claimed[*i] && t.tile().chebyshev(&obs.tile) <= 1)
                .min_by_key(|(_, t)| {
                    let dr = (t.row - obs.tile.row) as i64;
                    let dc = (t.col - obs.tile.col) as i64;
                    (t.tile().chebyshev(&obs.tile), dr * dr + dc * dc, t.id)
                })
                .map(|(i, _)| i);

            match candidate {
                Some(i) => {
                    claimed[i] = true;
                    let grace = self.grace_for(self.tracks[i].id);
                    let decay = self.tuning.velocity_decay;
                    let track = &mut self.tracks[i];
                    let dt = (now - track.last_seen_ts).max(1e-3);
                    let inst_row = (obs.tile.row - track.observed.row) as f64 / dt;
                    let inst_col = (obs.tile.col - track.observed.col) as f64 / dt;
                    track.velocity_row = decay * track.velocity_row + (1.0 - decay) * inst_row;
                    track.velocity_col = decay * track.velocity_col + (1.0 - decay) * inst_col;

                    let from = track.tile();
                    if from != obs.tile {
                        update.moves.push(MoveEvent {
                            track_id: track.id,
                            from,
                            to: obs.tile,
                            predicted: false,
                        });
                    }
                    track.row = obs.tile.row;
                    track.col = obs.tile.col;
                    track.observed = obs.tile;
                    track.last_seen_ts = now;
                    track.prediction_expiry_ts = now + grace;
                }
                None => fresh.push(obs.tile),
            }
        }

        // Unmatched tracks coast on their velocity, one king-move per update at most
        for (i, track) in self.tracks.iter_mut().enumerate() {
            if claimed[i] {
                continue;
            }
            let elapsed = now - track.last_seen_ts;
            let target = TileCoord::new(
                (track.observed.row as f64 + track.velocity_row * elapsed).round() as i32,
                (track.observed.col as f64 + track.velocity_col * elapsed).round() as i32,
            );
            let from = track.tile();
            let to = from.step_toward(&target);
            if to != from {
                track.row = to.row;
                track.col = to.col;
                update.moves.push(MoveEvent {
                    track_id: track.id,
                    from,
                    to,
                    predicted: true,
                });
            }
        }

        for tile in fresh {
            // two observations on one tile in a frame make one track
            if self.tracks.iter().any(|t| t.last_seen_ts == now && t.tile() == tile) {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(TileTrack {
                id,
                row: tile.row,
                col: tile.col,
                velocity_row: 0.0,
                velocity_col: 0.0,
                last_seen_ts: now,
                hover_confirmed: false,
                prediction_expiry_ts: now + self.tuning.grace_s,
                observed: tile,
            });
            update.spawned.push(id);
        }

        for m in &update.moves {
            debug!(
                "Track {} moved ({}, {}) -> ({}, {}){}",
                m.track_id,
                m.from.row,
                m.from.col,
                m.to.row,
                m.to.col,
                if m.predicted { " [predicted]" } else { "" }
            );
        }
        update.tracks = self.tracks.clone();
        update
    }
}
