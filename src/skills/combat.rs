//! The combat interaction: find a named target, prime it, open its context
//! menu, pick the weapon and watch the fight until it ends.

use anyhow::{Context, Result};
use bs_capture::{Frame, Rect};
use bs_data::Settings;
use bs_vision::{Charset, DetectedBy, Detection, DetectionBox, MethodHint, TargetSpec, Template};
use bs_world::{Observation, PixelPoint, TileGrid};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::phase::{Phase, PhaseInputs, PhaseMachine, PhaseStep};
use super::Skill;
use crate::calibration::Detector;
use crate::context::RuntimeContext;
use crate::input::PlannedInput;
use crate::status::{CategoryReport, CompassReport, CycleReport, TrackReport};
use crate::telemetry::{EventKind, TelemetryEvent};

const TARGET: &str = "target";
const PROMPT: &str = "prompt";
const PREPARE: &str = "prepare";
const WEAPON: &str = "weapon";
const BATTLE: &str = "battle";

const HOVER_LABEL: &str = "hover_label";
const HOVER_CHECK: &str = "hover_check";
/// The clickable body sits this many plate heights below the plate's top edge
const HITBOX_DROP: f64 = 1.4;

/// The target as seen this cycle
#[derive(Debug, Default)]
struct Sighting {
    report: CategoryReport,
    /// Region the interaction aims at: the best box, or the prefix+name union
    primary: Option<Rect>,
    /// Every qualifying plate, for the tracker
    plates: Vec<Rect>,
}

/// Whether the action prompt may be acted on, and where it must be
#[derive(Debug, Clone, Copy, PartialEq)]
struct Gate {
    trusted: bool,
    region: Option<Rect>,
}

impl Gate {
    fn open(region: Option<Rect>) -> Self {
        Self {
            trusted: true,
            region,
        }
    }

    fn closed(region: Option<Rect>) -> Self {
        Self {
            trusted: false,
            region,
        }
    }
}

pub struct CombatSkill {
    target_template: Option<Arc<Template>>,
    attack_template: Option<Arc<Template>>,
    machine: PhaseMachine,
    /// Prefix+name union kept through prefix flicker, valid until the timestamp
    box_lock: Option<(Rect, f64)>,
    /// Context menu the attack click went into
    menu_rect: Option<Rect>,
    last_hover_check: Option<f64>,
    history: BTreeMap<String, VecDeque<f64>>,
    last_found: BTreeMap<&'static str, bool>,
    last_log: Option<f64>,
}

impl Default for CombatSkill {
    fn default() -> Self {
        Self::new()
    }
}

impl CombatSkill {
    pub fn new() -> Self {
        let tuning = bs_data::Tuning::default();
        Self {
            target_template: None,
            attack_template: None,
            machine: PhaseMachine::new(tuning.reclick_interval_s, tuning.absence_limit),
            box_lock: None,
            menu_rect: None,
            last_hover_check: None,
            history: BTreeMap::new(),
            last_found: BTreeMap::new(),
            last_log: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    fn roi(settings_roi: Option<bs_capture::ScreenRegion>, frame: &Frame) -> Option<Rect> {
        settings_roi.map(|r| r.to_rect(frame.width(), frame.height()))
    }

    fn template_roi(ctx: &RuntimeContext, template: Option<&Arc<Template>>, frame: &Frame) -> Option<Rect> {
        template.and_then(|t| ctx.calibrator.active_roi(&t.id, frame.width(), frame.height()))
    }

    /// Feed the auto-calibrator: a template hit counts toward stability, a
    /// text fallback with a template configured is a disagreement.
    fn report_calibration(
        ctx: &mut RuntimeContext,
        detector: Detector,
        template: Option<&Arc<Template>>,
        det: &Detection,
        frame: &Frame,
        now: f64,
    ) {
        let template = match template {
            Some(t) => t,
            None => return,
        };
        match det.method {
            Some(DetectedBy::Template) => ctx.calibrator.report_hit(&template.id, now),
            Some(DetectedBy::TextFallback) => {
                if let Some(hint) = det.best() {
                    if let Some(job) =
                        ctx.calibrator
                            .report_disagreement(detector, template, frame, hint, now)
                    {
                        ctx.pending_jobs.push(job);
                    }
                }
            }
            _ => {}
        }
    }

    fn detect_target(&mut self, frame: &Frame, ctx: &mut RuntimeContext, now: f64) -> Sighting {
        let combat = &ctx.settings.combat;
        let roi = Self::roi(combat.nameplate_roi, frame);
        let spec = TargetSpec::text(TARGET, &combat.target_word)
            .with_template(self.target_template.clone())
            .with_roi(roi)
            .with_template_roi(Self::template_roi(ctx, self.target_template.as_ref(), frame));
        let det = ctx.engine.detect(frame, ctx.settings.detection.method, &spec);

        let prefix = combat
            .prefix_word
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| TargetSpec::text("target_prefix", p).with_roi(roi));
        let lock_grace = ctx.settings.tuning.box_lock_grace_s;

        let (primary, plates) = match prefix {
            Some(prefix_spec) => {
                let prefix_det = ctx.engine.detect(frame, MethodHint::Text, &prefix_spec);
                let primary = self.merge_prefix(&det, &prefix_det, now, lock_grace);
                (primary, primary.into_iter().collect())
            }
            None => (
                det.best().map(|b| b.rect()),
                det.boxes.iter().map(|b| b.rect()).collect(),
            ),
        };

        Self::report_calibration(ctx, Detector::Nameplate, self.target_template.as_ref(), &det, frame, now);

        let mut report = CategoryReport::from_detection(&det);
        report.found = primary.is_some();
        Sighting {
            report,
            primary,
            plates,
        }
    }

    /// Union of the name and its nearest prefix. The union is held for the
    /// lock grace so a flickering prefix does not drop the target.
    fn merge_prefix(&mut self, det: &Detection, prefix: &Detection, now: f64, grace: f64) -> Option<Rect> {
        if let Some(name) = det.best() {
            let (nx, ny) = name.center();
            let nearest = prefix.boxes.iter().min_by(|a, b| {
                let da = (a.center().0 - nx).powi(2) + (a.center().1 - ny).powi(2);
                let db = (b.center().0 - nx).powi(2) + (b.center().1 - ny).powi(2);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
            if let Some(p) = nearest {
                let union = name.rect().union(&p.rect());
                self.box_lock = Some((union, now + grace));
                return Some(union);
            }
        }

        match self.box_lock {
            Some((locked, until)) if now <= until => det
                .boxes
                .iter()
                .any(|b| b.rect().intersection(&locked).is_some())
                .then_some(locked),
            Some(_) => {
                self.box_lock = None;
                None
            }
            None => None,
        }
    }

    /// Project plates onto the grid, update tracks and lock the primary target.
    fn track(&mut self, grid: &TileGrid, sighting: &Sighting, ctx: &mut RuntimeContext, now: f64) {
        let observations: Vec<Observation> = sighting
            .plates
            .iter()
            .map(|r| Observation {
                tile: grid.to_tile(hitbox_point(r)),
                score: sighting.report.confidence,
            })
            .collect();
        let update = ctx.tracker.update(&observations, now);

        let locked = ctx.tracker.locked_id();
        for m in &update.moves {
            if Some(m.track_id) == locked {
                // the floating label moved with it
                ctx.tracker.set_hover_confirmed(m.track_id, false);
            }
        }

        if ctx.tracker.locked_id().is_none() {
            if let Some(primary) = sighting.primary {
                let tile = grid.to_tile(hitbox_point(&primary));
                if let Some(id) = ctx.tracker.nearest(&tile).map(|t| t.id) {
                    ctx.tracker.lock(id);
                }
            }
        }
    }

    /// The locked target must stand next to the player and show its floating
    /// action label under the pointer before its context menu may be used.
    fn hover_gate(
        &mut self,
        grid: &TileGrid,
        frame: &Frame,
        ctx: &mut RuntimeContext,
        inputs: &mut Vec<PlannedInput>,
        now: f64,
    ) -> Gate {
        let track = match ctx.tracker.locked() {
            Some(t) => t.clone(),
            None => return Gate::closed(None),
        };
        let tile = track.tile();
        let player = ctx.player_tile(grid, frame);
        if !tile.is_adjacent(&player) {
            debug!(
                "Locked track {} at ({}, {}) not adjacent to player ({}, {})",
                track.id, tile.row, tile.col, player.row, player.col
            );
            return Gate::closed(None);
        }

        let menu = grid.context_menu_rect(tile);
        if track.hover_confirmed {
            return Gate::open(Some(menu));
        }

        let hover = grid.hover_label_rect(tile);
        let word = ctx.settings.combat.hover_word().to_string();
        if let Some(b) = ctx.engine.confirm_word(frame, hover, &word) {
            ctx.tracker.set_hover_confirmed(track.id, true);
            ctx.timeline.push(
                TelemetryEvent::new(now, Some(self.machine.phase()), EventKind::Confirm, HOVER_LABEL)
                    .region(Some(hover))
                    .boxes(vec![b.rect()])
                    .confidence(b.score),
            );
            return Gate::open(Some(menu));
        }

        let check_due = self
            .last_hover_check
            .map_or(true, |t| now - t >= ctx.settings.tuning.hover_check_interval_s);
        if check_due {
            let (cx, cy) = hover.center();
            let (x, y) = frame.to_screen(cx.round() as i32, cy.round() as i32);
            inputs.push(PlannedInput::Move {
                x,
                y,
                label: HOVER_CHECK.to_string(),
            });
            self.last_hover_check = Some(now);
        }
        Gate::closed(Some(menu))
    }

    /// Attack prompt boxes, confined to `region` when one is given.
    fn detect_prompt(&self, frame: &Frame, ctx: &mut RuntimeContext, region: Option<Rect>, now: f64) -> (Vec<DetectionBox>, Option<DetectedBy>) {
        let combat = &ctx.settings.combat;
        let roi = region.or_else(|| Self::roi(combat.attack_roi, frame));
        let template_roi = match region {
            Some(_) => None,
            None => Self::template_roi(ctx, self.attack_template.as_ref(), frame),
        };
        let spec = TargetSpec::text(PROMPT, &combat.attack_word)
            .with_template(self.attack_template.clone())
            .with_roi(roi)
            .with_template_roi(template_roi);
        let det = ctx.engine.detect(frame, ctx.settings.detection.method, &spec);

        if region.is_none() {
            Self::report_calibration(ctx, Detector::Attack, self.attack_template.as_ref(), &det, frame, now);
        }

        let boxes = match region {
            Some(r) => det
                .boxes
                .iter()
                .filter(|b| r.contains_rect(&b.rect()))
                .cloned()
                .collect(),
            None => det.boxes.clone(),
        };
        (boxes, det.method)
    }

    fn detect_prepare(&self, frame: &Frame, ctx: &RuntimeContext) -> Detection {
        let combat = &ctx.settings.combat;
        let mut spec = TargetSpec::any_of(PREPARE, &combat.prepare_terms)
            .with_roi(Some(combat.prepare_roi.to_rect(frame.width(), frame.height())));
        spec.color_first = false;
        ctx.engine.detect(frame, MethodHint::Text, &spec)
    }

    fn detect_weapon(&self, frame: &Frame, ctx: &RuntimeContext) -> Detection {
        let combat = &ctx.settings.combat;
        let spec = TargetSpec::digits(WEAPON, &combat.weapon_digits)
            .with_roi(Some(combat.prepare_roi.to_rect(frame.width(), frame.height())));
        ctx.engine.detect(frame, MethodHint::Text, &spec)
    }

    /// The cue is every battle token present in the battle bar.
    fn detect_battle(&self, frame: &Frame, ctx: &RuntimeContext) -> CategoryReport {
        let combat = &ctx.settings.combat;
        let rect = combat.battle_roi.to_rect(frame.width(), frame.height());
        let words = ctx
            .engine
            .read_words(frame, rect, Charset::Letters);

        let mut boxes = Vec::new();
        let mut confidence = f64::MAX;
        for token in &combat.battle_tokens {
            let token = token.to_lowercase();
            match words
                .iter()
                .find(|w| w.text.to_lowercase().contains(&token))
            {
                Some(w) => {
                    boxes.push(w.rect);
                    confidence = confidence.min(w.confidence);
                }
                None => return CategoryReport::default(),
            }
        }
        if boxes.is_empty() {
            return CategoryReport::default();
        }
        CategoryReport {
            found: true,
            count: boxes.len(),
            confidence,
            method: Some(DetectedBy::Text),
            boxes,
        }
    }

    fn record_history(&mut self, category: &str, confidence: f64, len: usize) {
        let history = self.history.entry(category.to_string()).or_default();
        history.push_back(confidence);
        while history.len() > len.max(1) {
            history.pop_front();
        }
    }

    /// Detect events fire when a category appears or disappears.
    fn note_found(&mut self, ctx: &RuntimeContext, category: &'static str, report: &CategoryReport, now: f64) -> bool {
        let previous = self.last_found.insert(category, report.found);
        let flipped = previous.unwrap_or(false) != report.found;
        if flipped {
            let note = if report.found { "appeared" } else { "lost" };
            ctx.timeline.push(
                TelemetryEvent::new(now, Some(self.machine.phase()), EventKind::Detect, category)
                    .boxes(report.boxes.clone())
                    .confidence(report.confidence)
                    .note(note),
            );
        }
        flipped
    }

    fn emit_step(&self, ctx: &RuntimeContext, step: &PhaseStep, phase_before: Phase, now: f64) {
        for click in &step.clicks {
            ctx.timeline.push(
                TelemetryEvent::new(now, Some(phase_before), EventKind::Click, click.label.as_str())
                    .click(click.x, click.y),
            );
        }
        if let Some(t) = &step.transition {
            ctx.timeline.push(
                TelemetryEvent::new(now, Some(t.to), EventKind::Transition, format!("{:?}->{:?}", t.from, t.to))
                    .note(t.reason.as_str()),
            );
        }
    }
}

/// Where a plate's owner stands: centred under the plate.
fn hitbox_point(plate: &Rect) -> PixelPoint {
    PixelPoint::new(
        plate.x as f64 + plate.w as f64 / 2.0,
        plate.y as f64 + HITBOX_DROP * plate.h as f64,
    )
}

fn center_of(rect: &Rect) -> (i32, i32) {
    let (x, y) = rect.center();
    (x.round() as i32, y.round() as i32)
}

fn load_template(settings: &Settings, path: Option<&Path>, fallback_id: &str) -> Result<Option<Arc<Template>>> {
    let path = match path {
        Some(p) => settings.data_path(p),
        None => return Ok(None),
    };
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(fallback_id)
        .to_string();
    let template = Template::load(&path, &id)
        .with_context(|| format!("Failed to load {} template", fallback_id))?;
    info!("Loaded {} template '{}' ({}x{})", fallback_id, id, template.width(), template.height());
    Ok(Some(Arc::new(template)))
}

impl Skill for CombatSkill {
    fn name(&self) -> &str {
        "combat"
    }

    fn on_start(&mut self, ctx: &mut RuntimeContext) -> Result<()> {
        let detection = &ctx.settings.detection;
        self.target_template = load_template(&ctx.settings, detection.target_template.as_deref(), "nameplate")?;
        self.attack_template = load_template(&ctx.settings, detection.attack_template.as_deref(), "attack")?;

        let tuning = &ctx.settings.tuning;
        self.machine = PhaseMachine::new(tuning.reclick_interval_s, tuning.absence_limit);
        self.box_lock = None;
        self.menu_rect = None;
        self.history.clear();
        self.last_found.clear();
        info!(
            "Combat skill started: target '{}', prompt '{}', method {:?}",
            ctx.settings.combat.target_word, ctx.settings.combat.attack_word, ctx.settings.detection.method
        );
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut RuntimeContext) {
        ctx.tracker.clear();
        self.machine.reset();
        info!("Combat skill stopped");
    }

    fn process_frame(&mut self, frame: &Frame, ctx: &mut RuntimeContext) -> Result<CycleReport> {
        let now = frame.timestamp;
        let phase = self.machine.phase();
        let nav = ctx.navigate(frame, phase);
        let mut inputs = nav.inputs;

        let grid = ctx.active_grid(frame.width(), frame.height());
        // tiles configured but the compass is off north: no tile-dependent decisions
        let suspended = ctx.grid.is_configured() && nav.compass.drift_flag;

        let mut sighting = Sighting::default();
        if matches!(phase, Phase::Scan | Phase::PrimeTarget) {
            sighting = self.detect_target(frame, ctx, now);
            if let Some(g) = &grid {
                self.track(g, &sighting, ctx, now);
            }
        }

        let mut prompt = CategoryReport::default();
        let mut prompt_point = None;
        if matches!(phase, Phase::PrimeTarget | Phase::AttackPanel) {
            let gate = if suspended {
                Gate::closed(None)
            } else {
                match (&grid, phase) {
                    (Some(g), Phase::PrimeTarget) => self.hover_gate(g, frame, ctx, &mut inputs, now),
                    (Some(_), _) => Gate::open(self.menu_rect),
                    (None, _) => Gate::open(None),
                }
            };
            let (boxes, method) = self.detect_prompt(frame, ctx, gate.region, now);
            prompt = CategoryReport::from_boxes(&boxes, method);
            if gate.trusted {
                prompt_point = boxes.first().map(|b| center_of(&b.rect()));
                if prompt_point.is_some() && gate.region.is_some() {
                    self.menu_rect = gate.region;
                }
            } else if prompt.found {
                debug!("Attack prompt seen but not trusted this cycle");
            }
        }

        let prepare = if matches!(phase, Phase::AttackPanel | Phase::Prepare) {
            CategoryReport::from_detection(&self.detect_prepare(frame, ctx))
        } else {
            CategoryReport::default()
        };
        let weapon = if matches!(phase, Phase::Prepare | Phase::Weapon) {
            CategoryReport::from_detection(&self.detect_weapon(frame, ctx))
        } else {
            CategoryReport::default()
        };
        let battle = if matches!(phase, Phase::Weapon | Phase::BattleLoop) {
            self.detect_battle(frame, ctx)
        } else {
            CategoryReport::default()
        };

        let to_screen = |p: (i32, i32)| frame.to_screen(p.0, p.1);
        let phase_inputs = PhaseInputs {
            target: sighting.primary.map(|r| {
                let hit = hitbox_point(&r);
                to_screen((hit.x.round() as i32, hit.y.round() as i32))
            }),
            prompt: prompt_point.map(to_screen),
            prepare_panel: prepare.found,
            weapon_slot: weapon.boxes.first().map(|r| to_screen(center_of(r))),
            battle_cue: battle.found,
        };
        let step = self.machine.step(&phase_inputs, now);
        self.emit_step(ctx, &step, phase, now);

        let history_len = ctx.settings.tuning.history_len;
        let mut flipped = false;
        let categories = [
            (TARGET, &sighting.report, matches!(phase, Phase::Scan | Phase::PrimeTarget)),
            (PROMPT, &prompt, matches!(phase, Phase::PrimeTarget | Phase::AttackPanel)),
            (PREPARE, &prepare, matches!(phase, Phase::AttackPanel | Phase::Prepare)),
            (WEAPON, &weapon, matches!(phase, Phase::Prepare | Phase::Weapon)),
            (BATTLE, &battle, matches!(phase, Phase::Weapon | Phase::BattleLoop)),
        ];
        for (name, report, evaluated) in categories {
            if evaluated {
                self.record_history(name, report.confidence, history_len);
                flipped |= self.note_found(ctx, name, report, now);
            }
            ctx.detections_total += report.count as u64;
        }

        if let Some(t) = &step.transition {
            if t.to == Phase::Scan {
                ctx.tracker.unlock();
                self.menu_rect = None;
                self.history.clear();
            }
        }

        let log_due = self
            .last_log
            .map_or(true, |t| now - t >= ctx.settings.tuning.log_interval_s);
        if flipped || log_due {
            info!(
                "[{:?}] target={} prompt={} prepare={} weapon={} battle={} tracks={} clicks={}",
                self.machine.phase(),
                sighting.report.found,
                prompt.found,
                prepare.found,
                weapon.found,
                battle.found,
                ctx.tracker.tracks().len(),
                step.clicks.len()
            );
            self.last_log = Some(now);
        }

        inputs.extend(step.clicks.iter().cloned().map(PlannedInput::Click));
        let locked = ctx.tracker.locked_id();

        Ok(CycleReport {
            timestamp: now,
            phase: self.machine.phase(),
            target: sighting.report,
            prompt,
            prepare,
            weapon,
            battle,
            planned_clicks: step.clicks,
            inputs,
            tracks: ctx
                .tracker
                .tracks()
                .iter()
                .map(|t| TrackReport::new(t, locked))
                .collect(),
            compass: CompassReport::new(&nav.compass, now),
            world_offset: ctx.anchor.offset(),
            world_tile: nav.world_tile.or_else(|| ctx.anchor.world_tile()),
            detections_total: ctx.detections_total,
            transition: step.transition,
            click_attempts: self.machine.attempts().clone(),
            confidence_history: self
                .history
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::phase::{ATTACK_LABEL, PRIME_LABEL};
    use crate::telemetry::Timeline;
    use bs_data::GridSample;
    use bs_vision::testing::GlyphRecognizer;
    use image::{Rgba, RgbaImage};

    const RED: Rgba<u8> = Rgba([220, 30, 30, 255]);
    const DARK_RED: Rgba<u8> = Rgba([200, 20, 20, 255]);
    const WHITE: Rgba<u8> = Rgba([230, 230, 230, 255]);
    const YELLOW: Rgba<u8> = Rgba([210, 190, 40, 255]);

    fn recognizer() -> GlyphRecognizer {
        GlyphRecognizer::new()
            .glyph(RED, "Wendigo")
            .glyph(DARK_RED, "Elder")
            .glyph(WHITE, "Attack")
            .glyph(YELLOW, "Attack")
    }

    /// 40 px tiles on a 400x300 frame; the player stands on (3, 5)
    fn grid_samples() -> Vec<GridSample> {
        vec![
            GridSample { x: 0.0, y: 0.0, row: 0, col: 0 },
            GridSample { x: 0.5, y: 0.0, row: 0, col: 5 },
            GridSample { x: 0.0, y: 0.8, row: 6, col: 0 },
            GridSample { x: 0.5, y: 0.8, row: 6, col: 5 },
        ]
    }

    fn context(dir: &Path, configure: impl FnOnce(&mut Settings)) -> RuntimeContext {
        let mut settings = Settings::default();
        settings.data_dir = dir.to_path_buf();
        settings.combat.target_word = "wendigo".to_string();
        configure(&mut settings);
        RuntimeContext::new(settings, Arc::new(recognizer()), Arc::new(Timeline::default())).unwrap()
    }

    fn started(ctx: &mut RuntimeContext) -> CombatSkill {
        let mut skill = CombatSkill::new();
        skill.on_start(ctx).unwrap();
        skill
    }

    /// Nameplate over tile (3, 6), its context menu prompt, and optionally the hover label
    fn scene(hover_label: bool, ts: f64) -> Frame {
        let mut img = RgbaImage::from_pixel(400, 300, Rgba([0, 0, 0, 255]));
        GlyphRecognizer::paint(&mut img, Rect::new(240, 120, 40, 14), RED);
        GlyphRecognizer::paint(&mut img, Rect::new(285, 120, 44, 14), WHITE);
        if hover_label {
            GlyphRecognizer::paint(&mut img, Rect::new(240, 96, 40, 14), YELLOW);
        }
        Frame::new(img, (0, 0), ts)
    }

    fn clicks(reports: &[CycleReport]) -> Vec<String> {
        reports
            .iter()
            .flat_map(|r| r.planned_clicks.iter().map(|c| c.label.clone()))
            .collect()
    }

    #[test]
    fn test_hover_gate_blocks_unconfirmed_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), |s| s.grid.samples = grid_samples());
        let mut skill = started(&mut ctx);

        let mut reports = Vec::new();
        for i in 0..4 {
            reports.push(skill.process_frame(&scene(false, i as f64 * 0.1), &mut ctx).unwrap());
        }

        assert_eq!(reports[0].transition.as_ref().unwrap().to, Phase::PrimeTarget);
        assert!(reports[1].prompt.found, "prompt is inside the context menu");
        assert!(!clicks(&reports).iter().any(|c| c == ATTACK_LABEL));
        assert_eq!(skill.phase(), Phase::PrimeTarget);
        let checks = reports
            .iter()
            .flat_map(|r| r.inputs.iter())
            .filter(|i| i.label() == HOVER_CHECK)
            .count();
        assert!(checks >= 1);
        let tracks = &reports[3].tracks;
        assert_eq!(tracks.len(), 1);
        assert_eq!((tracks[0].row, tracks[0].col), (3, 6));
        assert!(tracks[0].locked);
        assert!(!tracks[0].hover_confirmed);
    }

    #[test]
    fn test_hover_confirmed_prompt_is_clicked() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), |s| s.grid.samples = grid_samples());
        let mut skill = started(&mut ctx);

        let first = skill.process_frame(&scene(true, 0.0), &mut ctx).unwrap();
        assert_eq!(first.planned_clicks[0].label, PRIME_LABEL);
        // centred under the plate, 1.4 plate heights below its top
        assert_eq!((first.planned_clicks[0].x, first.planned_clicks[0].y), (260, 140));

        let second = skill.process_frame(&scene(true, 0.1), &mut ctx).unwrap();
        assert_eq!(second.planned_clicks.len(), 1);
        assert_eq!(second.planned_clicks[0].label, ATTACK_LABEL);
        assert_eq!((second.planned_clicks[0].x, second.planned_clicks[0].y), (307, 127));
        assert_eq!(second.phase, Phase::AttackPanel);
        assert!(second.tracks[0].hover_confirmed);

        let confirms = ctx
            .timeline
            .last(50)
            .into_iter()
            .filter(|e| e.kind == EventKind::Confirm && e.label == HOVER_LABEL)
            .count();
        assert_eq!(confirms, 1);
    }

    #[test]
    fn test_without_grid_prompt_searched_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), |_| {});
        let mut skill = started(&mut ctx);

        let origin_frame = |ts: f64| {
            let mut f = scene(false, ts);
            f.origin = (100, 50);
            f
        };
        let first = skill.process_frame(&origin_frame(0.0), &mut ctx).unwrap();
        assert_eq!((first.planned_clicks[0].x, first.planned_clicks[0].y), (360, 190));
        let second = skill.process_frame(&origin_frame(0.1), &mut ctx).unwrap();
        assert_eq!(clicks(&[second.clone()]), vec![ATTACK_LABEL.to_string()]);
        assert!(second.tracks.is_empty());
        assert_eq!(second.click_attempts.get(ATTACK_LABEL), Some(&1));
        assert!(second.detections_total >= 3);
    }

    #[test]
    fn test_prefix_merge_and_box_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), |s| s.combat.prefix_word = Some("elder".to_string()));
        let mut skill = started(&mut ctx);

        let mut both = RgbaImage::from_pixel(400, 300, Rgba([0, 0, 0, 255]));
        GlyphRecognizer::paint(&mut both, Rect::new(180, 120, 50, 14), DARK_RED);
        GlyphRecognizer::paint(&mut both, Rect::new(240, 120, 40, 14), RED);
        let mut name_only = RgbaImage::from_pixel(400, 300, Rgba([0, 0, 0, 255]));
        GlyphRecognizer::paint(&mut name_only, Rect::new(240, 120, 40, 14), RED);

        let union = Rect::new(180, 120, 100, 14);
        let seen = skill.detect_target(&Frame::new(both, (0, 0), 0.0), &mut ctx, 0.0);
        assert_eq!(seen.primary, Some(union));

        let flicker = skill.detect_target(&Frame::new(name_only.clone(), (0, 0), 0.5), &mut ctx, 0.5);
        assert_eq!(flicker.primary, Some(union));
        assert!(flicker.report.found);

        let expired = skill.detect_target(&Frame::new(name_only, (0, 0), 2.0), &mut ctx, 2.0);
        assert_eq!(expired.primary, None);
        assert!(!expired.report.found);
    }

    #[test]
    fn test_history_and_attempts_reset_on_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), |_| {});
        let mut skill = started(&mut ctx);

        let report = skill.process_frame(&scene(false, 0.0), &mut ctx).unwrap();
        assert_eq!(report.confidence_history.get(TARGET).map(|h| h.len()), Some(1));
        assert_eq!(report.click_attempts.get(PRIME_LABEL), Some(&1));

        let empty = Frame::new(RgbaImage::from_pixel(400, 300, Rgba([0, 0, 0, 255])), (0, 0), 0.1);
        let report = skill.process_frame(&empty, &mut ctx).unwrap();
        let t = report.transition.unwrap();
        assert_eq!((t.from, t.to), (Phase::PrimeTarget, Phase::Scan));
        assert!(report.click_attempts.is_empty());
        assert!(report.confidence_history.is_empty());

        let transitions = ctx
            .timeline
            .last(50)
            .into_iter()
            .filter(|e| e.kind == EventKind::Transition)
            .count();
        assert_eq!(transitions, 2);
    }
}
