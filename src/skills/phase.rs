use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::input::PlannedClick;

pub const PRIME_LABEL: &str = "prime_nameplate";
pub const ATTACK_LABEL: &str = "attack_button";
pub const WEAPON_LABEL: &str = "weapon_slot";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Scan,
    PrimeTarget,
    AttackPanel,
    Prepare,
    Weapon,
    BattleLoop,
}

/// What the current frame shows, reduced to what the machine decides on.
/// Points are click positions in screen coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseInputs {
    pub target: Option<(i32, i32)>,
    /// The action prompt, only set when it may be trusted this cycle
    pub prompt: Option<(i32, i32)>,
    pub prepare_panel: bool,
    pub weapon_slot: Option<(i32, i32)>,
    pub battle_cue: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseStep {
    pub clicks: Vec<PlannedClick>,
    pub transition: Option<Transition>,
}

/// The combat interaction sequence. One `step` per frame; transitions are
/// the only way the phase changes.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: Phase,
    reclick_interval_s: f64,
    absence_limit: u32,
    absent_cycles: u32,
    last_click_ts: Option<f64>,
    attempts: BTreeMap<String, u32>,
}

impl PhaseMachine {
    pub fn new(reclick_interval_s: f64, absence_limit: u32) -> Self {
        Self {
            phase: Phase::Scan,
            reclick_interval_s,
            absence_limit: absence_limit.max(1),
            absent_cycles: 0,
            last_click_ts: None,
            attempts: BTreeMap::new(),
        }
    }

    pub fn starting_at(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Clicks issued per label since the last return to Scan
    pub fn attempts(&self) -> &BTreeMap<String, u32> {
        &self.attempts
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Scan;
        self.absent_cycles = 0;
        self.last_click_ts = None;
        self.attempts.clear();
    }

    pub fn step(&mut self, inputs: &PhaseInputs, now: f64) -> PhaseStep {
        let mut step = PhaseStep::default();

        match self.phase {
            Phase::Scan => {
                if let Some((x, y)) = inputs.target {
                    self.click(&mut step, x, y, PRIME_LABEL, now);
                    self.enter(&mut step, Phase::PrimeTarget, "nameplate locked".to_string());
                }
            }
            Phase::PrimeTarget => {
                if let Some((x, y)) = inputs.prompt {
                    self.click(&mut step, x, y, ATTACK_LABEL, now);
                    self.enter(&mut step, Phase::AttackPanel, "attack prompt visible".to_string());
                } else if let Some((x, y)) = inputs.target {
                    if self.reclick_due(now) {
                        self.click(&mut step, x, y, PRIME_LABEL, now);
                    }
                } else {
                    self.enter(&mut step, Phase::Scan, "target lost".to_string());
                }
            }
            Phase::AttackPanel => {
                if inputs.prepare_panel {
                    self.enter(&mut step, Phase::Prepare, "prepare panel visible".to_string());
                } else if let Some((x, y)) = inputs.prompt {
                    if self.reclick_due(now) {
                        self.click(&mut step, x, y, ATTACK_LABEL, now);
                    }
                } else {
                    self.enter(&mut step, Phase::Scan, "attack prompt lost".to_string());
                }
            }
            Phase::Prepare => {
                if let Some((x, y)) = inputs.weapon_slot {
                    self.click(&mut step, x, y, WEAPON_LABEL, now);
                    self.enter(&mut step, Phase::Weapon, "weapon slot visible".to_string());
                } else if !inputs.prepare_panel {
                    self.enter(&mut step, Phase::Scan, "prepare panel lost".to_string());
                }
            }
            Phase::Weapon => {
                if inputs.battle_cue {
                    self.enter(&mut step, Phase::BattleLoop, "battle cue visible".to_string());
                } else if inputs.weapon_slot.is_none() {
                    self.enter(&mut step, Phase::Scan, "weapon slot lost".to_string());
                }
            }
            Phase::BattleLoop => {
                if inputs.battle_cue {
                    self.absent_cycles = 0;
                } else {
                    self.absent_cycles += 1;
                    if self.absent_cycles >= self.absence_limit {
                        let reason = format!("battle cue absent {} cycles", self.absent_cycles);
                        self.enter(&mut step, Phase::Scan, reason);
                    }
                }
            }
        }

        step
    }

    fn reclick_due(&self, now: f64) -> bool {
        self.last_click_ts
            .map_or(true, |t| now - t >= self.reclick_interval_s)
    }

    fn click(&mut self, step: &mut PhaseStep, x: i32, y: i32, label: &str, now: f64) {
        step.clicks.push(PlannedClick::new(x, y, label));
        *self.attempts.entry(label.to_string()).or_insert(0) += 1;
        self.last_click_ts = Some(now);
    }

    fn enter(&mut self, step: &mut PhaseStep, to: Phase, reason: String) {
        let from = self.phase;
        info!("Phase {:?} -> {:?}: {}", from, to, reason);
        self.phase = to;
        self.absent_cycles = 0;
        if to == Phase::Scan {
            self.attempts.clear();
            self.last_click_ts = None;
        }
        step.transition = Some(Transition { from, to, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> PhaseMachine {
        PhaseMachine::new(0.8, 6)
    }

    #[test]
    fn test_full_sequence() {
        let mut m = machine();
        let target = PhaseInputs {
            target: Some((100, 140)),
            ..Default::default()
        };

        let step = m.step(&target, 0.0);
        assert_eq!(m.phase(), Phase::PrimeTarget);
        assert_eq!(step.clicks, vec![PlannedClick::new(100, 140, PRIME_LABEL)]);

        let prompt = PhaseInputs {
            target: Some((100, 140)),
            prompt: Some((130, 160)),
            ..Default::default()
        };
        let step = m.step(&prompt, 0.1);
        assert_eq!(m.phase(), Phase::AttackPanel);
        assert_eq!(step.clicks[0].label, ATTACK_LABEL);

        let panel = PhaseInputs {
            prepare_panel: true,
            ..Default::default()
        };
        let step = m.step(&panel, 0.2);
        assert_eq!(m.phase(), Phase::Prepare);
        assert!(step.clicks.is_empty());

        let slot = PhaseInputs {
            prepare_panel: true,
            weapon_slot: Some((300, 200)),
            ..Default::default()
        };
        let step = m.step(&slot, 0.3);
        assert_eq!(m.phase(), Phase::Weapon);
        assert_eq!(step.clicks[0].label, WEAPON_LABEL);

        let cue = PhaseInputs {
            battle_cue: true,
            ..Default::default()
        };
        let step = m.step(&cue, 0.4);
        assert_eq!(m.phase(), Phase::BattleLoop);
        let t = step.transition.unwrap();
        assert_eq!((t.from, t.to), (Phase::Weapon, Phase::BattleLoop));
        assert_eq!(m.attempts().get(PRIME_LABEL), Some(&1));
    }

    #[test]
    fn test_battle_timeout_after_six_absences() {
        let mut m = machine().starting_at(Phase::BattleLoop);
        let absent = PhaseInputs::default();

        let mut transitions = Vec::new();
        let mut clicks = 0;
        for i in 0..6 {
            let step = m.step(&absent, i as f64 * 0.1);
            clicks += step.clicks.len();
            transitions.extend(step.transition);
        }

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, Phase::BattleLoop);
        assert_eq!(transitions[0].to, Phase::Scan);
        assert!(transitions[0].reason.contains('6'));
        assert_eq!(clicks, 0);
        assert_eq!(m.phase(), Phase::Scan);
    }

    #[test]
    fn test_battle_cue_resets_absence() {
        let mut m = machine().starting_at(Phase::BattleLoop);
        let absent = PhaseInputs::default();
        let cue = PhaseInputs {
            battle_cue: true,
            ..Default::default()
        };
        for i in 0..5 {
            m.step(&absent, i as f64);
        }
        m.step(&cue, 5.0);
        for i in 0..5 {
            assert!(m.step(&absent, 6.0 + i as f64).transition.is_none());
        }
        assert_eq!(m.phase(), Phase::BattleLoop);
    }

    #[test]
    fn test_priming_reclick_is_rate_limited() {
        let mut m = machine();
        let target = PhaseInputs {
            target: Some((10, 10)),
            ..Default::default()
        };
        m.step(&target, 0.0);
        assert!(m.step(&target, 0.1).clicks.is_empty());
        assert!(m.step(&target, 0.5).clicks.is_empty());
        assert_eq!(m.step(&target, 0.85).clicks.len(), 1);
        assert_eq!(m.attempts().get(PRIME_LABEL), Some(&2));
    }

    #[test]
    fn test_target_lost_returns_to_scan() {
        let mut m = machine();
        m.step(
            &PhaseInputs {
                target: Some((10, 10)),
                ..Default::default()
            },
            0.0,
        );
        let step = m.step(&PhaseInputs::default(), 0.1);
        assert_eq!(m.phase(), Phase::Scan);
        assert_eq!(step.transition.unwrap().reason, "target lost");
        assert!(m.attempts().is_empty());
    }

    #[test]
    fn test_attack_panel_fallbacks() {
        let mut m = machine().starting_at(Phase::AttackPanel);
        let prompt = PhaseInputs {
            prompt: Some((5, 5)),
            ..Default::default()
        };
        assert_eq!(m.step(&prompt, 0.0).clicks.len(), 1);
        assert_eq!(m.phase(), Phase::AttackPanel);

        let step = m.step(&PhaseInputs::default(), 0.1);
        assert_eq!(m.phase(), Phase::Scan);
        assert_eq!(step.transition.unwrap().reason, "attack prompt lost");

        let mut m = machine().starting_at(Phase::Weapon);
        let step = m.step(&PhaseInputs::default(), 0.0);
        assert_eq!(step.transition.unwrap().reason, "weapon slot lost");
    }
}
