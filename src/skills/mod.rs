pub mod combat;
pub mod phase;

use anyhow::{bail, Result};
use bs_capture::Frame;
use std::collections::BTreeMap;

use crate::context::RuntimeContext;
use crate::status::CycleReport;

pub use combat::CombatSkill;
pub use phase::{Phase, PhaseMachine};

/// A unit of behaviour the decision loop drives one frame at a time
pub trait Skill: Send {
    fn name(&self) -> &str;

    /// Called once before the first frame. Errors here stop the runtime from starting.
    fn on_start(&mut self, ctx: &mut RuntimeContext) -> Result<()>;

    fn on_stop(&mut self, ctx: &mut RuntimeContext);

    fn process_frame(&mut self, frame: &Frame, ctx: &mut RuntimeContext) -> Result<CycleReport>;
}

/// Skill instances by name
#[derive(Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CombatSkill::new()));
        registry
    }

    pub fn register(&mut self, skill: Box<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.keys().map(|k| k.as_str()).collect()
    }

    /// Remove and return the named skill for the loop to own.
    pub fn take(&mut self, name: &str) -> Result<Box<dyn Skill>> {
        match self.skills.remove(name) {
            Some(skill) => Ok(skill),
            None => bail!(
                "Unknown skill '{}', available: {}",
                name,
                self.names().join(", ")
            ),
        }
    }
}
