use anyhow::Result;
use serde::Serialize;
use tracing::info;

/// A click the input collaborator should perform, in screen coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedClick {
    pub x: i32,
    pub y: i32,
    pub label: String,
}

impl PlannedClick {
    pub fn new(x: i32, y: i32, label: &str) -> Self {
        Self {
            x,
            y,
            label: label.to_string(),
        }
    }
}

/// Everything the core can ask the input collaborator to do
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedInput {
    Click(PlannedClick),
    /// Pointer move without a click
    Move { x: i32, y: i32, label: String },
    Key { key: String, hold_s: f64, label: String },
}

impl PlannedInput {
    pub fn label(&self) -> &str {
        match self {
            PlannedInput::Click(c) => &c.label,
            PlannedInput::Move { label, .. } | PlannedInput::Key { label, .. } => label,
        }
    }

    pub fn as_click(&self) -> Option<&PlannedClick> {
        match self {
            PlannedInput::Click(c) => Some(c),
            _ => None,
        }
    }
}

/// Executes planned inputs. Humanised timing and live device access belong to
/// the implementor; the core only says where and in which order.
pub trait ActionSink: Send {
    fn execute(&mut self, inputs: &[PlannedInput]) -> Result<()>;
}

/// Logs inputs instead of performing them.
#[derive(Debug, Default)]
pub struct DryRunSink {
    pub executed: u64,
}

impl ActionSink for DryRunSink {
    fn execute(&mut self, inputs: &[PlannedInput]) -> Result<()> {
        for input in inputs {
            match input {
                PlannedInput::Click(c) => info!("[dry-run] click {} at ({}, {})", c.label, c.x, c.y),
                PlannedInput::Move { x, y, label } => info!("[dry-run] move {} to ({}, {})", label, x, y),
                PlannedInput::Key { key, hold_s, label } => {
                    info!("[dry-run] key {} '{}' hold {:.2}s", label, key, hold_s)
                }
            }
            self.executed += 1;
        }
        Ok(())
    }
}
