//! Orientation and world-position upkeep that runs inside the decision cycle.

pub mod compass;
pub mod minimap;

pub use compass::{AlignOutcome, OrientationNormalizer};
pub use minimap::WorldAnchor;
