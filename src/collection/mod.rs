//! Collection points, run estimates and the multi-point orchestrator.

pub mod estimate;
pub mod orchestrator;
pub mod points;

pub use orchestrator::{Collector, RunOutcome, StagePosition};
pub use points::{CollectionPoint, CollectionPoints};
