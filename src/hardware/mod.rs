//! Hardware access: the process-variable bus, motor records and a simulated beamline.

pub mod mock;
pub mod motor;
pub mod pv;

pub use mock::SimulatedBeamline;
pub use motor::{Motor, SoftLimits};
pub use pv::{ProcessVariables, PvClient, PvValue};
