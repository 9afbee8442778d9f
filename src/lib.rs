//! Acquisition sequencing for a combined tomography / X-ray diffraction beamline.
//!
//! The crate drives a rotation stage with a position-synchronized pulse
//! generator, an area detector and a shutter through a process-variable bus
//! ([`hardware::ProcessVariables`]). It plans rotation scans
//! ([`planner`]), programs the hardware for them ([`sequencer`]), runs them
//! through a state machine ([`scan`]), repeats them over sample positions
//! ([`collection`]) and serializes every hardware operation behind a single
//! cancellable slot ([`coordinator`]).
//!
//! [`app::AcquisitionApp`] wires everything together; [`hardware::SimulatedBeamline`]
//! stands in for the facility in tests and in the `simulate` command.

pub mod app;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod monitor;
pub mod planner;
pub mod scan;
pub mod sequencer;

pub use app::AcquisitionApp;
pub use config::Settings;
pub use error::{AcqError, AppResult};
