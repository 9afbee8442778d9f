//! Scan requests, state and the single-scan engine.

pub mod engine;
pub mod request;
pub mod state;

pub use engine::ScanEngine;
pub use request::{ScanKind, ScanRequest};
pub use state::{RunState, RunStatus, ScanState};
