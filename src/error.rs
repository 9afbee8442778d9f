//! Custom error types for the acquisition core.
//!
//! `AcqError` is the single error type surfaced by the library. It follows the
//! error taxonomy of the collection software:
//!
//! - **Limit errors** (`Limit`): a requested position or a taxi extreme falls outside the
//!   soft limits of a motor. The operation is refused before any further hardware mutation.
//! - **Precondition errors** (`Precondition`, `StepExceedsRange`): the operation never starts,
//!   e.g. collecting while the detector is not at the XRD position.
//! - **Hardware timeouts** (`HardwareTimeout`): a put waiting for completion, or a readback
//!   wait, exceeded its deadline. Not retried; cleanup is still attempted.
//! - **Transport faults** (`Hardware`, `InvalidValue`): reported by the process-variable bus.
//!
//! Cancellation is not an error. An aborted scan completes normally through its
//! finishing phase.

use crate::config::ConfigError;
use crate::coordinator::ActiveOperation;
use crate::planner::PlanError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

/// Which soft limit was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSide {
    /// Below `.LLM`
    Low,
    /// Above `.HLM`
    High,
}

impl fmt::Display for LimitSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitSide::Low => write!(f, "low"),
            LimitSide::High => write!(f, "high"),
        }
    }
}

/// Errors produced by the acquisition core.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("You have reached the {side} limit of the {axis}.")]
    Limit {
        axis: String,
        side: LimitSide,
        value: f64,
        limit: f64,
    },

    #[error("Step size cannot be greater than the total range of the collection! (step {step}, range {range})")]
    StepExceedsRange { step: f64, range: f64 },

    #[error("{0}")]
    Precondition(String),

    #[error("Timed out after {timeout:?} waiting on '{key}'")]
    HardwareTimeout { key: String, timeout: Duration },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Unexpected value '{value}' read from '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid motion profile: {0}")]
    InvalidProfile(String),

    #[error("Another operation is in progress: {0}")]
    Busy(ActiveOperation),

    #[error("Collection point '{0}' already exists")]
    DuplicatePoint(String),

    #[error("Collection point '{0}' not found")]
    UnknownPoint(String),

    #[error("Cleanup failed with {} errors", .0.len())]
    Multiple(Vec<AcqError>),
}

impl From<PlanError> for AcqError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::StepExceedsRange { step, range } => AcqError::StepExceedsRange { step, range },
            other => AcqError::InvalidProfile(other.to_string()),
        }
    }
}

impl AcqError {
    /// True for limit violations and precondition failures, which are reported to the
    /// operator and never leave partially programmed hardware behind.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AcqError::Limit { .. } | AcqError::StepExceedsRange { .. } | AcqError::Precondition(_)
        )
    }
}

/// Collects failures from a cleanup sequence that must run every step.
#[derive(Debug, Default)]
pub(crate) struct ErrorSink {
    errors: Vec<AcqError>,
}

impl ErrorSink {
    pub(crate) fn record<T>(&mut self, step: &str, result: AppResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::error!(step, error = %err, "cleanup step failed");
                self.errors.push(err);
                None
            }
        }
    }

    pub(crate) fn finish(mut self) -> AppResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(AcqError::Multiple(self.errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_display() {
        let err = AcqError::Limit {
            axis: "13BMD:m119".to_string(),
            side: LimitSide::Low,
            value: -200.0,
            limit: -180.0,
        };
        assert_eq!(err.to_string(), "You have reached the low limit of the 13BMD:m119.");
        assert!(err.is_rejection());
    }

    #[test]
    fn test_plan_error_conversion() {
        let err: AcqError = PlanError::StepExceedsRange {
            step: 5.0,
            range: 1.0,
        }
        .into();
        assert!(matches!(err, AcqError::StepExceedsRange { .. }));

        let err: AcqError = PlanError::NonPositiveStep(0.0).into();
        assert!(matches!(err, AcqError::InvalidProfile(_)));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_error_sink_keeps_first_error() {
        let mut sink = ErrorSink::default();
        sink.record::<()>("ok", Ok(()));
        sink.record::<()>("shutter", Err(AcqError::Hardware("closed".into())));
        let err = sink.finish().unwrap_err();
        assert_eq!(err.to_string(), "Hardware error: closed");

        let mut sink = ErrorSink::default();
        sink.record::<()>("a", Err(AcqError::Hardware("a".into())));
        sink.record::<()>("b", Err(AcqError::Hardware("b".into())));
        assert!(matches!(sink.finish(), Err(AcqError::Multiple(errors)) if errors.len() == 2));
    }
}
