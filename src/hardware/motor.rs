//! Motor record wrapper.
//!
//! Exposes the fields of an EPICS-style motor record that the acquisition core
//! uses: drive/readback position, soft limits, velocity, direction and
//! acceleration time.

use std::time::Duration;

use crate::config::motor_field;
use crate::error::{AcqError, AppResult, LimitSide};
use crate::hardware::pv::PvClient;
use crate::planner::Sense;

/// Soft limits of a motor in user coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftLimits {
    /// `.LLM`
    pub low: f64,
    /// `.HLM`
    pub high: f64,
}

impl SoftLimits {
    /// Check `value` against both limits.
    pub fn check(&self, axis: &str, value: f64) -> AppResult<()> {
        if value < self.low {
            return Err(AcqError::Limit {
                axis: axis.to_string(),
                side: LimitSide::Low,
                value,
                limit: self.low,
            });
        }
        if value > self.high {
            return Err(AcqError::Limit {
                axis: axis.to_string(),
                side: LimitSide::High,
                value,
                limit: self.high,
            });
        }
        Ok(())
    }
}

/// Round to the 4 decimals the motor records display.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Handle to one motor record.
#[derive(Debug, Clone)]
pub struct Motor {
    name: String,
    pvs: PvClient,
}

impl Motor {
    /// Wrap the motor record `name`.
    pub fn new(name: impl Into<String>, pvs: PvClient) -> Self {
        Self {
            name: name.into(),
            pvs,
        }
    }

    /// Record name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full key of a record field.
    pub fn field(&self, field: &str) -> String {
        format!("{}.{}", self.name, field)
    }

    /// Current readback position.
    pub async fn readback(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.field(motor_field::RBV)).await
    }

    /// Current drive position.
    pub async fn target(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.field(motor_field::VAL)).await
    }

    /// Soft limits.
    pub async fn limits(&self) -> AppResult<SoftLimits> {
        Ok(SoftLimits {
            low: self.pvs.get_f64(&self.field(motor_field::LLM)).await?,
            high: self.pvs.get_f64(&self.field(motor_field::HLM)).await?,
        })
    }

    /// Check a position against the soft limits. `None` passes.
    pub async fn check_limits(&self, value: Option<f64>) -> AppResult<()> {
        match value {
            Some(value) => self.limits().await?.check(&self.name, value),
            None => Ok(()),
        }
    }

    /// Velocity
    pub async fn velocity(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.field(motor_field::VELO)).await
    }

    /// Set velocity without waiting.
    pub async fn set_velocity(&self, velocity: f64) -> AppResult<()> {
        self.pvs.put(&self.field(motor_field::VELO), velocity).await
    }

    /// Maximum velocity
    pub async fn max_velocity(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.field(motor_field::VMAX)).await
    }

    /// User direction of the record (`.DIR == 0` is positive).
    pub async fn direction(&self) -> AppResult<Sense> {
        let dir = self.pvs.get_i64(&self.field(motor_field::DIR)).await?;
        Ok(if dir == 0 {
            Sense::Positive
        } else {
            Sense::Negative
        })
    }

    /// Acceleration time in seconds.
    pub async fn accel_time(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.field(motor_field::ACCL)).await
    }

    /// Move and wait for the move to complete.
    pub async fn move_to(&self, position: f64, timeout: Duration) -> AppResult<()> {
        tracing::debug!(motor = %self.name, position, "move (wait)");
        self.pvs
            .put_wait(&self.field(motor_field::VAL), position, timeout)
            .await
    }

    /// Start a move and return immediately.
    pub async fn start_move(&self, position: f64) -> AppResult<()> {
        tracing::debug!(motor = %self.name, position, "move");
        self.pvs.put(&self.field(motor_field::VAL), position).await
    }

    /// Poll the readback until it matches `target` (to 4 decimals).
    pub async fn wait_until_at(
        &self,
        target: f64,
        timeout: Duration,
        poll: Duration,
    ) -> AppResult<()> {
        let target = round4(target);
        let key = self.field(motor_field::RBV);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if round4(self.pvs.get_f64(&key).await?) == target {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AcqError::HardwareTimeout { key, timeout });
            }
            tokio::time::sleep(poll).await;
        }
    }
}
