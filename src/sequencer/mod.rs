//! Detector, shutter and pulse-generator sequencing.
//!
//! `Sequencer` holds no run state. Everything it needs to undo is returned to
//! the caller (see [`DetectorSnapshot`]) so restoration works the same after a
//! normal finish and after an abort.

pub mod detector;
pub mod pso;

use std::time::Duration;

use crate::config::{DetectorConfig, PsoConfig, Settings};
use crate::error::{AcqError, AppResult};
use crate::hardware::pv::PvClient;
use crate::planner::MotionProfile;

pub use detector::{DetectorProgram, DetectorSnapshot, TriggerMode};
pub use pso::{ProgrammedPso, PsoCommand, PsoLink, PsoProgram};

/// Parse a `UNITSTOCOUNTS` reply of the form `%<counts>`.
fn parse_units_reply(reply: &str) -> Option<f64> {
    reply
        .trim()
        .strip_prefix('%')
        .and_then(|counts| counts.trim().parse::<f64>().ok())
        .filter(|counts| *counts > 0.0)
}

/// Issues hardware sequences for one beamline.
#[derive(Debug, Clone)]
pub struct Sequencer {
    pvs: PvClient,
    pso: PsoConfig,
    detector: DetectorConfig,
    shutter: String,
    put_timeout: Duration,
}

impl Sequencer {
    /// Sequencer for the records named in `settings`.
    pub fn new(pvs: PvClient, settings: &Settings) -> Self {
        Self {
            pvs,
            pso: settings.pso.clone(),
            detector: settings.detector.clone(),
            shutter: settings.shutter.pv.clone(),
            put_timeout: settings.timing.put_timeout(),
        }
    }

    /// Connect to the pulse generator: read the axis name and ask the
    /// controller for the encoder counts of one full rotation.
    ///
    /// Returns the link for later programs and the counts per rotation, which
    /// is also published to its register.
    pub async fn init_pulse_generator(&self) -> AppResult<(PsoLink, f64)> {
        let axis = self.pvs.get_string(&self.pso.axis_name()).await?;
        let link = PsoLink::new(
            self.pvs.clone(),
            self.pso.command_out(),
            axis,
            self.pso.command_timeout(),
        );
        link.send(PsoCommand::UnitsToCounts).await?;

        let reply_key = self.pso.command_in();
        let reply = self.pvs.get_string(&reply_key).await?;
        let counts = parse_units_reply(&reply).ok_or(AcqError::InvalidValue {
            key: reply_key,
            value: reply.clone(),
        })?;
        self.pvs
            .put(&self.pso.counts_per_rotation(), counts)
            .await?;
        tracing::info!(axis = link.axis(), counts_per_rotation = counts, "pulse generator ready");
        Ok((link, counts))
    }

    /// Encoder counts per step currently programmed; its sign is the encoder direction.
    pub async fn encoder_counts_per_step(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.pso.counts_per_step()).await
    }

    /// Encoder counts per rotation as published.
    pub async fn counts_per_rotation(&self) -> AppResult<f64> {
        self.pvs.get_f64(&self.pso.counts_per_rotation()).await
    }

    /// Publish the planned encoder step and taxi positions.
    pub async fn publish_profile(&self, profile: &MotionProfile) -> AppResult<()> {
        self.pvs
            .put(&self.pso.counts_per_step(), profile.encoder_counts_per_step)
            .await?;
        self.pvs
            .put(&self.pso.start_taxi(), profile.taxi_start)
            .await?;
        self.pvs.put(&self.pso.end_taxi(), profile.taxi_end).await
    }

    /// Program the pulse window for `profile`.
    pub async fn program_pulse_generator(
        &self,
        link: &PsoLink,
        profile: &MotionProfile,
    ) -> AppResult<ProgrammedPso> {
        let input = self.pvs.get_i64(&self.pso.encoder_input()).await?;
        let width = self.pvs.get_f64(&self.pso.pulse_width()).await?;
        tracing::info!(
            axis = link.axis(),
            distance = profile.pulse_distance_counts,
            window_start = profile.window.start,
            window_end = profile.window.end,
            "programming pulse generator"
        );

        let programmed = PsoProgram::begin(link)
            .reset()
            .await?
            .route_output()
            .await?
            .pulse_width(width)
            .await?
            .mask_to_window()
            .await?
            .track(input)
            .await?
            .fixed_distance(profile.pulse_distance_counts)
            .await?
            .window_input(input)
            .await?
            .window_range(profile.window)
            .await?
            .finish();
        Ok(programmed)
    }

    /// Arm a programmed window at the current position.
    pub async fn arm_pulse_generator(&self, link: &PsoLink, _program: &ProgrammedPso) -> AppResult<()> {
        link.send(PsoCommand::Arm).await
    }

    /// Turn the window and output off.
    pub async fn disable_pulse_generator(&self, link: &PsoLink) -> AppResult<()> {
        link.send(PsoCommand::WindowOff).await?;
        link.send(PsoCommand::ControlOff).await
    }

    /// Open or close the shutter and wait for the write to complete.
    pub async fn set_shutter(&self, open: bool) -> AppResult<()> {
        tracing::debug!(open, "shutter");
        self.pvs
            .put_wait(&self.shutter, open, self.put_timeout)
            .await
    }

    /// Whether the shutter reads open.
    pub async fn shutter_is_open(&self) -> AppResult<bool> {
        Ok(self.pvs.get_i64(&self.shutter).await? != 0)
    }
}
