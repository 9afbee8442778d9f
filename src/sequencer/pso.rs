//! Pulse-generator (PSO) programming.
//!
//! The controller accepts string sub-commands on a single command register.
//! Programming a window is only valid in one order, so [`PsoProgram`] is a
//! typestate pipeline: each step consumes the program and returns the next
//! state, and only the final state can be turned into a [`ProgrammedPso`].
//!
//! ```text
//! RESET -> OUTPUT CONTROL -> PULSE TIME -> PULSE WINDOW MASK
//!       -> TRACK INPUT -> DISTANCE FIXED -> WINDOW INPUT -> WINDOW RANGE
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use crate::error::AppResult;
use crate::hardware::pv::PvClient;
use crate::planner::PulseWindow;

/// One controller sub-command.
#[derive(Debug, Clone, PartialEq)]
pub enum PsoCommand {
    /// Clear any previous program
    Reset,
    /// Route output through the I/O terminal
    OutputControl,
    /// Total and active pulse width, always rendered with a decimal point
    PulseTime(f64),
    /// Only emit pulses inside the window
    PulseWindowMask,
    /// Encoder input that is tracked
    TrackInput(i64),
    /// Fixed distance between pulses, in counts
    FixedDistance(i64),
    /// Encoder input the window is evaluated on
    WindowInput(i64),
    /// Window bounds relative to the arming position
    WindowRange(PulseWindow),
    /// Arm at the current position
    Arm,
    /// Disable the window
    WindowOff,
    /// Disable output
    ControlOff,
    /// Query counts for a full rotation
    UnitsToCounts,
}

impl PsoCommand {
    /// Command string for `axis`.
    pub fn render(&self, axis: &str) -> String {
        match self {
            PsoCommand::Reset => format!("PSOCONTROL {} RESET", axis),
            PsoCommand::OutputControl => format!("PSOOUTPUT {} CONTROL 0 1", axis),
            PsoCommand::PulseTime(width) => format!("PSOPULSE {} TIME {:?},{:?}", axis, width, width),
            PsoCommand::PulseWindowMask => format!("PSOOUTPUT {} PULSE WINDOW MASK", axis),
            PsoCommand::TrackInput(input) => format!("PSOTRACK {} INPUT {}", axis, input),
            PsoCommand::FixedDistance(counts) => format!("PSODISTANCE {} FIXED {}", axis, counts),
            PsoCommand::WindowInput(input) => format!("PSOWINDOW {} 1 INPUT {}", axis, input),
            PsoCommand::WindowRange(window) => {
                format!("PSOWINDOW {} 1 RANGE {},{}", axis, window.start, window.end)
            }
            PsoCommand::Arm => format!("PSOCONTROL {} ARM", axis),
            PsoCommand::WindowOff => format!("PSOWINDOW {} 1 OFF", axis),
            PsoCommand::ControlOff => format!("PSOCONTROL {} OFF", axis),
            PsoCommand::UnitsToCounts => format!("UNITSTOCOUNTS({}, 360.0)", axis),
        }
    }
}

/// Writes commands to the controller command register.
#[derive(Debug, Clone)]
pub struct PsoLink {
    pvs: PvClient,
    command_key: String,
    axis: String,
    timeout: Duration,
}

impl PsoLink {
    /// Link to the command register `command_key` for `axis`.
    pub fn new(pvs: PvClient, command_key: String, axis: String, timeout: Duration) -> Self {
        Self {
            pvs,
            command_key,
            axis,
            timeout,
        }
    }

    /// Axis name used in commands
    pub fn axis(&self) -> &str {
        &self.axis
    }

    /// Send one command and wait for the controller to accept it.
    pub async fn send(&self, command: PsoCommand) -> AppResult<()> {
        let text = command.render(&self.axis);
        tracing::debug!(command = %text, "pso");
        self.pvs.put_wait(&self.command_key, text, self.timeout).await
    }
}

/// Typestate markers for [`PsoProgram`].
pub mod stage {
    /// Nothing sent yet
    pub struct Start;
    /// Control reset
    pub struct Cleared;
    /// Output routed
    pub struct Routed;
    /// Pulse width set
    pub struct Pulsed;
    /// Window mask enabled
    pub struct Masked;
    /// Tracking input selected
    pub struct Tracking;
    /// Pulse distance set
    pub struct Spaced;
    /// Window input selected
    pub struct Windowed;
    /// Window range set
    pub struct Ranged;
}

/// Pulse-generator program under construction.
pub struct PsoProgram<'a, S> {
    link: &'a PsoLink,
    _stage: PhantomData<S>,
}

/// Proof that a complete window program was accepted by the controller.
#[derive(Debug)]
pub struct ProgrammedPso {
    _private: (),
}

impl<'a, S> PsoProgram<'a, S> {
    async fn step<N>(self, command: PsoCommand) -> AppResult<PsoProgram<'a, N>> {
        self.link.send(command).await?;
        Ok(PsoProgram {
            link: self.link,
            _stage: PhantomData,
        })
    }
}

impl<'a> PsoProgram<'a, stage::Start> {
    /// Begin a program on `link`.
    pub fn begin(link: &'a PsoLink) -> Self {
        Self {
            link,
            _stage: PhantomData,
        }
    }

    /// `PSOCONTROL RESET`
    pub async fn reset(self) -> AppResult<PsoProgram<'a, stage::Cleared>> {
        self.step(PsoCommand::Reset).await
    }
}

impl<'a> PsoProgram<'a, stage::Cleared> {
    /// `PSOOUTPUT CONTROL 0 1`
    pub async fn route_output(self) -> AppResult<PsoProgram<'a, stage::Routed>> {
        self.step(PsoCommand::OutputControl).await
    }
}

impl<'a> PsoProgram<'a, stage::Routed> {
    /// `PSOPULSE TIME w,w`
    pub async fn pulse_width(self, width: f64) -> AppResult<PsoProgram<'a, stage::Pulsed>> {
        self.step(PsoCommand::PulseTime(width)).await
    }
}

impl<'a> PsoProgram<'a, stage::Pulsed> {
    /// `PSOOUTPUT PULSE WINDOW MASK`
    pub async fn mask_to_window(self) -> AppResult<PsoProgram<'a, stage::Masked>> {
        self.step(PsoCommand::PulseWindowMask).await
    }
}

impl<'a> PsoProgram<'a, stage::Masked> {
    /// `PSOTRACK INPUT n`
    pub async fn track(self, input: i64) -> AppResult<PsoProgram<'a, stage::Tracking>> {
        self.step(PsoCommand::TrackInput(input)).await
    }
}

impl<'a> PsoProgram<'a, stage::Tracking> {
    /// `PSODISTANCE FIXED d`
    pub async fn fixed_distance(self, counts: i64) -> AppResult<PsoProgram<'a, stage::Spaced>> {
        self.step(PsoCommand::FixedDistance(counts)).await
    }
}

impl<'a> PsoProgram<'a, stage::Spaced> {
    /// `PSOWINDOW 1 INPUT n`
    pub async fn window_input(self, input: i64) -> AppResult<PsoProgram<'a, stage::Windowed>> {
        self.step(PsoCommand::WindowInput(input)).await
    }
}

impl<'a> PsoProgram<'a, stage::Windowed> {
    /// `PSOWINDOW 1 RANGE a,b`
    pub async fn window_range(
        self,
        window: PulseWindow,
    ) -> AppResult<PsoProgram<'a, stage::Ranged>> {
        self.step(PsoCommand::WindowRange(window)).await
    }
}

impl PsoProgram<'_, stage::Ranged> {
    /// Close the pipeline.
    pub fn finish(self) -> ProgrammedPso {
        ProgrammedPso { _private: () }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_commands() {
        assert_eq!(PsoCommand::Reset.render("X"), "PSOCONTROL X RESET");
        assert_eq!(PsoCommand::PulseTime(10.0).render("X"), "PSOPULSE X TIME 10.0,10.0");
        assert_eq!(
            PsoCommand::WindowRange(PulseWindow {
                start: -255,
                end: 79_755
            })
            .render("X"),
            "PSOWINDOW X 1 RANGE -255,79755"
        );
        assert_eq!(PsoCommand::UnitsToCounts.render("X"), "UNITSTOCOUNTS(X, 360.0)");
    }
}
