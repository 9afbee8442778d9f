//! Motion-synchronization planner.
//!
//! Converts a user angular range and exposure time into a pulse pattern the
//! position-synchronized output (PSO) of the rotation controller can realize
//! exactly. The controller only fires on encoder tick boundaries, so the user
//! step is snapped to a whole number of encoder counts and every downstream
//! quantity (speed, acceleration distance, taxi positions, pulse window) is
//! derived from the snapped step.
//!
//! All functions here are pure. Hardware readbacks enter through
//! [`AxisSnapshot`]; nothing in this module touches a process variable.
//!
//! # Conventions
//!
//! - Angles are `f64` degrees; encoder quantities are `i64` counts.
//! - Rounding to counts and to a number of angles is round-half-to-even
//!   ([`f64::round_ties_even`]).
//! - The pulse window is expressed relative to the position where the PSO is
//!   armed (the taxi start) and is padded by [`WINDOW_PAD_COUNTS`] on each side.
//!
//! # Example
//!
//! ```
//! use tomo_xrd::planner::{plan, AxisSnapshot, Sense, Sweep};
//!
//! let axis = AxisSnapshot {
//!     counts_per_degree: 1000.0,
//!     encoder_dir: Sense::Positive,
//!     motor_dir: Sense::Positive,
//!     accel_time: 0.5,
//! };
//! let sweep = Sweep { start: 0.0, end: 80.0, step: Some(0.5), exposure: 1.0 };
//! let profile = plan(&sweep, &axis, 0.005).unwrap();
//! assert_eq!(profile.encoder_counts_per_step, 500);
//! assert_eq!(profile.num_angles, 160);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Mul;
use thiserror::Error;

/// Counts added on each side of the pulse window to absorb controller jitter.
pub const WINDOW_PAD_COUNTS: i64 = 5;

/// Relative margin applied to the acceleration distance of wide scans.
const WIDE_ACCEL_MARGIN: f64 = 0.001;

/// Planner failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// Start and end coincide, so there is no direction of motion.
    #[error("Start and end positions are both {0}; nothing to sweep")]
    DegenerateRange(f64),

    /// The requested step is larger than the sweep.
    #[error("Step size {step} exceeds the collection range {range}")]
    StepExceedsRange {
        /// Requested step
        step: f64,
        /// Absolute sweep range
        range: f64,
    },

    /// Step must be strictly positive.
    #[error("Step size must be positive, got {0}")]
    NonPositiveStep(f64),

    /// Exposure must be strictly positive.
    #[error("Exposure time must be positive, got {0}")]
    NonPositiveExposure(f64),

    /// Encoder resolution read from the controller is unusable.
    #[error("Encoder counts per degree must be positive, got {0}")]
    InvalidCountsPerDegree(f64),

    /// The step snapped to zero encoder counts.
    #[error("Rotation step {0} is below one encoder count")]
    NonPositiveRotationStep(f64),
}

/// Direction of motion as a sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    /// +1
    Positive,
    /// -1
    Negative,
}

impl Sense {
    /// `Positive` for values strictly greater than zero.
    pub fn of(value: f64) -> Self {
        if value > 0.0 {
            Sense::Positive
        } else {
            Sense::Negative
        }
    }

    /// The sign as an integer.
    pub fn signum(self) -> i64 {
        match self {
            Sense::Positive => 1,
            Sense::Negative => -1,
        }
    }

    /// The sign as a float.
    pub fn as_f64(self) -> f64 {
        self.signum() as f64
    }
}

impl Mul for Sense {
    type Output = Sense;

    fn mul(self, rhs: Sense) -> Sense {
        if self == rhs {
            Sense::Positive
        } else {
            Sense::Negative
        }
    }
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.signum())
    }
}

/// How the rotation is sampled while sweeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    /// One pulse, one frame integrating over the whole range.
    Wide,
    /// One pulse and one frame per rotation step.
    Step,
}

/// Readbacks of the rotation axis the plan depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSnapshot {
    /// Encoder counts per degree (`PSOCountsPerRotation / 360`)
    pub counts_per_degree: f64,
    /// Sign of the currently programmed `PSOEncoderCountsPerStep`
    pub encoder_dir: Sense,
    /// Motor record user direction (`.DIR`)
    pub motor_dir: Sense,
    /// Motor acceleration time in seconds (`.ACCL`)
    pub accel_time: f64,
}

/// A rotating collection request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sweep {
    /// Start angle
    pub start: f64,
    /// End angle
    pub end: f64,
    /// Angular step; `None` sweeps the whole range with one wide frame
    pub step: Option<f64>,
    /// Exposure per frame in seconds
    pub exposure: f64,
}

impl Sweep {
    /// Wide or step.
    pub fn kind(&self) -> SweepKind {
        match self.step {
            Some(_) => SweepKind::Step,
            None => SweepKind::Wide,
        }
    }

    /// Absolute range covered.
    pub fn range(&self) -> f64 {
        (self.end - self.start).abs()
    }
}

/// User and overall direction of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Senses {
    /// Direction in user coordinates
    pub user: Sense,
    /// Whether encoder counts increase during the sweep
    pub overall: Sense,
}

/// Pulse window in encoder counts, relative to the arming position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseWindow {
    /// Lower bound, padded
    pub start: i64,
    /// Upper bound, padded
    pub end: i64,
}

/// Everything needed to program the pulse generator and drive the axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionProfile {
    /// Wide or step
    pub kind: SweepKind,
    /// Nominal start angle
    pub start: f64,
    /// Nominal end angle
    pub end: f64,
    /// Direction in user coordinates
    pub user_direction: Sense,
    /// Direction in encoder counts
    pub overall_sense: Sense,
    /// Effective step, an exact multiple of one encoder count
    pub rotation_step: f64,
    /// Number of frames (pulses)
    pub num_angles: u32,
    /// Encoder counts per step (wide: per sweep)
    pub encoder_counts_per_step: i64,
    /// Exposure plus readout overhead
    pub time_per_angle: f64,
    /// Axis velocity during the sweep, degrees per second
    pub motor_speed: f64,
    /// Distance covered while accelerating
    pub accel_distance: f64,
    /// Extra travel before the start angle
    pub taxi_distance: f64,
    /// Position the sweep starts from
    pub taxi_start: f64,
    /// Position the sweep ends at
    pub taxi_end: f64,
    /// Padded pulse window
    pub window: PulseWindow,
    /// Fixed pulse distance programmed into the controller
    pub pulse_distance_counts: i64,
}

/// Combine the user, motor and encoder directions.
///
/// `start == end` must be rejected by the caller; it is reported here as a
/// negative user direction.
pub fn compute_senses(start: f64, end: f64, encoder_dir: Sense, motor_dir: Sense) -> Senses {
    let user = if end > start {
        Sense::Positive
    } else {
        Sense::Negative
    };
    Senses {
        user,
        overall: user * motor_dir * encoder_dir,
    }
}

/// Encoder counts per pulse.
///
/// Step scans count one rotation step; wide scans count the whole range.
pub fn compute_encoder_counts(
    kind: SweepKind,
    step: f64,
    range: f64,
    counts_per_degree: f64,
) -> i64 {
    let degrees = match kind {
        SweepKind::Step => step,
        SweepKind::Wide => range,
    };
    (degrees * counts_per_degree).round_ties_even() as i64
}

/// Travel needed ahead of the start angle to be at constant velocity.
///
/// Step scans use a whole number of rotation steps plus half a step. Wide scans
/// pad the acceleration distance by 0.1% and round to a whole degree.
pub fn compute_taxi_distance(accel_distance: f64, rotation_step: f64, kind: SweepKind) -> f64 {
    if rotation_step > 0.0 {
        match kind {
            SweepKind::Step => (accel_distance / rotation_step + 0.5).ceil() * rotation_step,
            SweepKind::Wide => (accel_distance + accel_distance * WIDE_ACCEL_MARGIN).ceil(),
        }
    } else {
        match kind {
            SweepKind::Step => (accel_distance / rotation_step - 0.5).floor() * rotation_step,
            SweepKind::Wide => (accel_distance - accel_distance * WIDE_ACCEL_MARGIN).ceil(),
        }
    }
}

/// Fixed pulse distance of a wide scan: the padded acceleration distance in counts.
pub fn wide_pulse_distance(accel_distance: f64, counts_per_degree: f64) -> i64 {
    ((accel_distance + accel_distance * WIDE_ACCEL_MARGIN).ceil() * counts_per_degree)
        .round_ties_even() as i64
}

/// Orient and pad the pulse window.
///
/// The unpadded window starts `lead_in` counts behind the arming position in
/// the direction of motion and spans `|counts_per_step| * num_angles` counts.
pub fn compute_window(
    overall: Sense,
    counts_per_step: i64,
    num_angles: u32,
    lead_in: i64,
) -> PulseWindow {
    let range_start = -lead_in * overall.signum();
    let length = counts_per_step.abs() * i64::from(num_angles);
    let (start, end) = match overall {
        Sense::Positive => (range_start, range_start + length),
        Sense::Negative => (range_start - length, range_start),
    };
    PulseWindow {
        start: start - WINDOW_PAD_COUNTS,
        end: end + WINDOW_PAD_COUNTS,
    }
}

/// Plan a rotating collection.
///
/// `frame_overhead` is the detector dead time added to every exposure.
pub fn plan(
    sweep: &Sweep,
    axis: &AxisSnapshot,
    frame_overhead: f64,
) -> Result<MotionProfile, PlanError> {
    let range = sweep.range();
    if range == 0.0 {
        return Err(PlanError::DegenerateRange(sweep.start));
    }
    if !(axis.counts_per_degree.is_finite() && axis.counts_per_degree > 0.0) {
        return Err(PlanError::InvalidCountsPerDegree(axis.counts_per_degree));
    }
    if sweep.exposure.is_nan() || sweep.exposure <= 0.0 {
        return Err(PlanError::NonPositiveExposure(sweep.exposure));
    }
    let kind = sweep.kind();
    let step = match sweep.step {
        Some(step) if step.is_nan() || step <= 0.0 => return Err(PlanError::NonPositiveStep(step)),
        Some(step) if step > range => return Err(PlanError::StepExceedsRange { step, range }),
        Some(step) => step,
        None => range,
    };

    let senses = compute_senses(sweep.start, sweep.end, axis.encoder_dir, axis.motor_dir);
    let cpd = axis.counts_per_degree;
    let encoder_counts_per_step = compute_encoder_counts(kind, step, range, cpd);
    let rotation_step = encoder_counts_per_step as f64 / cpd;
    if rotation_step <= 0.0 {
        return Err(PlanError::NonPositiveRotationStep(rotation_step));
    }

    let time_per_angle = sweep.exposure + frame_overhead;
    let motor_speed = (rotation_step / time_per_angle).abs();
    let accel_distance = axis.accel_time / 2.0 * motor_speed;
    let num_angles = (range / rotation_step).round_ties_even() as u32;

    let taxi_distance = compute_taxi_distance(accel_distance, rotation_step, kind);
    let taxi_start = sweep.start - taxi_distance * senses.user.as_f64();

    let (pulse_distance_counts, lead_in) = match kind {
        SweepKind::Step => {
            let distance = encoder_counts_per_step.abs();
            (distance, (distance as f64 / 2.0).round_ties_even() as i64)
        }
        SweepKind::Wide => {
            let fixed = wide_pulse_distance(accel_distance, cpd);
            (fixed, fixed)
        }
    };
    let window = compute_window(senses.overall, encoder_counts_per_step, num_angles, lead_in);

    Ok(MotionProfile {
        kind,
        start: sweep.start,
        end: sweep.end,
        user_direction: senses.user,
        overall_sense: senses.overall,
        rotation_step,
        num_angles,
        encoder_counts_per_step,
        time_per_angle,
        motor_speed,
        accel_distance,
        taxi_distance,
        taxi_start,
        taxi_end: sweep.end,
        window,
        pulse_distance_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(cpd: f64) -> AxisSnapshot {
        AxisSnapshot {
            counts_per_degree: cpd,
            encoder_dir: Sense::Positive,
            motor_dir: Sense::Positive,
            accel_time: 0.5,
        }
    }

    fn step_sweep(start: f64, end: f64, step: f64) -> Sweep {
        Sweep {
            start,
            end,
            step: Some(step),
            exposure: 1.0,
        }
    }

    #[test]
    fn test_concrete_step_scan() {
        let profile = plan(&step_sweep(0.0, 80.0, 0.5), &axis(1000.0), 0.005).unwrap();
        assert_eq!(profile.encoder_counts_per_step, 500);
        assert_eq!(profile.rotation_step, 0.5);
        assert_eq!(profile.num_angles, 160);
        assert_eq!(profile.taxi_distance, 0.5);
        assert_eq!(profile.taxi_start, -0.5);
        assert_eq!(profile.taxi_end, 80.0);
        assert_eq!(profile.window, PulseWindow { start: -255, end: 79_755 });
        assert_eq!(profile.pulse_distance_counts, 500);
        assert_eq!(profile.overall_sense, Sense::Positive);
    }

    #[test]
    fn test_senses_are_a_sign_product() {
        use Sense::*;
        for encoder in [Positive, Negative] {
            for motor in [Positive, Negative] {
                let forward = compute_senses(0.0, 10.0, encoder, motor);
                let backward = compute_senses(10.0, 0.0, encoder, motor);
                assert_eq!(forward.user, Positive);
                assert_eq!(backward.user, Negative);
                assert_ne!(forward.overall, backward.overall);
                assert_eq!(forward, compute_senses(0.0, 10.0, encoder, motor));
            }
        }
        assert_eq!(compute_senses(0.0, 1.0, Negative, Negative).overall, Positive);
        assert_eq!(compute_senses(0.0, 1.0, Negative, Positive).overall, Negative);
    }

    #[test]
    fn test_rotation_step_is_whole_counts() {
        for (step, cpd) in [(0.37, 1000.0), (0.1, 12_345.6), (1.0 / 3.0, 1000.0), (0.25, 100.0)] {
            let profile = plan(&step_sweep(-20.0, 20.0, step), &axis(cpd), 0.005).unwrap();
            let back = (profile.rotation_step * cpd).round_ties_even() as i64;
            assert_eq!(back, profile.encoder_counts_per_step);
        }
    }

    #[test]
    fn test_num_angles_covers_range_within_one_step() {
        for (start, end, step) in [(0.0, 80.0, 0.37), (10.0, -5.0, 0.7), (0.0, 1.0, 0.3)] {
            let profile = plan(&step_sweep(start, end, step), &axis(1000.0), 0.005).unwrap();
            let covered = f64::from(profile.num_angles) * profile.rotation_step;
            let range = (end - start).abs();
            assert!((covered - range).abs() <= profile.rotation_step);
        }
    }

    #[test]
    fn test_reverse_sweep_window_is_below_zero() {
        let profile = plan(&step_sweep(10.0, 0.0, 1.0), &axis(1000.0), 0.005).unwrap();
        assert_eq!(profile.overall_sense, Sense::Negative);
        assert_eq!(profile.num_angles, 10);
        // lead-in of half a step ahead of the start, oriented downwards
        assert_eq!(profile.window, PulseWindow { start: -9_505, end: 505 });
        assert!(profile.taxi_start > 10.0);
    }

    #[test]
    fn test_wide_scan_profile() {
        let sweep = Sweep {
            start: 0.0,
            end: 10.0,
            step: None,
            exposure: 2.0,
        };
        let profile = plan(&sweep, &axis(1000.0), 0.005).unwrap();
        assert_eq!(profile.kind, SweepKind::Wide);
        assert_eq!(profile.encoder_counts_per_step, 10_000);
        assert_eq!(profile.num_angles, 1);
        // speed 10 / 2.005, accel distance 1.247 degrees, padded and rounded up to 2
        assert_eq!(profile.taxi_distance, 2.0);
        assert_eq!(profile.taxi_start, -2.0);
        assert_eq!(profile.pulse_distance_counts, 2000);
        assert_eq!(profile.window, PulseWindow { start: -2005, end: 8005 });
    }

    #[test]
    fn test_taxi_distance_paths() {
        assert_eq!(compute_taxi_distance(0.2, 0.5, SweepKind::Step), 0.5);
        assert_eq!(compute_taxi_distance(0.8, 0.5, SweepKind::Step), 1.5);
        assert_eq!(compute_taxi_distance(0.3, -0.5, SweepKind::Step), 1.0);
        assert_eq!(compute_taxi_distance(1.2, 0.5, SweepKind::Wide), 2.0);
        assert_eq!(compute_taxi_distance(1.0, -0.5, SweepKind::Wide), 1.0);
    }

    #[test]
    fn test_counts_round_half_to_even() {
        assert_eq!(compute_encoder_counts(SweepKind::Step, 0.5, 1.0, 5.0), 2);
        assert_eq!(compute_encoder_counts(SweepKind::Step, 1.5, 2.0, 5.0), 8);
        assert_eq!(compute_encoder_counts(SweepKind::Wide, 0.5, 1.5, 1000.0), 1500);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            plan(&step_sweep(0.0, 1.0, 5.0), &axis(1000.0), 0.005),
            Err(PlanError::StepExceedsRange {
                step: 5.0,
                range: 1.0
            })
        );
        assert_eq!(
            plan(&step_sweep(0.0, 1.0, 0.0), &axis(1000.0), 0.005),
            Err(PlanError::NonPositiveStep(0.0))
        );
        assert_eq!(
            plan(&step_sweep(3.0, 3.0, 1.0), &axis(1000.0), 0.005),
            Err(PlanError::DegenerateRange(3.0))
        );
        assert!(matches!(
            plan(&step_sweep(0.0, 1.0, 0.0001), &axis(1000.0), 0.005),
            Err(PlanError::NonPositiveRotationStep(_))
        ));
        assert!(matches!(
            plan(&step_sweep(0.0, 1.0, 0.5), &axis(0.0), 0.005),
            Err(PlanError::InvalidCountsPerDegree(_))
        ));
    }
}
