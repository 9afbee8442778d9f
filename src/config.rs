//! Configuration system using Figment
//!
//! Settings are layered from three sources, later ones overriding earlier ones:
//! 1. Built-in defaults (the 13-BM-D beamline record names)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `TOMOXRD_` (nested keys split on `__`)
//!
//! ```text
//! TOMOXRD_APPLICATION__LOG_LEVEL=debug
//! TOMOXRD_ROTATION__MOTOR=13BMD:m119
//! TOMOXRD_TIMING__POLL_INTERVAL_MS=20
//! ```
//!
//! Besides plain values, the PV sections know how to spell the record keys the
//! acquisition core reads and writes, so the rest of the crate never formats a
//! PV name by hand.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Rotation (omega) stage
    pub rotation: RotationConfig,
    /// Position-synchronized output controller
    pub pso: PsoConfig,
    /// Area detector plugins
    pub detector: DetectorConfig,
    /// Fast shutter
    pub shutter: ShutterConfig,
    /// Sample positioning stage used by multi-point collections
    pub sample_stage: SampleStageConfig,
    /// Detector stage geometries (tomography / diffraction)
    pub geometry: GeometryConfig,
    /// User to detector path translation
    pub paths: PathConfig,
    /// Poll intervals, settle delays and timeouts
    pub timing: TimingConfig,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("TOMOXRD_").split("__"))
            .extract()
            .map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that parse but cannot drive a collection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let records = [
            ("rotation.motor", &self.rotation.motor),
            ("pso.prefix", &self.pso.prefix),
            ("detector.cam", &self.detector.cam),
            ("detector.tiff", &self.detector.tiff),
            ("detector.process", &self.detector.process),
            ("shutter.pv", &self.shutter.pv),
            ("sample_stage.x", &self.sample_stage.x),
            ("sample_stage.y", &self.sample_stage.y),
            ("sample_stage.z", &self.sample_stage.z),
            ("geometry.detector_x", &self.geometry.detector_x),
            ("geometry.detector_z", &self.geometry.detector_z),
        ];
        for (field, value) in records {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must name a process variable",
                    field
                )));
            }
        }

        let intervals = [
            ("timing.poll_interval_ms", self.timing.poll_interval_ms),
            ("timing.status_poll_ms", self.timing.status_poll_ms),
            ("timing.elapsed_tick_ms", self.timing.elapsed_tick_ms),
            ("timing.readback_poll_ms", self.timing.readback_poll_ms),
            ("timing.readback_timeout_secs", self.timing.readback_timeout_secs),
            ("timing.put_timeout_secs", self.timing.put_timeout_secs),
            ("geometry.move_timeout_secs", self.geometry.move_timeout_secs),
            ("pso.command_timeout_secs", self.pso.command_timeout_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        let overhead = self.timing.frame_overhead_s;
        if overhead.is_nan() || overhead < 0.0 {
            return Err(ConfigError::ValidationError(
                "timing.frame_overhead_s must be non-negative".to_string(),
            ));
        }

        if self.geometry.tomo_x == self.geometry.xrd_x && self.geometry.tomo_z == self.geometry.xrd_z
        {
            return Err(ConfigError::ValidationError(
                "tomography and XRD geometries must differ".to_string(),
            ));
        }

        Ok(())
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TomoXRD".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Motor record field suffixes.
pub mod motor_field {
    /// Drive (target) position
    pub const VAL: &str = "VAL";
    /// Readback position
    pub const RBV: &str = "RBV";
    /// Dial low soft limit (user coordinates)
    pub const LLM: &str = "LLM";
    /// High soft limit
    pub const HLM: &str = "HLM";
    /// Velocity
    pub const VELO: &str = "VELO";
    /// Maximum velocity
    pub const VMAX: &str = "VMAX";
    /// User direction (0 = positive, 1 = negative)
    pub const DIR: &str = "DIR";
    /// Acceleration time in seconds
    pub const ACCL: &str = "ACCL";
}

/// Rotation stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Motor record name
    pub motor: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            motor: "13BMD:m119".to_string(),
        }
    }
}

/// PSO controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsoConfig {
    /// Record prefix of the pulse-generator support (e.g. "13BMDPG1:TS")
    pub prefix: String,
    /// Timeout for each waited pulse-generator command
    pub command_timeout_secs: u64,
}

impl Default for PsoConfig {
    fn default() -> Self {
        Self {
            prefix: "13BMDPG1:TS".to_string(),
            command_timeout_secs: 10,
        }
    }
}

impl PsoConfig {
    fn key(&self, record: &str) -> String {
        format!("{}:{}", self.prefix, record)
    }

    /// Axis name used in controller command strings
    pub fn axis_name(&self) -> String {
        self.key("PSOAxisName")
    }

    /// Reply register for controller commands
    pub fn command_in(&self) -> String {
        self.key("PSOCommand.BINP")
    }

    /// Command register
    pub fn command_out(&self) -> String {
        self.key("PSOCommand.BOUT")
    }

    /// Published encoder counts per full rotation
    pub fn counts_per_rotation(&self) -> String {
        self.key("PSOCountsPerRotation")
    }

    /// Encoder counts between consecutive pulses (sign carries encoder direction)
    pub fn counts_per_step(&self) -> String {
        self.key("PSOEncoderCountsPerStep")
    }

    /// Encoder input used for tracking and windowing
    pub fn encoder_input(&self) -> String {
        self.key("PSOEncoderInput")
    }

    /// Output pulse width
    pub fn pulse_width(&self) -> String {
        self.key("PSOPulseWidth")
    }

    /// Position the rotation axis starts from, before acceleration
    pub fn start_taxi(&self) -> String {
        self.key("PSOStartTaxi")
    }

    /// Position the rotation axis sweeps to
    pub fn end_taxi(&self) -> String {
        self.key("PSOEndTaxi")
    }

    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Area detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Camera driver prefix
    pub cam: String,
    /// TIFF file plugin prefix
    pub tiff: String,
    /// Processing (recursive filter) plugin prefix
    pub process: String,
    /// Sum every step frame into a running total and hand the run to format conversion
    pub accumulate_step_frames: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cam: "13PIL1MCdTe:cam1".to_string(),
            tiff: "13PIL1MCdTe:TIFF1".to_string(),
            process: "13PIL1MCdTe:Proc1".to_string(),
            accumulate_step_frames: true,
        }
    }
}

impl DetectorConfig {
    /// Exposure time
    pub fn acquire_time(&self) -> String {
        format!("{}:AcquireTime", self.cam)
    }
    /// Start/stop acquisition
    pub fn acquire(&self) -> String {
        format!("{}:Acquire", self.cam)
    }
    /// Armed status (non-zero while waiting for or taking frames)
    pub fn armed(&self) -> String {
        format!("{}:Armed", self.cam)
    }
    /// Number of images per acquisition
    pub fn num_images(&self) -> String {
        format!("{}:NumImages", self.cam)
    }
    /// Trigger mode register
    pub fn trigger_mode(&self) -> String {
        format!("{}:TriggerMode", self.cam)
    }
    /// Array counter setpoint
    pub fn array_counter(&self) -> String {
        format!("{}:ArrayCounter", self.cam)
    }
    /// Array counter readback
    pub fn array_counter_rbv(&self) -> String {
        format!("{}:ArrayCounter_RBV", self.cam)
    }
    /// Detector file template
    pub fn file_template(&self) -> String {
        format!("{}:FileTemplate", self.cam)
    }
    /// Detector file name
    pub fn file_name(&self) -> String {
        format!("{}:FileName", self.cam)
    }
    /// Detector file number
    pub fn file_number(&self) -> String {
        format!("{}:FileNumber", self.cam)
    }
    /// Detector file path
    pub fn file_path(&self) -> String {
        format!("{}:FilePath", self.cam)
    }
    /// TIFF plugin file template
    pub fn tiff_file_template(&self) -> String {
        format!("{}:FileTemplate", self.tiff)
    }
    /// TIFF plugin file number
    pub fn tiff_file_number(&self) -> String {
        format!("{}:FileNumber", self.tiff)
    }
    /// TIFF plugin file name
    pub fn tiff_file_name(&self) -> String {
        format!("{}:FileName", self.tiff)
    }
    /// TIFF plugin file path
    pub fn tiff_file_path(&self) -> String {
        format!("{}:FilePath", self.tiff)
    }
    /// Number of frames summed by the recursive filter
    pub fn filter_count(&self) -> String {
        format!("{}:NumFilter", self.process)
    }
    /// Recursive filter type (2 = sum)
    pub fn filter_type(&self) -> String {
        format!("{}:FilterType", self.process)
    }
    /// Recursive filter enable
    pub fn filter_enable(&self) -> String {
        format!("{}:EnableFilter", self.process)
    }
}

/// Shutter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutterConfig {
    /// Digital output bit (1 = open, 0 = closed)
    pub pv: String,
}

impl Default for ShutterConfig {
    fn default() -> Self {
        Self {
            pv: "13BMD:Unidig2Bo10".to_string(),
        }
    }
}

/// Sample stage motors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleStageConfig {
    /// Horizontal motor
    pub x: String,
    /// Vertical motor
    pub y: String,
    /// Focus motor
    pub z: String,
}

impl Default for SampleStageConfig {
    fn default() -> Self {
        Self {
            x: "13BMD:m123".to_string(),
            y: "13BMD:m115".to_string(),
            z: "13BMD:m122".to_string(),
        }
    }
}

/// Detector stage geometries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Detector horizontal motor
    pub detector_x: String,
    /// Detector longitudinal motor
    pub detector_z: String,
    /// Detector X for tomography
    pub tomo_x: f64,
    /// Detector Z for tomography
    pub tomo_z: f64,
    /// Detector X for diffraction
    pub xrd_x: f64,
    /// Detector Z for diffraction
    pub xrd_z: f64,
    /// Detector Z retracted position used while changing geometry
    pub detector_out: f64,
    /// Records written with 1 to stop every axis
    pub all_stop: Vec<String>,
    /// Timeout for each detector stage move
    pub move_timeout_secs: u64,
    /// Delay after each geometry move before another can be requested
    pub abort_settle_ms: u64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            detector_x: "13BMD:m124".to_string(),
            detector_z: "13BMD:m125".to_string(),
            tomo_x: -127.0,
            tomo_z: 50.0,
            xrd_x: 95.0,
            xrd_z: 0.0,
            detector_out: 100.0,
            all_stop: vec![
                "13BMD_TOMO_XPS:allstop".to_string(),
                "13BMD:allstop.VAL".to_string(),
            ],
            move_timeout_secs: 300,
            abort_settle_ms: 2000,
        }
    }
}

impl GeometryConfig {
    /// Timeout for each detector stage move
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }

    /// Settle delay following a geometry move
    pub fn abort_settle(&self) -> Duration {
        Duration::from_millis(self.abort_settle_ms)
    }
}

/// Path translation between the user workstation and the detector server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Prefix of paths as the user enters them
    pub user_base: String,
    /// Prefix the detector server sees for the same location
    pub detector_base: String,
    /// Create the collection directory when it does not exist
    pub create_directories: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            user_base: "T:/dac_user/2022/BMD_2022-3/Tomo".to_string(),
            detector_base: "/DAC".to_string(),
            create_directories: true,
        }
    }
}

impl PathConfig {
    /// Rewrite a user path into the detector server's namespace.
    pub fn to_detector_path(&self, user_path: &str) -> String {
        user_path.replace(&self.user_base, &self.detector_base)
    }
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between iterations of the scan wait loop
    pub poll_interval_ms: u64,
    /// Settle delay after arming and after closing the shutter
    pub settle_ms: u64,
    /// Status monitor interval
    pub status_poll_ms: u64,
    /// Elapsed-time ticker interval
    pub elapsed_tick_ms: u64,
    /// Upper bound on waiting for the rotation stage to return home
    pub readback_timeout_secs: u64,
    /// Interval between readback comparisons
    pub readback_poll_ms: u64,
    /// Timeout for ordinary waited puts
    pub put_timeout_secs: u64,
    /// Readout dead time added to every exposure
    pub frame_overhead_s: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            settle_ms: 500,
            status_poll_ms: 50,
            elapsed_tick_ms: 100,
            readback_timeout_secs: 300,
            readback_poll_ms: 10,
            put_timeout_secs: 30,
            frame_overhead_s: 0.005,
        }
    }
}

impl TimingConfig {
    /// Scan wait-loop interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    /// Settle delay
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    /// Status monitor interval
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
    /// Elapsed ticker interval
    pub fn elapsed_tick(&self) -> Duration {
        Duration::from_millis(self.elapsed_tick_ms)
    }
    /// Readback wait bound
    pub fn readback_timeout(&self) -> Duration {
        Duration::from_secs(self.readback_timeout_secs)
    }
    /// Readback comparison interval
    pub fn readback_poll(&self) -> Duration {
        Duration::from_millis(self.readback_poll_ms)
    }
    /// Waited put timeout
    pub fn put_timeout(&self) -> Duration {
        Duration::from_secs(self.put_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pso.counts_per_step(), "13BMDPG1:TS:PSOEncoderCountsPerStep");
        assert_eq!(settings.detector.array_counter_rbv(), "13PIL1MCdTe:cam1:ArrayCounter_RBV");
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[rotation]
motor = "TEST:m1"

[timing]
poll_interval_ms = 25
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.rotation.motor, "TEST:m1");
        assert_eq!(settings.timing.poll_interval(), Duration::from_millis(25));
        // untouched sections keep their defaults
        assert_eq!(settings.shutter.pv, "13BMD:Unidig2Bo10");
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut settings = Settings::default();
        settings.timing.poll_interval_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("timing.poll_interval_ms"));
    }

    #[test]
    fn test_validation_rejects_empty_record() {
        let mut settings = Settings::default();
        settings.shutter.pv = " ".to_string();
        assert!(matches!(settings.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_detector_path_translation() {
        let paths = PathConfig::default();
        assert_eq!(
            paths.to_detector_path("T:/dac_user/2022/BMD_2022-3/Tomo/sample1/"),
            "/DAC/sample1/"
        );
        assert_eq!(paths.to_detector_path("/elsewhere/"), "/elsewhere/");
    }
}
