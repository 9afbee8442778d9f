use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AppResult};
use crate::planner::Sweep;

/// How a collection samples the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// One frame, stage stationary
    Still,
    /// One frame integrating over a rotation
    Wide,
    /// One frame per rotation step
    Step,
}

/// What the operator asked to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Exposure per frame in seconds
    pub exposure: f64,
    /// Start angle
    pub start: Option<f64>,
    /// End angle
    pub end: Option<f64>,
    /// Angular step
    pub step: Option<f64>,
    /// First frame number
    pub frame_start: i64,
    /// Base file name
    pub filename: String,
    /// Output directory (user namespace)
    pub filepath: String,
}

impl ScanRequest {
    /// A still collection.
    pub fn still(exposure: f64, filename: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            exposure,
            start: None,
            end: None,
            step: None,
            frame_start: 1,
            filename: filename.into(),
            filepath: filepath.into(),
        }
    }

    /// A rotating collection; `step = None` is a wide scan.
    pub fn rotation(
        exposure: f64,
        start: f64,
        end: f64,
        step: Option<f64>,
        filename: impl Into<String>,
        filepath: impl Into<String>,
    ) -> Self {
        Self {
            exposure,
            start: Some(start),
            end: Some(end),
            step,
            frame_start: 1,
            filename: filename.into(),
            filepath: filepath.into(),
        }
    }

    /// Set the first frame number.
    pub fn with_frame_start(mut self, frame_start: i64) -> Self {
        self.frame_start = frame_start;
        self
    }

    /// Classify the request. Start and end must be given together.
    pub fn kind(&self) -> AppResult<ScanKind> {
        match (self.start, self.end, self.step) {
            (Some(_), Some(_), Some(_)) => Ok(ScanKind::Step),
            (Some(_), Some(_), None) => Ok(ScanKind::Wide),
            (None, None, _) => Ok(ScanKind::Still),
            _ => Err(AcqError::Precondition(
                "Start and end positions must be given together.".to_string(),
            )),
        }
    }

    /// The rotation to plan, if any.
    pub fn sweep(&self) -> Option<Sweep> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(Sweep {
                start,
                end,
                step: self.step,
                exposure: self.exposure,
            }),
            _ => None,
        }
    }

    /// Whether the step is larger than the range.
    pub fn step_exceeds_range(&self) -> bool {
        match (self.start, self.end, self.step) {
            (Some(start), Some(end), Some(step)) => step > (end - start).abs(),
            _ => false,
        }
    }

    /// Directory frames are written to: step scans get their own subdirectory.
    pub fn target_directory(&self) -> String {
        match self.kind() {
            Ok(ScanKind::Step) => format!("{}{}", self.filepath, self.filename),
            _ => self.filepath.clone(),
        }
    }

    /// Copy of this request for a named collection point.
    pub fn for_point(&self, point: &str, frame_start: i64) -> Self {
        Self {
            filename: format!("{}_{}", self.filename, point),
            frame_start,
            ..self.clone()
        }
    }
}
