//! Detector programming and restoration.

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AppResult, ErrorSink};
use crate::scan::ScanKind;
use crate::sequencer::Sequencer;

/// Camera trigger mode register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Frames start on `Acquire`
    Internal = 0,
    /// One external pulse starts one exposure
    ExternalSingle = 2,
    /// Every external pulse starts an exposure
    ExternalMulti = 3,
}

impl TriggerMode {
    /// Trigger mode used for a scan kind.
    pub fn for_scan(kind: ScanKind) -> Self {
        match kind {
            ScanKind::Still => TriggerMode::Internal,
            ScanKind::Wide => TriggerMode::ExternalSingle,
            ScanKind::Step => TriggerMode::ExternalMulti,
        }
    }

    /// Register value
    pub fn value(self) -> i64 {
        self as i64
    }
}

/// Detector file template used outside accumulate mode.
pub const DETECTOR_TEMPLATE: &str = "%s%s_%4.4d_0001.tif";
/// TIFF plugin template used outside accumulate mode.
pub const TIFF_TEMPLATE: &str = "%s%s_%4.4d.tif";
/// Detector template for accumulated step frames.
pub const ACCUMULATE_DETECTOR_TEMPLATE: &str = "%s%s_%4.4d.cbf";
/// TIFF template for the summed frame.
pub const ACCUMULATE_TIFF_TEMPLATE: &str = "%s%s_merged.tif";

/// Recursive filter type register value for summing.
const FILTER_TYPE_SUM: i64 = 2;

/// Register values for one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorProgram {
    /// Scan kind the program was built for
    pub kind: ScanKind,
    /// Exposure per frame
    pub exposure: f64,
    /// Number of frames
    pub num_images: u32,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Base file name
    pub filename: String,
    /// First frame number
    pub frame_start: i64,
    /// Output directory as the detector server sees it
    pub detector_path: String,
    /// Sum step frames with the recursive filter
    pub accumulate: bool,
}

impl DetectorProgram {
    /// Program for a scan. Accumulation only applies to step scans.
    pub fn new(
        kind: ScanKind,
        exposure: f64,
        num_images: u32,
        filename: impl Into<String>,
        frame_start: i64,
        detector_path: impl Into<String>,
        accumulate: bool,
    ) -> Self {
        Self {
            kind,
            exposure,
            num_images,
            trigger_mode: TriggerMode::for_scan(kind),
            filename: filename.into(),
            frame_start,
            detector_path: detector_path.into(),
            accumulate: accumulate && kind == ScanKind::Step,
        }
    }

    /// `(detector, tiff)` file templates.
    pub fn templates(&self) -> (&'static str, &'static str) {
        if self.accumulate {
            (ACCUMULATE_DETECTOR_TEMPLATE, ACCUMULATE_TIFF_TEMPLATE)
        } else {
            (DETECTOR_TEMPLATE, TIFF_TEMPLATE)
        }
    }
}

/// Register values captured before arming, restored by `disarm`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSnapshot {
    kind: ScanKind,
    accumulate: bool,
    tiff_path: String,
    tiff_name: String,
    detector_path: String,
    detector_name: String,
    detector_file_number: Option<i64>,
}

impl Sequencer {
    /// Program the detector for `program`, returning what must be restored.
    ///
    /// The snapshot is read before the first write. If any write fails the
    /// detector is disarmed from that snapshot before the error is returned.
    pub async fn arm(&self, program: &DetectorProgram) -> AppResult<DetectorSnapshot> {
        let det = &self.detector;
        tracing::info!(
            kind = ?program.kind,
            images = program.num_images,
            trigger = ?program.trigger_mode,
            "arming detector"
        );

        let snapshot = DetectorSnapshot {
            kind: program.kind,
            accumulate: program.accumulate,
            tiff_path: self.pvs.get_string(&det.tiff_file_path()).await?,
            tiff_name: self.pvs.get_string(&det.tiff_file_name()).await?,
            detector_path: self.pvs.get_string(&det.file_path()).await?,
            detector_name: self.pvs.get_string(&det.file_name()).await?,
            detector_file_number: if program.accumulate {
                Some(self.pvs.get_i64(&det.file_number()).await?)
            } else {
                None
            },
        };

        match self.write_program(program).await {
            Ok(()) => Ok(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "arming failed, restoring detector");
                match self.disarm(&snapshot).await {
                    Ok(()) => Err(err),
                    Err(restore) => Err(AcqError::Multiple(vec![err, restore])),
                }
            }
        }
    }

    async fn write_program(&self, program: &DetectorProgram) -> AppResult<()> {
        let det = &self.detector;
        let timeout = self.put_timeout;

        self.pvs
            .put_wait(&det.tiff_file_path(), program.detector_path.as_str(), timeout)
            .await?;
        self.pvs
            .put_wait(&det.acquire_time(), program.exposure, timeout)
            .await?;
        self.pvs
            .put_wait(&det.num_images(), program.num_images, timeout)
            .await?;
        self.pvs.put_wait(&det.array_counter(), 0, timeout).await?;
        self.pvs
            .put_wait(&det.trigger_mode(), program.trigger_mode.value(), timeout)
            .await?;
        self.pvs
            .put(&det.tiff_file_name(), program.filename.as_str())
            .await?;
        self.pvs
            .put(&det.file_name(), program.filename.as_str())
            .await?;
        self.pvs
            .put(&det.tiff_file_number(), program.frame_start)
            .await?;

        if program.accumulate {
            self.pvs
                .put_wait(&det.file_number(), program.frame_start, timeout)
                .await?;
            let tiff_path = self.pvs.get_string(&det.tiff_file_path()).await?;
            self.pvs.put(&det.file_path(), tiff_path).await?;
            self.pvs
                .put_wait(&det.filter_count(), program.num_images, timeout)
                .await?;
            self.pvs.put_wait(&det.filter_enable(), 1, timeout).await?;
            self.pvs
                .put_wait(&det.filter_type(), FILTER_TYPE_SUM, timeout)
                .await?;
        }

        let (detector_template, tiff_template) = program.templates();
        self.pvs.put(&det.file_template(), detector_template).await?;
        self.pvs.put(&det.tiff_file_template(), tiff_template).await
    }

    /// Return the detector to single internal frames and restore file settings.
    ///
    /// Every step is attempted even when an earlier one fails.
    pub async fn disarm(&self, snapshot: &DetectorSnapshot) -> AppResult<()> {
        let det = &self.detector;
        let timeout = self.put_timeout;
        let mut sink = ErrorSink::default();
        tracing::info!("disarming detector");

        sink.record(
            "num images",
            self.pvs.put_wait(&det.num_images(), 1, timeout).await,
        );
        sink.record(
            "trigger mode",
            self.pvs
                .put_wait(&det.trigger_mode(), TriggerMode::Internal.value(), timeout)
                .await,
        );
        if snapshot.kind == ScanKind::Step {
            sink.record(
                "detector template",
                self.pvs.put(&det.file_template(), DETECTOR_TEMPLATE).await,
            );
            sink.record(
                "tiff template",
                self.pvs.put(&det.tiff_file_template(), TIFF_TEMPLATE).await,
            );
            if snapshot.accumulate {
                sink.record(
                    "filter count",
                    self.pvs.put_wait(&det.filter_count(), 1, timeout).await,
                );
                if let Some(number) = snapshot.detector_file_number {
                    sink.record(
                        "file number",
                        self.pvs.put_wait(&det.file_number(), number, timeout).await,
                    );
                }
            }
        }

        let restores = [
            (det.tiff_file_path(), &snapshot.tiff_path),
            (det.file_path(), &snapshot.detector_path),
            (det.tiff_file_name(), &snapshot.tiff_name),
            (det.file_name(), &snapshot.detector_name),
        ];
        for (key, value) in restores {
            sink.record(
                "restore file settings",
                self.pvs.put_wait(&key, value.as_str(), timeout).await,
            );
        }
        sink.finish()
    }

    /// Start acquiring; frames follow the programmed trigger mode.
    pub async fn start_acquisition(&self) -> AppResult<()> {
        self.pvs.put(&self.detector.acquire(), 1).await
    }

    /// Stop acquiring.
    pub async fn stop_acquisition(&self) -> AppResult<()> {
        self.pvs
            .put_wait(&self.detector.acquire(), 0, self.put_timeout)
            .await
    }

    /// Whether the camera is waiting for or taking frames.
    pub async fn detector_armed(&self) -> AppResult<bool> {
        Ok(self.pvs.get_i64(&self.detector.armed()).await? != 0)
    }

    /// Latest frame number: array counter when accumulating, TIFF file number otherwise.
    pub async fn read_frame_number(&self, accumulate: bool) -> AppResult<i64> {
        let key = if accumulate {
            self.detector.array_counter_rbv()
        } else {
            self.detector.tiff_file_number()
        };
        self.pvs.get_i64(&key).await
    }

    /// Write the base file name to both the camera and the TIFF plugin.
    pub async fn set_file_names(&self, filename: &str) -> AppResult<()> {
        self.pvs.put(&self.detector.file_name(), filename).await?;
        self.pvs
            .put(&self.detector.tiff_file_name(), filename)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::mock::SimulatedBeamline;
    use crate::hardware::pv::PvValue;

    fn sequencer() -> (Settings, SimulatedBeamline, Sequencer) {
        let settings = Settings::default();
        let sim = SimulatedBeamline::new(&settings);
        let sequencer = Sequencer::new(sim.client(), &settings);
        (settings, sim, sequencer)
    }

    #[test]
    fn test_accumulate_only_for_step_scans() {
        let wide = DetectorProgram::new(ScanKind::Wide, 1.0, 1, "s", 1, "/DAC/", true);
        assert!(!wide.accumulate);
        assert_eq!(wide.trigger_mode, TriggerMode::ExternalSingle);
        assert_eq!(wide.templates(), (DETECTOR_TEMPLATE, TIFF_TEMPLATE));

        let step = DetectorProgram::new(ScanKind::Step, 1.0, 10, "s", 1, "/DAC/", true);
        assert!(step.accumulate);
        assert_eq!(step.trigger_mode.value(), 3);
    }

    #[tokio::test]
    async fn test_arm_and_disarm_restore_file_settings() {
        let (settings, sim, sequencer) = sequencer();
        let det = &settings.detector;
        let program = DetectorProgram::new(ScanKind::Step, 0.5, 160, "run1", 1, "/DAC/s1/run1", true);

        let snapshot = sequencer.arm(&program).await.unwrap();
        assert_eq!(sim.value(&det.filter_count()), Some(PvValue::Int(160)));
        assert_eq!(sim.value(&det.file_path()), Some(PvValue::from("/DAC/s1/run1")));
        assert_eq!(
            sim.value(&det.file_template()),
            Some(PvValue::from(ACCUMULATE_DETECTOR_TEMPLATE))
        );

        sequencer.disarm(&snapshot).await.unwrap();
        assert_eq!(sim.value(&det.num_images()), Some(PvValue::Int(1)));
        assert_eq!(sim.value(&det.trigger_mode()), Some(PvValue::Int(0)));
        assert_eq!(sim.value(&det.filter_count()), Some(PvValue::Int(1)));
        assert_eq!(sim.value(&det.file_number()), Some(PvValue::Int(1)));
        assert_eq!(sim.value(&det.tiff_file_name()), Some(PvValue::from("previous")));
        assert_eq!(sim.value(&det.file_path()), Some(PvValue::from("/DAC/previous/")));
        assert_eq!(sim.value(&det.file_template()), Some(PvValue::from(DETECTOR_TEMPLATE)));
    }

    #[tokio::test]
    async fn test_disarm_attempts_every_step() {
        let (settings, sim, sequencer) = sequencer();
        let program = DetectorProgram::new(ScanKind::Still, 1.0, 1, "still", 4, "/DAC/", true);
        let snapshot = sequencer.arm(&program).await.unwrap();

        sim.fail_key(&settings.detector.num_images());
        sim.clear_log();
        assert!(sequencer.disarm(&snapshot).await.is_err());
        // the file name is still restored after the failed first step
        assert_eq!(
            sim.puts_to(&settings.detector.file_name()),
            vec![PvValue::from("detector")]
        );
    }

    #[tokio::test]
    async fn test_failed_arm_restores_file_settings() {
        let (settings, sim, sequencer) = sequencer();
        let det = &settings.detector;
        sim.fail_key(&det.acquire_time());
        let program = DetectorProgram::new(ScanKind::Step, 0.5, 20, "run2", 1, "/DAC/new/", true);

        let err = sequencer.arm(&program).await.unwrap_err();
        assert!(err.to_string().contains("AcquireTime"));
        // the new path was written, then put back
        assert_eq!(
            sim.puts_to(&det.tiff_file_path()),
            vec![PvValue::from("/DAC/new/"), PvValue::from("/DAC/previous/")]
        );
        assert_eq!(sim.value(&det.tiff_file_name()), Some(PvValue::from("previous")));
        assert_eq!(sim.value(&det.trigger_mode()), Some(PvValue::Int(0)));
        assert_eq!(sim.value(&det.file_number()), Some(PvValue::Int(1)));
    }
}
