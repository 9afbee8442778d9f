//! Single-scan state machine.
//!
//! A scan is prepared once ([`ScanEngine::prepare_scan`]) and then run with
//! [`ScanEngine::collect_still`] or [`ScanEngine::collect_projections`]. Both
//! end in the finishing phase, which always closes the shutter and disarms the
//! detector, whether the scan completed, was aborted or failed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::{PathConfig, Settings, TimingConfig};
use crate::coordinator::CancelFlag;
use crate::error::{AcqError, AppResult, ErrorSink};
use crate::events::{ConversionRequest, EventBus, ScanEvent};
use crate::hardware::motor::Motor;
use crate::hardware::pv::PvClient;
use crate::planner::{plan, AxisSnapshot, MotionProfile, Sense};
use crate::scan::{RunStatus, ScanKind, ScanRequest, ScanState};
use crate::sequencer::{DetectorProgram, DetectorSnapshot, ProgrammedPso, PsoLink, Sequencer};

/// Everything `prepare_scan` set up and the finishing phase must undo.
struct PreparedScan {
    request: ScanRequest,
    kind: ScanKind,
    profile: Option<MotionProfile>,
    programmed: Option<ProgrammedPso>,
    detector: DetectorSnapshot,
    /// Step frames are summed and handed to conversion
    sum_frames: bool,
    /// Frames are counted from the array counter instead of the TIFF file number
    use_array_counter: bool,
}

/// Runs one scan at a time against the beamline.
pub struct ScanEngine {
    sequencer: Sequencer,
    rotation: Motor,
    pso: PsoLink,
    max_speed: f64,
    timing: TimingConfig,
    paths: PathConfig,
    move_timeout: Duration,
    accumulate: AtomicBool,
    events: EventBus,
    status: RunStatus,
    state: watch::Sender<ScanState>,
    prepared: Mutex<Option<PreparedScan>>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine")
            .field("rotation", &self.rotation.name())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ScanEngine {
    /// Connect to the rotation stage and initialise the pulse generator.
    pub async fn connect(
        pvs: PvClient,
        settings: &Settings,
        events: EventBus,
        status: RunStatus,
    ) -> AppResult<Self> {
        let sequencer = Sequencer::new(pvs.clone(), settings);
        let rotation = Motor::new(settings.rotation.motor.clone(), pvs);
        let max_speed = rotation.max_velocity().await?;
        let (pso, _) = sequencer.init_pulse_generator().await?;
        let (state, _) = watch::channel(ScanState::Idle);
        info!(motor = rotation.name(), max_speed, "scan engine connected");

        Ok(Self {
            sequencer,
            rotation,
            pso,
            max_speed,
            timing: settings.timing.clone(),
            paths: settings.paths.clone(),
            move_timeout: settings.geometry.move_timeout(),
            accumulate: AtomicBool::new(settings.detector.accumulate_step_frames),
            events,
            status,
            state,
            prepared: Mutex::new(None),
        })
    }

    /// Sequencer used by this engine.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Whether step frames are summed for format conversion.
    pub fn accumulate(&self) -> bool {
        self.accumulate.load(Ordering::SeqCst)
    }

    /// Enable or disable summing of step frames.
    pub fn set_accumulate(&self, enabled: bool) {
        info!(enabled, "accumulate step frames");
        self.accumulate.store(enabled, Ordering::SeqCst);
    }

    /// Open or close the shutter.
    pub async fn toggle_shutter(&self, open: bool) -> AppResult<()> {
        self.sequencer.set_shutter(open).await
    }

    fn set_state(&self, next: ScanState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "scan state");
            self.events.emit(ScanEvent::StateChanged(next));
        }
    }

    /// Move an interruptible scan into `Aborting`. The scan itself notices the
    /// cancellation at its next check.
    pub fn mark_aborting(&self) {
        if self.state().is_abortable() {
            self.events.status("Aborting");
            self.set_state(ScanState::Aborting);
        }
    }

    /// Plan, check limits and program the hardware for `request`.
    ///
    /// Returns `true` when the request was refused (limit or step check). A
    /// refused request leaves the hardware untouched and the engine idle.
    ///
    /// Fails with [`AcqError::Precondition`] while another scan is prepared or
    /// running; that scan is left as it was.
    #[instrument(skip(self, request), fields(filename = %request.filename))]
    pub async fn prepare_scan(&self, request: &ScanRequest) -> AppResult<bool> {
        {
            let prepared = self.prepared.lock();
            let state = self.state();
            if prepared.is_some() || state != ScanState::Idle {
                warn!(%state, "prepare refused, a scan is already in progress");
                return Err(AcqError::Precondition(
                    "A scan is already prepared or running.".to_string(),
                ));
            }
            self.set_state(ScanState::Preparing);
        }
        self.events.status("Preparing");
        self.status.update(|s| {
            s.is_running = true;
            s.current_frame = 0;
            s.frame_number = request.frame_start;
        });
        self.events.emit(ScanEvent::RunningChanged(true));

        match self.try_prepare(request).await {
            Ok(prepared) => {
                info!(kind = ?prepared.kind, "scan prepared");
                *self.prepared.lock() = Some(prepared);
                Ok(false)
            }
            Err(err) if err.is_rejection() => {
                self.events.error(err.to_string());
                self.return_to_idle();
                Ok(true)
            }
            Err(err) => {
                self.events.error(err.to_string());
                self.return_to_idle();
                Err(err)
            }
        }
    }

    async fn axis_snapshot(&self) -> AppResult<AxisSnapshot> {
        Ok(AxisSnapshot {
            counts_per_degree: self.sequencer.counts_per_rotation().await? / 360.0,
            encoder_dir: Sense::of(self.sequencer.encoder_counts_per_step().await?),
            motor_dir: self.rotation.direction().await?,
            accel_time: self.rotation.accel_time().await?,
        })
    }

    async fn try_prepare(&self, request: &ScanRequest) -> AppResult<PreparedScan> {
        let kind = request.kind()?;
        let use_array_counter = self.accumulate();
        let sum_frames = use_array_counter && kind == ScanKind::Step;

        // Everything up to the limit check is read-only.
        let profile = match request.sweep() {
            Some(sweep) => {
                let axis = self.axis_snapshot().await?;
                let profile = plan(&sweep, &axis, self.timing.frame_overhead_s)?;
                let limits = self.rotation.limits().await?;
                limits.check(self.rotation.name(), profile.taxi_start)?;
                limits.check(self.rotation.name(), profile.taxi_end)?;
                debug!(?profile, "motion profile");
                Some(profile)
            }
            None => None,
        };

        let programmed = match &profile {
            Some(profile) => {
                self.sequencer.publish_profile(profile).await?;
                Some(
                    self.sequencer
                        .program_pulse_generator(&self.pso, profile)
                        .await?,
                )
            }
            None => None,
        };

        let detector = match self.arm_detector(request, kind, profile.as_ref(), sum_frames).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if programmed.is_some() {
                    if let Err(cleanup) = self.sequencer.disable_pulse_generator(&self.pso).await {
                        warn!(error = %cleanup, "pulse generator left programmed");
                    }
                }
                return Err(err);
            }
        };

        Ok(PreparedScan {
            request: request.clone(),
            kind,
            profile,
            programmed,
            detector,
            sum_frames,
            use_array_counter,
        })
    }

    /// Create the output directory and program the detector.
    async fn arm_detector(
        &self,
        request: &ScanRequest,
        kind: ScanKind,
        profile: Option<&MotionProfile>,
        sum_frames: bool,
    ) -> AppResult<DetectorSnapshot> {
        let directory = request.target_directory();
        if self.paths.create_directories {
            tokio::fs::create_dir_all(&directory).await?;
        }
        let program = DetectorProgram::new(
            kind,
            request.exposure,
            profile.map_or(1, |p| p.num_angles),
            request.filename.as_str(),
            request.frame_start,
            self.paths.to_detector_path(&directory),
            sum_frames,
        );
        self.sequencer.arm(&program).await
    }

    fn return_to_idle(&self) {
        self.status.update(|s| {
            s.is_running = false;
            s.current_frame = 0;
        });
        self.events.emit(ScanEvent::RunningChanged(false));
        self.set_state(ScanState::Idle);
    }

    fn take_prepared(&self) -> AppResult<PreparedScan> {
        self.prepared
            .lock()
            .take()
            .ok_or_else(|| AcqError::Precondition("No scan has been prepared.".to_string()))
    }

    /// Run whichever scan was prepared.
    pub async fn collect_prepared(&self, cancel: &CancelFlag) -> AppResult<()> {
        let prepared = self.take_prepared()?;
        let result = match prepared.kind {
            ScanKind::Still => self.run_still(&prepared, cancel).await,
            ScanKind::Wide | ScanKind::Step => self.run_projections(&prepared, cancel).await,
        };
        self.finish(prepared, cancel, result).await
    }

    /// Take a single frame with the stage stationary.
    #[instrument(skip_all)]
    pub async fn collect_still(&self, cancel: &CancelFlag) -> AppResult<()> {
        let prepared = self.take_prepared()?;
        if prepared.kind != ScanKind::Still {
            let kind = prepared.kind;
            self.finish(prepared, cancel, Ok(())).await?;
            return Err(AcqError::Precondition(format!(
                "A {:?} scan was prepared, not a still.",
                kind
            )));
        }
        let result = self.run_still(&prepared, cancel).await;
        self.finish(prepared, cancel, result).await
    }

    /// Sweep the rotation stage through the prepared window.
    #[instrument(skip_all)]
    pub async fn collect_projections(&self, cancel: &CancelFlag) -> AppResult<()> {
        let prepared = self.take_prepared()?;
        if prepared.kind == ScanKind::Still {
            self.finish(prepared, cancel, Ok(())).await?;
            return Err(AcqError::Precondition(
                "A still was prepared, not a rotation.".to_string(),
            ));
        }
        let result = self.run_projections(&prepared, cancel).await;
        self.finish(prepared, cancel, result).await
    }

    async fn run_still(&self, prepared: &PreparedScan, cancel: &CancelFlag) -> AppResult<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.set_state(ScanState::Scanning);
        self.events.status("Scanning");
        self.sequencer.set_shutter(true).await?;
        self.sequencer.start_acquisition().await?;
        tokio::time::sleep(self.timing.settle()).await;
        self.wait_for_collection(prepared, cancel).await
    }

    async fn run_projections(&self, prepared: &PreparedScan, cancel: &CancelFlag) -> AppResult<()> {
        let (Some(profile), Some(programmed)) = (&prepared.profile, &prepared.programmed) else {
            return Err(AcqError::Precondition(
                "Rotation scan prepared without a motion profile.".to_string(),
            ));
        };
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.set_state(ScanState::Moving);
        self.events.status("Moving");
        self.sequencer
            .arm_pulse_generator(&self.pso, programmed)
            .await?;
        tokio::time::sleep(self.timing.settle()).await;
        self.rotation.set_velocity(self.max_speed).await?;
        self.rotation
            .move_to(profile.taxi_start, self.move_timeout)
            .await?;
        self.rotation.set_velocity(profile.motor_speed).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.set_state(ScanState::Scanning);
        self.events.status("Scanning");
        self.sequencer.set_shutter(true).await?;
        self.sequencer.start_acquisition().await?;
        tokio::time::sleep(self.timing.settle()).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.rotation.start_move(profile.taxi_end).await?;
        self.wait_for_collection(prepared, cancel).await
    }

    /// Poll the detector until it disarms, the shutter closes or the scan is cancelled.
    async fn wait_for_collection(&self, prepared: &PreparedScan, cancel: &CancelFlag) -> AppResult<()> {
        // Value the frame source was reset to when the detector was armed.
        let mut last = if prepared.use_array_counter {
            0
        } else {
            prepared.request.frame_start
        };
        let mut counter = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!(frames = counter, "abort requested, leaving acquisition loop");
                break;
            }
            if !self.sequencer.shutter_is_open().await? {
                debug!("shutter closed");
                break;
            }
            if !self.sequencer.detector_armed().await? {
                debug!(frames = counter, "detector disarmed");
                break;
            }
            let frame = self
                .sequencer
                .read_frame_number(prepared.use_array_counter)
                .await?;
            if frame != last {
                last = frame;
                counter += 1;
                self.status.update(|s| {
                    s.frame_number = frame;
                    s.current_frame = counter;
                });
                self.events.emit(ScanEvent::FrameNumberChanged(frame));
                self.events.emit(ScanEvent::FrameCounterChanged(counter));
            }
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
        Ok(())
    }

    async fn finish(
        &self,
        prepared: PreparedScan,
        cancel: &CancelFlag,
        result: AppResult<()>,
    ) -> AppResult<()> {
        let aborted = cancel.is_cancelled();
        if aborted {
            self.set_state(ScanState::Aborting);
        }
        if let Err(err) = &result {
            warn!(error = %err, "scan failed, cleaning up");
        }
        let cleanup = self.finish_scan(&prepared, aborted).await;
        match (result, cleanup) {
            (Err(err), Err(cleanup)) => {
                warn!(error = %cleanup, "cleanup after failed scan also failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), cleanup) => cleanup,
        }
    }

    /// Close the shutter, return the stage, disarm the detector.
    ///
    /// Every step is attempted; the first failure is returned afterwards.
    async fn finish_scan(&self, prepared: &PreparedScan, aborted: bool) -> AppResult<()> {
        self.set_state(ScanState::Finishing);
        self.events.status("Finishing");
        let mut sink = ErrorSink::default();

        sink.record("close shutter", self.sequencer.set_shutter(false).await);
        tokio::time::sleep(self.timing.settle()).await;

        if let Some(profile) = &prepared.profile {
            sink.record(
                "disable pulse generator",
                self.sequencer.disable_pulse_generator(&self.pso).await,
            );
            sink.record(
                "restore speed",
                self.rotation.set_velocity(self.max_speed).await,
            );
            let returning = sink.record(
                "return to start",
                self.rotation.start_move(profile.start).await,
            );
            if returning.is_some() {
                sink.record(
                    "wait for start",
                    self.rotation
                        .wait_until_at(
                            profile.start,
                            self.timing.readback_timeout(),
                            self.timing.readback_poll(),
                        )
                        .await,
                );
            }

            if prepared.sum_frames && !aborted {
                let request = &prepared.request;
                info!(filename = %request.filename, "frames ready for conversion");
                self.events
                    .emit(ScanEvent::ReadyForConversion(ConversionRequest {
                        directory: request.target_directory(),
                        filename: request.filename.clone(),
                        first_frame: request.frame_start,
                        frames: profile.num_angles,
                        exposure: request.exposure,
                        start: profile.start,
                        end: profile.end,
                        step: profile.rotation_step,
                    }));
            }
        }

        match self.sequencer.detector_armed().await {
            Ok(true) => {
                sink.record("stop acquisition", self.sequencer.stop_acquisition().await);
            }
            Ok(false) => {}
            Err(err) => {
                sink.record::<()>("read armed", Err(err));
            }
        }
        sink.record(
            "disarm detector",
            self.sequencer.disarm(&prepared.detector).await,
        );

        self.status.update(|s| {
            s.is_running = false;
            s.current_frame = 0;
        });
        self.events.emit(ScanEvent::RunningChanged(false));
        self.events.emit(ScanEvent::FrameCounterChanged(0));
        self.events.status("Finished");
        self.set_state(ScanState::Idle);
        info!(aborted, "scan finished");
        sink.finish()
    }
}
