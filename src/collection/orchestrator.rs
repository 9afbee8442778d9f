//! Single and multi-point collections.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::collection::estimate;
use crate::collection::points::{CollectionPoint, CollectionPoints};
use crate::config::{Settings, TimingConfig};
use crate::coordinator::{ActiveOperation, CancelFlag, Coordinator, Geometry, GeometryMover};
use crate::error::{AcqError, AppResult, ErrorSink};
use crate::events::{EventBus, ScanEvent};
use crate::hardware::motor::{round4, Motor};
use crate::hardware::pv::PvClient;
use crate::monitor;
use crate::scan::{RunStatus, ScanEngine, ScanKind, ScanRequest};

/// How a collection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every enabled point was collected
    Completed,
    /// The operator aborted the run
    Aborted,
    /// A limit or precondition check refused the run; details were reported as an error event
    Rejected,
}

/// Sample stage position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePosition {
    /// Horizontal
    pub x: f64,
    /// Vertical
    pub y: f64,
    /// Focus
    pub z: f64,
}

/// Runs collections over the configured points.
pub struct Collector {
    engine: Arc<ScanEngine>,
    coordinator: Coordinator,
    geometry: GeometryMover,
    x: Motor,
    y: Motor,
    z: Motor,
    points: Mutex<CollectionPoints>,
    events: EventBus,
    status: RunStatus,
    timing: TimingConfig,
    move_timeout: Duration,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("points", &*self.points.lock())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Collector driving `engine` and the sample stage named in `settings`.
    pub fn new(
        engine: Arc<ScanEngine>,
        coordinator: Coordinator,
        geometry: GeometryMover,
        pvs: PvClient,
        settings: &Settings,
        events: EventBus,
        status: RunStatus,
    ) -> Self {
        let stage = &settings.sample_stage;
        Self {
            engine,
            coordinator,
            geometry,
            x: Motor::new(stage.x.clone(), pvs.clone()),
            y: Motor::new(stage.y.clone(), pvs.clone()),
            z: Motor::new(stage.z.clone(), pvs),
            points: Mutex::new(CollectionPoints::new()),
            events,
            status,
            timing: settings.timing.clone(),
            move_timeout: settings.geometry.move_timeout(),
        }
    }

    /// Add a point.
    pub fn add_point(
        &self,
        name: impl Into<String>,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
    ) -> AppResult<()> {
        self.points.lock().add_point(name, x, y, z)
    }

    /// Add the current sample position as an automatically named point.
    pub async fn add_current_position(&self) -> AppResult<String> {
        let position = self.stage_position().await?;
        let mut points = self.points.lock();
        let name = points.next_auto_name();
        points.add_point(
            name.clone(),
            Some(round4(position.x)),
            Some(round4(position.y)),
            Some(round4(position.z)),
        )?;
        Ok(name)
    }

    /// Remove a point.
    pub fn delete_point(&self, name: &str) -> AppResult<CollectionPoint> {
        self.points.lock().delete_point(name)
    }

    /// Remove every point.
    pub fn clear_points(&self) {
        self.points.lock().clear_points();
    }

    /// Enable or disable a point.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> AppResult<()> {
        self.points.lock().set_enabled(name, enabled)
    }

    /// Enable or disable every point.
    pub fn enable_all(&self, enabled: bool) {
        self.points.lock().enable_all(enabled);
    }

    /// Copy of the point list.
    pub fn points(&self) -> CollectionPoints {
        self.points.lock().clone()
    }

    /// Publish frame, collection and duration estimates for `request`.
    pub fn publish_estimates(&self, request: &ScanRequest) -> f64 {
        let enabled = self.points.lock().enabled().count();
        let frames = estimate::total_frames(request);
        let collections = estimate::total_collections(enabled);
        let seconds = estimate::run_duration(request, enabled);
        self.status.update(|s| {
            s.total_frames = frames;
            s.total_collections = collections;
        });
        self.events.emit(ScanEvent::TotalFramesChanged(frames));
        self.events.emit(ScanEvent::CollectionChanged {
            current: 0,
            total: collections,
        });
        self.events.emit(ScanEvent::EstimatedTimeChanged(seconds));
        seconds
    }

    /// Abort the running collection. Returns `false` when none is running.
    pub fn abort(&self) -> bool {
        if !self.coordinator.cancel(ActiveOperation::Collection) {
            return false;
        }
        warn!("collection abort requested");
        self.status.update(|s| s.aborted = true);
        self.engine.mark_aborting();
        true
    }

    async fn stage_position(&self) -> AppResult<StagePosition> {
        Ok(StagePosition {
            x: self.x.readback().await?,
            y: self.y.readback().await?,
            z: self.z.readback().await?,
        })
    }

    /// Collect `request` at every enabled point, or once where the stage is
    /// when no points are defined.
    #[instrument(skip(self, request), fields(filename = %request.filename))]
    pub async fn collect(&self, request: ScanRequest) -> AppResult<RunOutcome> {
        let guard = self.coordinator.try_acquire(ActiveOperation::Collection)?;
        let cancel = guard.cancel_flag().clone();
        self.status.update(|s| {
            s.collecting = true;
            s.aborted = false;
            s.run_id = Some(Uuid::new_v4());
            s.started_at = Some(Utc::now());
            s.frame_number = request.frame_start;
        });
        let ticker = monitor::spawn_elapsed_ticker(
            self.status.clone(),
            self.events.clone(),
            self.timing.elapsed_tick(),
        );

        let result = self.run(&request, &cancel).await;

        self.status.update(|s| {
            s.collecting = false;
            s.current_collection_index = 0;
        });
        let total = self.status.snapshot().total_collections;
        self.events
            .emit(ScanEvent::CollectionChanged { current: 0, total });
        ticker.abort();

        match &result {
            Ok(outcome) => info!(?outcome, "collection ended"),
            Err(err) => self.events.error(err.to_string()),
        }
        drop(guard);
        result
    }

    fn reject(&self, err: AcqError) -> RunOutcome {
        self.events.error(err.to_string());
        RunOutcome::Rejected
    }

    fn set_collection(&self, current: u32, total: u32) {
        self.status.update(|s| {
            s.current_collection_index = current;
            s.total_collections = total;
        });
        self.events
            .emit(ScanEvent::CollectionChanged { current, total });
    }

    async fn run(&self, request: &ScanRequest, cancel: &CancelFlag) -> AppResult<RunOutcome> {
        let kind = match request.kind() {
            Ok(kind) => kind,
            Err(err) if err.is_rejection() => return Ok(self.reject(err)),
            Err(err) => return Err(err),
        };
        if !self.geometry.is_at(Geometry::Xrd).await? {
            return Ok(self.reject(AcqError::Precondition(
                "First move to XRD position.".to_string(),
            )));
        }
        if let (true, Some(start), Some(end), Some(step)) = (
            request.step_exceeds_range(),
            request.start,
            request.end,
            request.step,
        ) {
            return Ok(self.reject(AcqError::StepExceedsRange {
                step,
                range: (end - start).abs(),
            }));
        }

        self.engine
            .sequencer()
            .set_file_names(&request.filename)
            .await?;
        self.publish_estimates(request);

        let (has_points, enabled): (bool, Vec<CollectionPoint>) = {
            let points = self.points.lock();
            (!points.is_empty(), points.enabled().cloned().collect())
        };
        let restart_numbering = self.engine.accumulate() && kind == ScanKind::Step;

        if !has_points {
            let frame_start = if restart_numbering {
                1
            } else {
                request.frame_start
            };
            self.set_collection(1, 1);
            let single = request.clone().with_frame_start(frame_start);
            return self.run_point(&single, cancel).await;
        }

        self.run_points(request, &enabled, restart_numbering, cancel)
            .await
    }

    async fn run_point(&self, request: &ScanRequest, cancel: &CancelFlag) -> AppResult<RunOutcome> {
        if self.engine.prepare_scan(request).await? {
            return Ok(RunOutcome::Rejected);
        }
        self.engine.collect_prepared(cancel).await?;
        Ok(if cancel.is_cancelled() {
            RunOutcome::Aborted
        } else {
            RunOutcome::Completed
        })
    }

    async fn run_points(
        &self,
        request: &ScanRequest,
        points: &[CollectionPoint],
        restart_numbering: bool,
        cancel: &CancelFlag,
    ) -> AppResult<RunOutcome> {
        let home = self.stage_position().await?;
        let total = estimate::total_collections(points.len());
        info!(points = points.len(), ?home, "multi-point collection");

        let mut next_frame = request.frame_start;
        let mut result = Ok(RunOutcome::Completed);
        for (index, point) in points.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            self.set_collection(index as u32 + 1, total);
            let target = StagePosition {
                x: point.x.unwrap_or(home.x),
                y: point.y.unwrap_or(home.y),
                z: point.z.unwrap_or(home.z),
            };
            match self.move_to_point(&point.name, target).await {
                Ok(()) => {}
                Err(err) if err.is_rejection() => {
                    result = Ok(self.reject(err));
                    break;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }

            let frame_start = if restart_numbering { 1 } else { next_frame };
            let point_request = request.for_point(&point.name, frame_start);
            match self.run_point(&point_request, cancel).await {
                Ok(RunOutcome::Completed) => {}
                Ok(outcome) => {
                    result = Ok(outcome);
                    break;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
            if !restart_numbering {
                next_frame = self.engine.sequencer().read_frame_number(false).await?;
            }
        }

        tokio::time::sleep(self.timing.settle()).await;
        let restored = self.restore_position(home).await;
        match (result, restored) {
            (Ok(RunOutcome::Completed), Ok(())) if cancel.is_cancelled() => Ok(RunOutcome::Aborted),
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), restored) => {
                if let Err(restore) = restored {
                    warn!(error = %restore, "sample stage not restored");
                }
                Err(err)
            }
        }
    }

    /// Move to a point after checking every axis against its limits.
    async fn move_to_point(&self, name: &str, target: StagePosition) -> AppResult<()> {
        self.events.status("Moving");
        self.x.check_limits(Some(target.x)).await?;
        self.y.check_limits(Some(target.y)).await?;
        self.z.check_limits(Some(target.z)).await?;
        info!(point = name, ?target, "moving to point");
        self.x.move_to(target.x, self.move_timeout).await?;
        self.y.move_to(target.y, self.move_timeout).await?;
        self.z.move_to(target.z, self.move_timeout).await
    }

    async fn restore_position(&self, home: StagePosition) -> AppResult<()> {
        self.events.status("Moving");
        let mut sink = ErrorSink::default();
        sink.record("restore x", self.x.move_to(home.x, self.move_timeout).await);
        sink.record("restore y", self.y.move_to(home.y, self.move_timeout).await);
        sink.record("restore z", self.z.move_to(home.z, self.move_timeout).await);
        self.events.status("Finished");
        info!(?home, "sample stage restored");
        sink.finish()
    }
}
