//! Application façade.
//!
//! [`AcquisitionApp`] wires the event bus, run status, scan engine,
//! collector, geometry mover and status monitor around one process-variable
//! client. Front-ends talk to this type only.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::collection::{CollectionPoints, Collector, RunOutcome};
use crate::config::Settings;
use crate::coordinator::{ActiveOperation, Coordinator, Geometry, GeometryMover, GeometryRequest};
use crate::error::{AcqError, AppResult};
use crate::events::{EventBus, ScanEvent};
use crate::hardware::pv::PvClient;
use crate::monitor::StatusMonitor;
use crate::scan::{RunState, RunStatus, ScanEngine, ScanRequest, ScanState};

/// Connected acquisition system.
#[derive(Debug)]
pub struct AcquisitionApp {
    settings: Settings,
    pvs: PvClient,
    events: EventBus,
    status: RunStatus,
    coordinator: Coordinator,
    engine: Arc<ScanEngine>,
    collector: Arc<Collector>,
    geometry: GeometryMover,
    monitor: Option<StatusMonitor>,
}

impl AcquisitionApp {
    /// Validate `settings` and connect every component to `pvs`.
    pub async fn connect(pvs: PvClient, settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let events = EventBus::new();
        let status = RunStatus::new();
        let coordinator = Coordinator::new();

        let engine = Arc::new(
            ScanEngine::connect(pvs.clone(), &settings, events.clone(), status.clone()).await?,
        );
        let geometry = GeometryMover::new(
            coordinator.clone(),
            pvs.clone(),
            engine.sequencer().clone(),
            settings.geometry.clone(),
            events.clone(),
        );
        let collector = Arc::new(Collector::new(
            Arc::clone(&engine),
            coordinator.clone(),
            geometry.clone(),
            pvs.clone(),
            &settings,
            events.clone(),
            status.clone(),
        ));
        info!(name = %settings.application.name, "acquisition system connected");

        Ok(Self {
            settings,
            pvs,
            events,
            status,
            coordinator,
            engine,
            collector,
            geometry,
            monitor: None,
        })
    }

    /// Start publishing readbacks. Does nothing if the monitor already runs.
    pub fn start_monitor(&mut self) {
        if self.monitor.is_none() {
            self.monitor = Some(StatusMonitor::spawn(
                self.pvs.clone(),
                &self.settings,
                self.events.clone(),
                self.settings.timing.status_poll(),
            ));
        }
    }

    /// Stop publishing readbacks.
    pub fn stop_monitor(&mut self) {
        self.monitor = None;
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Current run status.
    pub fn run_state(&self) -> RunState {
        self.status.snapshot()
    }

    /// Watch run status changes.
    pub fn subscribe_run_state(&self) -> watch::Receiver<RunState> {
        self.status.subscribe()
    }

    /// Current scan state.
    pub fn scan_state(&self) -> ScanState {
        self.engine.state()
    }

    /// Operation holding the hardware, if any.
    pub fn active_operation(&self) -> Option<ActiveOperation> {
        self.coordinator.active()
    }

    /// Scan engine.
    pub fn engine(&self) -> &Arc<ScanEngine> {
        &self.engine
    }

    /// Collector and its point list.
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Run a collection to completion.
    pub async fn collect(&self, request: ScanRequest) -> AppResult<RunOutcome> {
        self.collector.collect(request).await
    }

    /// Start a collection in the background.
    ///
    /// Fails with `Busy` when another operation holds the hardware.
    pub fn start_collection(
        &self,
        request: ScanRequest,
    ) -> AppResult<JoinHandle<AppResult<RunOutcome>>> {
        if let Some(active) = self.coordinator.active() {
            return Err(AcqError::Busy(active));
        }
        let collector = Arc::clone(&self.collector);
        Ok(tokio::spawn(async move { collector.collect(request).await }))
    }

    /// Abort the running collection.
    pub fn abort(&self) -> bool {
        self.collector.abort()
    }

    /// Move the detector to `geometry`, or stop that move if it is running.
    pub async fn move_to_geometry(&self, geometry: Geometry) -> AppResult<GeometryRequest> {
        self.geometry.request(geometry).await
    }

    /// Whether the detector sits at `geometry`.
    pub async fn is_at(&self, geometry: Geometry) -> AppResult<bool> {
        self.geometry.is_at(geometry).await
    }

    /// Open or close the shutter.
    pub async fn toggle_shutter(&self, open: bool) -> AppResult<()> {
        self.engine.toggle_shutter(open).await
    }

    /// Enable or disable summing of step frames.
    pub fn set_accumulate(&self, enabled: bool) {
        self.engine.set_accumulate(enabled);
    }

    /// Publish and return the estimated duration of `request`.
    pub fn estimate(&self, request: &ScanRequest) -> f64 {
        self.collector.publish_estimates(request)
    }

    /// Copy of the point list.
    pub fn points(&self) -> CollectionPoints {
        self.collector.points()
    }
}
