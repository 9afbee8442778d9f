//! Exclusive operations and cooperative cancellation.
//!
//! Only one hardware operation may be in flight: a collection, or a detector
//! geometry move. [`Coordinator`] holds a single slot tagged with the active
//! [`ActiveOperation`]; acquiring it yields an [`OperationGuard`] that frees
//! the slot when dropped, on every exit path.
//!
//! Every operation gets its own [`CancelFlag`]. Long-running code checks the
//! flag at loop heads and before hardware writes. Blocking hardware calls that
//! are already in progress are allowed to complete.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::GeometryConfig;
use crate::error::{AcqError, AppResult};
use crate::events::{EventBus, ScanEvent};
use crate::hardware::motor::{round4, Motor};
use crate::hardware::pv::PvClient;
use crate::sequencer::Sequencer;

/// Cooperative cancellation signal shared between a task and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Operation holding the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveOperation {
    /// Single or multi-point collection
    Collection,
    /// Detector move to the tomography geometry
    MoveToTomo,
    /// Detector move to the diffraction geometry
    MoveToXrd,
}

impl fmt::Display for ActiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveOperation::Collection => write!(f, "collection"),
            ActiveOperation::MoveToTomo => write!(f, "move to tomo"),
            ActiveOperation::MoveToXrd => write!(f, "move to XRD"),
        }
    }
}

type Slot = Arc<Mutex<Option<(ActiveOperation, CancelFlag)>>>;

/// Grants exclusive access to the hardware.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    slot: Slot,
}

impl Coordinator {
    /// Empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the hardware for `op`, failing with `Busy` if anything else holds it.
    pub fn try_acquire(&self, op: ActiveOperation) -> AppResult<OperationGuard> {
        let mut slot = self.slot.lock();
        if let Some((active, _)) = slot.as_ref() {
            return Err(AcqError::Busy(*active));
        }
        let cancel = CancelFlag::new();
        *slot = Some((op, cancel.clone()));
        info!(operation = %op, "operation started");
        Ok(OperationGuard {
            slot: Arc::clone(&self.slot),
            op,
            cancel,
        })
    }

    /// Operation currently holding the hardware.
    pub fn active(&self) -> Option<ActiveOperation> {
        self.slot.lock().as_ref().map(|(op, _)| *op)
    }

    /// Cancel `op` if it is the active operation.
    pub fn cancel(&self, op: ActiveOperation) -> bool {
        match self.slot.lock().as_ref() {
            Some((active, cancel)) if *active == op => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Exclusive claim on the hardware. Dropping it frees the slot.
#[derive(Debug)]
pub struct OperationGuard {
    slot: Slot,
    op: ActiveOperation,
    cancel: CancelFlag,
}

impl OperationGuard {
    /// Operation this guard was acquired for.
    pub fn operation(&self) -> ActiveOperation {
        self.op
    }

    /// Cancellation flag of this operation.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.slot.lock() = None;
        info!(operation = %self.op, "operation released");
    }
}

/// Detector stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Geometry {
    /// Detector behind the sample for imaging
    Tomo,
    /// Detector positioned for diffraction
    Xrd,
}

impl Geometry {
    fn operation(self) -> ActiveOperation {
        match self {
            Geometry::Tomo => ActiveOperation::MoveToTomo,
            Geometry::Xrd => ActiveOperation::MoveToXrd,
        }
    }

    /// Target `(x, z)` of the detector stage.
    pub fn target(self, config: &GeometryConfig) -> (f64, f64) {
        match self {
            Geometry::Tomo => (config.tomo_x, config.tomo_z),
            Geometry::Xrd => (config.xrd_x, config.xrd_z),
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Tomo => write!(f, "Tomo"),
            Geometry::Xrd => write!(f, "XRD"),
        }
    }
}

/// Outcome of a geometry request.
#[derive(Debug)]
pub enum GeometryRequest {
    /// A move was launched
    Started(JoinHandle<AppResult<()>>),
    /// The same move was running; a stop was requested
    StopRequested,
    /// Another operation holds the hardware
    Ignored(ActiveOperation),
}

/// Moves the detector stage between geometries.
#[derive(Debug, Clone)]
pub struct GeometryMover {
    coordinator: Coordinator,
    pvs: PvClient,
    sequencer: Sequencer,
    detector_x: Motor,
    detector_z: Motor,
    config: GeometryConfig,
    events: EventBus,
}

impl GeometryMover {
    /// Mover for the detector stage named in `config`.
    pub fn new(
        coordinator: Coordinator,
        pvs: PvClient,
        sequencer: Sequencer,
        config: GeometryConfig,
        events: EventBus,
    ) -> Self {
        Self {
            detector_x: Motor::new(config.detector_x.clone(), pvs.clone()),
            detector_z: Motor::new(config.detector_z.clone(), pvs.clone()),
            coordinator,
            pvs,
            sequencer,
            config,
            events,
        }
    }

    /// Whether the detector stage sits at `geometry` (to 4 decimals).
    pub async fn is_at(&self, geometry: Geometry) -> AppResult<bool> {
        let (x, z) = geometry.target(&self.config);
        Ok(round4(self.detector_x.readback().await?) == round4(x)
            && round4(self.detector_z.readback().await?) == round4(z))
    }

    /// Start a move to `geometry`, or stop it if that move is already running.
    ///
    /// Refused while the shutter is open.
    pub async fn request(&self, geometry: Geometry) -> AppResult<GeometryRequest> {
        let op = geometry.operation();
        match self.coordinator.active() {
            Some(active) if active == op => {
                self.stop(geometry).await?;
                return Ok(GeometryRequest::StopRequested);
            }
            Some(active) => {
                info!(requested = %op, %active, "geometry request ignored");
                return Ok(GeometryRequest::Ignored(active));
            }
            None => {}
        }

        if self.sequencer.shutter_is_open().await? {
            let err = AcqError::Precondition(format!(
                "Can't move to {} when the shutter is open!",
                geometry
            ));
            self.events.error(err.to_string());
            return Err(err);
        }

        let guard = match self.coordinator.try_acquire(op) {
            Ok(guard) => guard,
            Err(AcqError::Busy(active)) => return Ok(GeometryRequest::Ignored(active)),
            Err(err) => return Err(err),
        };
        let mover = self.clone();
        Ok(GeometryRequest::Started(tokio::spawn(async move {
            mover.run(geometry, guard).await
        })))
    }

    async fn stop(&self, geometry: Geometry) -> AppResult<()> {
        warn!(%geometry, "stopping geometry move");
        self.events.status("Aborting");
        self.coordinator.cancel(geometry.operation());
        for key in &self.config.all_stop {
            self.pvs.put(key, 1).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, guard))]
    async fn run(self, geometry: Geometry, guard: OperationGuard) -> AppResult<()> {
        self.events.emit(ScanEvent::GeometryMoving {
            geometry,
            moving: true,
        });
        self.events.status(format!("Moving to {}", geometry));

        let result = self.drive(geometry, guard.cancel_flag()).await;
        if let Err(err) = &result {
            self.events.error(err.to_string());
        }

        // Absorb repeated stop requests before the move can be requested again.
        tokio::time::sleep(self.config.abort_settle()).await;
        self.events.emit(ScanEvent::GeometryMoving {
            geometry,
            moving: false,
        });
        self.events.status("Idle");
        drop(guard);
        result
    }

    async fn drive(&self, geometry: Geometry, cancel: &CancelFlag) -> AppResult<()> {
        let timeout = self.config.move_timeout();
        let (x, z) = geometry.target(&self.config);

        if cancel.is_cancelled() {
            return Ok(());
        }
        self.detector_z.move_to(self.config.detector_out, timeout).await?;

        if round4(self.detector_z.readback().await?) != round4(self.config.detector_out) {
            warn!(%geometry, "detector did not retract; staying put");
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.detector_x.move_to(x, timeout).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.detector_z.move_to(z, timeout).await?;
        info!(%geometry, "detector in position");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_slot() {
        let coordinator = Coordinator::new();
        let guard = coordinator.try_acquire(ActiveOperation::Collection).unwrap();
        assert!(matches!(
            coordinator.try_acquire(ActiveOperation::MoveToXrd),
            Err(AcqError::Busy(ActiveOperation::Collection))
        ));
        assert_eq!(coordinator.active(), Some(ActiveOperation::Collection));

        assert!(!coordinator.cancel(ActiveOperation::MoveToTomo));
        assert!(coordinator.cancel(ActiveOperation::Collection));
        assert!(guard.cancel_flag().is_cancelled());

        drop(guard);
        assert_eq!(coordinator.active(), None);
        let next = coordinator.try_acquire(ActiveOperation::MoveToTomo).unwrap();
        assert!(!next.cancel_flag().is_cancelled());
    }
}
