//! Outbound notifications.
//!
//! Everything the acquisition core reports to a front-end or to the format
//! conversion layer goes through one broadcast channel. Notifications are fire
//! and forget: with no subscribers they are dropped, and a lagging subscriber
//! loses the oldest events rather than blocking a scan.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::coordinator::Geometry;
use crate::monitor::Readbacks;
use crate::scan::ScanState;

/// Capacity of the event channel.
pub const EVENT_CAPACITY: usize = 1024;

/// Parameters handed to the format-conversion layer once an accumulated step
/// collection has finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionRequest {
    /// Directory the frames were written to (user namespace)
    pub directory: String,
    /// Base file name of the frames
    pub filename: String,
    /// First frame number
    pub first_frame: i64,
    /// Number of frames collected
    pub frames: u32,
    /// Exposure per frame
    pub exposure: f64,
    /// Start angle
    pub start: f64,
    /// End angle
    pub end: f64,
    /// Effective rotation step
    pub step: f64,
}

/// Notification emitted by the acquisition core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Human readable status ("Preparing", "Scanning", "Finished", ...)
    StatusMessage(String),
    /// A scan started or stopped running
    RunningChanged(bool),
    /// Scan state machine transition
    StateChanged(ScanState),
    /// Latest frame number reported by the detector
    FrameNumberChanged(i64),
    /// Frames seen in the current scan
    FrameCounterChanged(u32),
    /// Frames expected per scan
    TotalFramesChanged(u32),
    /// Collection point progress, 1-based; 0 when idle
    CollectionChanged {
        /// Current point
        current: u32,
        /// Enabled points
        total: u32,
    },
    /// An error the operator should see
    ErrorMessage(String),
    /// Frames are ready for format conversion
    ReadyForConversion(ConversionRequest),
    /// Estimated total duration in seconds
    EstimatedTimeChanged(f64),
    /// Seconds since the collection started
    Elapsed(f64),
    /// Periodic motor and shutter readbacks
    Readbacks(Readbacks),
    /// A geometry move started or ended
    GeometryMoving {
        /// Target geometry
        geometry: Geometry,
        /// Whether the move is in progress
        moving: bool,
    },
}

/// Broadcast bus for [`ScanEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScanEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// New bus with [`EVENT_CAPACITY`] slots.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event.
    pub fn emit(&self, event: ScanEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Report an error to the operator and mirror it in the status line.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(%message, "reported to operator");
        self.emit(ScanEvent::StatusMessage(message.clone()));
        self.emit(ScanEvent::ErrorMessage(message));
    }

    /// Publish a status message.
    pub fn status(&self, message: impl Into<String>) {
        self.emit(ScanEvent::StatusMessage(message.into()));
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}
