use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// States of a single scan.
///
/// ```text
/// Idle -> Preparing -> (Moving ->) Scanning -> Finishing -> Idle
///             \            \           \
///              +------------+-----------+--> Aborting -> Finishing
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Planning, limit checks and programming
    Preparing,
    /// Rotation stage travelling to the taxi start
    Moving,
    /// Shutter open, frames being taken
    Scanning,
    /// Cleanup in progress
    Finishing,
    /// Abort requested; cleanup follows
    Aborting,
}

impl ScanState {
    /// States an abort request can interrupt.
    pub fn is_abortable(self) -> bool {
        matches!(
            self,
            ScanState::Preparing | ScanState::Moving | ScanState::Scanning
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScanState::Idle => "Idle",
            ScanState::Preparing => "Preparing",
            ScanState::Moving => "Moving",
            ScanState::Scanning => "Scanning",
            ScanState::Finishing => "Finishing",
            ScanState::Aborting => "Aborting",
        };
        f.write_str(text)
    }
}

/// Progress of the current invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    /// A scan is between `Preparing` and `Idle`
    pub is_running: bool,
    /// The current collection was aborted
    pub aborted: bool,
    /// Frames seen in the current scan
    pub current_frame: u32,
    /// Latest detector frame number
    pub frame_number: i64,
    /// Frames expected per scan
    pub total_frames: u32,
    /// Current collection point, 1-based; 0 when idle
    pub current_collection_index: u32,
    /// Enabled collection points
    pub total_collections: u32,
    /// A collection (single or multi-point) is in progress
    pub collecting: bool,
    /// Identifier of the current collection
    pub run_id: Option<Uuid>,
    /// When the current collection started
    pub started_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Seconds since the collection started.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Whether observers should consider the beamline busy.
    pub fn is_active(&self) -> bool {
        self.is_running || self.collecting
    }
}

/// Shared, observable [`RunState`].
#[derive(Debug, Clone)]
pub struct RunStatus {
    tx: Arc<watch::Sender<RunState>>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatus {
    /// Idle status.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> RunState {
        self.tx.borrow().clone()
    }

    /// Mutate the state and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut RunState)) {
        self.tx.send_modify(f);
    }

    /// Watch for changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }
}
