//! Background pollers: motor and shutter readbacks, and the elapsed-time ticker.

use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{motor_field, Settings};
use crate::error::AppResult;
use crate::events::{EventBus, ScanEvent};
use crate::hardware::pv::PvClient;
use crate::scan::RunStatus;

/// Snapshot of the positions an operator watches during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readbacks {
    /// Detector stage X
    pub detector_x: f64,
    /// Detector stage Z
    pub detector_z: f64,
    /// Sample stage X
    pub sample_x: f64,
    /// Sample stage Y
    pub sample_y: f64,
    /// Sample stage Z
    pub sample_z: f64,
    /// Rotation axis
    pub rotation: f64,
    /// Shutter state
    pub shutter_open: bool,
}

#[derive(Debug, Clone)]
struct ReadbackKeys {
    detector_x: String,
    detector_z: String,
    sample_x: String,
    sample_y: String,
    sample_z: String,
    rotation: String,
    shutter: String,
}

impl ReadbackKeys {
    fn new(settings: &Settings) -> Self {
        let rbv = |motor: &str| format!("{motor}.{}", motor_field::RBV);
        Self {
            detector_x: rbv(&settings.geometry.detector_x),
            detector_z: rbv(&settings.geometry.detector_z),
            sample_x: rbv(&settings.sample_stage.x),
            sample_y: rbv(&settings.sample_stage.y),
            sample_z: rbv(&settings.sample_stage.z),
            rotation: rbv(&settings.rotation.motor),
            shutter: settings.shutter.pv.clone(),
        }
    }

    async fn read(&self, pvs: &PvClient) -> AppResult<Readbacks> {
        Ok(Readbacks {
            detector_x: pvs.get_f64(&self.detector_x).await?,
            detector_z: pvs.get_f64(&self.detector_z).await?,
            sample_x: pvs.get_f64(&self.sample_x).await?,
            sample_y: pvs.get_f64(&self.sample_y).await?,
            sample_z: pvs.get_f64(&self.sample_z).await?,
            rotation: pvs.get_f64(&self.rotation).await?,
            shutter_open: pvs.get_i64(&self.shutter).await? == 1,
        })
    }
}

/// Polls readbacks and publishes them when they change.
///
/// The poller runs until [`StatusMonitor::stop`] is called or the monitor is
/// dropped. Read failures are logged and polling continues.
#[derive(Debug)]
pub struct StatusMonitor {
    handle: JoinHandle<()>,
}

impl StatusMonitor {
    /// Start polling every `interval`.
    pub fn spawn(pvs: PvClient, settings: &Settings, events: EventBus, interval: Duration) -> Self {
        let keys = ReadbackKeys::new(settings);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last: Option<Readbacks> = None;
            loop {
                ticker.tick().await;
                match keys.read(&pvs).await {
                    Ok(current) if last.as_ref() != Some(&current) => {
                        events.emit(ScanEvent::Readbacks(current.clone()));
                        last = Some(current);
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "readback poll failed"),
                }
            }
        });
        debug!(?interval, "status monitor started");
        Self { handle }
    }

    /// Stop polling.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Emit [`ScanEvent::Elapsed`] every `interval` while a run is active.
pub fn spawn_elapsed_ticker(status: RunStatus, events: EventBus, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let state = status.snapshot();
            if !state.is_active() {
                break;
            }
            if let Some(elapsed) = state.elapsed_secs(chrono::Utc::now()) {
                events.emit(ScanEvent::Elapsed(elapsed));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedBeamline;

    #[tokio::test]
    async fn test_monitor_publishes_changes_only() {
        let settings = Settings::default();
        let sim = SimulatedBeamline::new(&settings);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let monitor = StatusMonitor::spawn(
            sim.client(),
            &settings,
            events.clone(),
            Duration::from_millis(5),
        );

        let first = match rx.recv().await.unwrap() {
            ScanEvent::Readbacks(r) => r,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(!first.shutter_open);

        sim.set_value(&settings.shutter.pv, 1);
        let second = loop {
            if let ScanEvent::Readbacks(r) = rx.recv().await.unwrap() {
                break r;
            }
        };
        assert!(second.shutter_open);
        assert_eq!(second.rotation, first.rotation);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_monitor_survives_read_failure() {
        let settings = Settings::default();
        let sim = SimulatedBeamline::new(&settings);
        sim.fail_key(&settings.shutter.pv);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let _monitor = StatusMonitor::spawn(
            sim.client(),
            &settings,
            events.clone(),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        sim.clear_faults();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ScanEvent::Readbacks(_)));
    }
}
