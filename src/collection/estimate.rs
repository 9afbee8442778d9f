//! Frame and duration estimates shown before a collection starts.

use crate::scan::{ScanKind, ScanRequest};

/// Fixed overhead of a step collection in seconds (settle delays and readback waits).
const STEP_OVERHEAD_S: f64 = 2.0;
/// Fixed overhead of a still or wide collection in seconds.
const SINGLE_FRAME_OVERHEAD_S: f64 = 1.5;

/// Frames one scan of `request` produces.
pub fn total_frames(request: &ScanRequest) -> u32 {
    match (request.kind(), request.start, request.end, request.step) {
        (Ok(ScanKind::Step), Some(start), Some(end), Some(step)) if step > 0.0 => {
            ((end - start).abs() / step).round_ties_even() as u32
        }
        _ => 1,
    }
}

/// Collections a run performs; a run without enabled points is one collection.
pub fn total_collections(enabled_points: usize) -> u32 {
    u32::try_from(enabled_points).unwrap_or(u32::MAX).max(1)
}

/// Estimated seconds for one scan.
pub fn scan_duration(request: &ScanRequest) -> f64 {
    match request.kind() {
        Ok(ScanKind::Step) => f64::from(total_frames(request)) * request.exposure + STEP_OVERHEAD_S,
        _ => request.exposure + SINGLE_FRAME_OVERHEAD_S,
    }
}

/// Estimated seconds for the whole run.
pub fn run_duration(request: &ScanRequest, enabled_points: usize) -> f64 {
    f64::from(total_collections(enabled_points)) * scan_duration(request)
}
