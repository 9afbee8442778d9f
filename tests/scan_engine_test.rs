//! Scan engine against the simulated beamline.

use std::sync::Arc;
use tokio::sync::broadcast;

use tomo_xrd::config::Settings;
use tomo_xrd::coordinator::CancelFlag;
use tomo_xrd::events::{EventBus, ScanEvent};
use tomo_xrd::hardware::{PvValue, SimulatedBeamline};
use tomo_xrd::scan::{RunStatus, ScanEngine, ScanRequest, ScanState};
use tomo_xrd::AcqError;

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.timing.settle_ms = 1;
    settings.timing.poll_interval_ms = 1;
    settings.timing.readback_poll_ms = 1;
    settings.paths.create_directories = false;
    settings
}

async fn connect(settings: &Settings) -> (SimulatedBeamline, Arc<ScanEngine>, EventBus, RunStatus) {
    let sim = SimulatedBeamline::new(settings);
    let events = EventBus::new();
    let status = RunStatus::new();
    let engine = ScanEngine::connect(sim.client(), settings, events.clone(), status.clone())
        .await
        .expect("engine connects to the simulator");
    (sim, Arc::new(engine), events, status)
}

fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states(events: &[ScanEvent]) -> Vec<ScanState> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_step_scan_programs_window_and_hands_off_frames() {
    let settings = fast_settings();
    let (sim, engine, events, status) = connect(&settings).await;
    let mut rx = events.subscribe();
    sim.clear_log();

    let request = ScanRequest::rotation(1.0, 0.0, 80.0, Some(0.5), "sample", "/data/run1/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    assert_eq!(engine.state(), ScanState::Preparing);
    engine.collect_prepared(&CancelFlag::new()).await.unwrap();

    let commands = sim.pso_commands();
    assert!(commands.contains(&"PSODISTANCE X FIXED 500".to_string()));
    assert!(commands.contains(&"PSOWINDOW X 1 RANGE -255,79755".to_string()));
    assert_eq!(
        sim.puts_to(&settings.pso.counts_per_step()),
        vec![PvValue::Int(500)]
    );
    assert_eq!(
        sim.puts_to(&settings.pso.start_taxi()),
        vec![PvValue::Float(-0.5)]
    );

    let rotation_rbv = format!("{}.RBV", settings.rotation.motor);
    assert_eq!(sim.value(&rotation_rbv), Some(PvValue::Float(0.0)));
    assert_eq!(sim.value(&settings.shutter.pv), Some(PvValue::Int(0)));
    assert_eq!(
        sim.puts_to(&settings.detector.num_images()).last(),
        Some(&PvValue::Int(1))
    );

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            ScanState::Preparing,
            ScanState::Moving,
            ScanState::Scanning,
            ScanState::Finishing,
            ScanState::Idle
        ]
    );
    let conversion = events
        .iter()
        .find_map(|e| match e {
            ScanEvent::ReadyForConversion(request) => Some(request.clone()),
            _ => None,
        })
        .expect("accumulated step scan is handed to conversion");
    assert_eq!(conversion.frames, 160);
    assert_eq!(conversion.first_frame, 1);
    assert_eq!(conversion.step, 0.5);

    let last = status.snapshot();
    assert!(!last.is_running);
    assert_eq!(last.frame_number, 160);
}

#[tokio::test]
async fn test_wide_scan_uses_single_trigger_and_accel_distance() {
    let settings = fast_settings();
    let (sim, engine, events, _status) = connect(&settings).await;
    let mut rx = events.subscribe();
    sim.clear_log();

    let request = ScanRequest::rotation(2.0, 0.0, 10.0, None, "wide", "/data/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    engine.collect_projections(&CancelFlag::new()).await.unwrap();

    let commands = sim.pso_commands();
    // padded acceleration distance, not the sweep, spaces the pulses
    assert!(commands.contains(&"PSODISTANCE X FIXED 2000".to_string()));
    assert!(commands.contains(&"PSOWINDOW X 1 RANGE -2005,8005".to_string()));
    assert_eq!(
        sim.puts_to(&settings.pso.counts_per_step()),
        vec![PvValue::Int(10_000)]
    );
    assert_eq!(
        sim.puts_to(&settings.pso.start_taxi()),
        vec![PvValue::Float(-2.0)]
    );
    assert_eq!(
        sim.puts_to(&settings.detector.trigger_mode()),
        vec![PvValue::Int(2), PvValue::Int(0)]
    );
    assert_eq!(
        sim.puts_to(&settings.detector.num_images()),
        vec![PvValue::Int(1), PvValue::Int(1)]
    );
    assert_eq!(
        sim.value(&format!("{}.RBV", settings.rotation.motor)),
        Some(PvValue::Float(0.0))
    );

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            ScanState::Preparing,
            ScanState::Moving,
            ScanState::Scanning,
            ScanState::Finishing,
            ScanState::Idle
        ]
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ScanEvent::ReadyForConversion(_))));
}

#[tokio::test]
async fn test_step_larger_than_range_touches_nothing() {
    let settings = fast_settings();
    let (sim, engine, events, _status) = connect(&settings).await;
    let mut rx = events.subscribe();
    sim.clear_log();

    let request = ScanRequest::rotation(1.0, 0.0, 1.0, Some(5.0), "sample", "/data/");
    assert!(engine.prepare_scan(&request).await.unwrap());
    assert!(sim.puts().is_empty());
    assert_eq!(engine.state(), ScanState::Idle);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ScanEvent::ErrorMessage(msg) if msg.contains("step"))));
}

#[tokio::test]
async fn test_taxi_beyond_soft_limit_is_refused() {
    let settings = fast_settings();
    let (sim, engine, _events, _status) = connect(&settings).await;
    sim.clear_log();

    let request = ScanRequest::rotation(1.0, 0.0, 400.0, Some(1.0), "sample", "/data/");
    assert!(engine.prepare_scan(&request).await.unwrap());
    assert!(sim.puts().is_empty());
    assert!(sim.pso_commands().is_empty());
}

#[tokio::test]
async fn test_still_scan_never_moves() {
    let settings = fast_settings();
    let (sim, engine, events, _status) = connect(&settings).await;
    let mut rx = events.subscribe();
    sim.clear_log();

    let request = ScanRequest::still(0.5, "still", "/data/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    engine.collect_still(&CancelFlag::new()).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            ScanState::Preparing,
            ScanState::Scanning,
            ScanState::Finishing,
            ScanState::Idle
        ]
    );
    assert!(sim.pso_commands().is_empty());
    assert!(sim
        .puts_to(&format!("{}.VAL", settings.rotation.motor))
        .is_empty());
    assert!(!events
        .iter()
        .any(|e| matches!(e, ScanEvent::ReadyForConversion(_))));
}

#[tokio::test]
async fn test_abort_while_scanning_cleans_up_once() {
    let settings = fast_settings();
    let (sim, engine, events, _status) = connect(&settings).await;
    let mut rx = events.subscribe();
    sim.stall_detector(true);

    let request = ScanRequest::rotation(1.0, 0.0, 10.0, Some(1.0), "sample", "/data/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    sim.clear_log();

    let cancel = CancelFlag::new();
    let task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.collect_prepared(&cancel).await })
    };

    let mut state = engine.subscribe_state();
    state
        .wait_for(|s| *s == ScanState::Scanning)
        .await
        .unwrap();
    cancel.cancel();
    engine.mark_aborting();
    task.await.unwrap().unwrap();

    let events = drain(&mut rx);
    let seen = states(&events);
    let aborting = seen.iter().position(|s| *s == ScanState::Aborting).unwrap();
    let finishing = seen.iter().position(|s| *s == ScanState::Finishing).unwrap();
    assert!(aborting < finishing);
    assert_eq!(seen.last(), Some(&ScanState::Idle));

    assert_eq!(
        sim.puts_to(&settings.detector.num_images()),
        vec![PvValue::Int(1)]
    );
    assert_eq!(sim.value(&settings.shutter.pv), Some(PvValue::Int(0)));
    assert_eq!(sim.value(&settings.detector.acquire()), Some(PvValue::Int(0)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ScanEvent::ReadyForConversion(_))));
}

#[tokio::test(start_paused = true)]
async fn test_return_to_start_wait_is_bounded() {
    let settings = fast_settings();
    let (sim, engine, _events, _status) = connect(&settings).await;
    let rotation_rbv = format!("{}.RBV", settings.rotation.motor);
    sim.set_value(&rotation_rbv, 5.0);
    sim.stall_motor(&settings.rotation.motor);

    let request = ScanRequest::rotation(0.1, 0.0, 10.0, Some(1.0), "sample", "/data/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    let result = engine.collect_prepared(&CancelFlag::new()).await;

    assert!(matches!(
        result,
        Err(AcqError::HardwareTimeout { ref key, .. }) if *key == rotation_rbv
    ));
    assert_eq!(engine.state(), ScanState::Idle);
    assert_eq!(sim.value(&settings.shutter.pv), Some(PvValue::Int(0)));
    assert_eq!(
        sim.puts_to(&settings.detector.num_images()).last(),
        Some(&PvValue::Int(1))
    );
}

#[tokio::test]
async fn test_abort_while_moving_skips_exposure() {
    let settings = fast_settings();
    let (sim, engine, events, _status) = connect(&settings).await;
    let mut rx = events.subscribe();

    let request = ScanRequest::rotation(1.0, 0.0, 10.0, Some(1.0), "sample", "/data/");
    assert!(!engine.prepare_scan(&request).await.unwrap());
    sim.clear_log();

    let cancel = CancelFlag::new();
    let mut state = engine.subscribe_state();
    let task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.collect_prepared(&cancel).await })
    };
    state.wait_for(|s| *s == ScanState::Moving).await.unwrap();
    cancel.cancel();
    engine.mark_aborting();
    task.await.unwrap().unwrap();

    let seen = states(&drain(&mut rx));
    assert!(!seen.contains(&ScanState::Scanning));
    let aborting = seen.iter().position(|s| *s == ScanState::Aborting).unwrap();
    let finishing = seen.iter().position(|s| *s == ScanState::Finishing).unwrap();
    assert!(aborting < finishing);
    assert_eq!(seen.last(), Some(&ScanState::Idle));

    // the taxi move already issued completes, then the stage goes home
    let rotation_val = format!("{}.VAL", settings.rotation.motor);
    let moves = sim.puts_to(&rotation_val);
    assert_eq!(moves.len(), 2);
    assert_eq!(moves.last(), Some(&PvValue::Float(0.0)));
    assert!(!moves.contains(&PvValue::Float(10.0)));

    assert_eq!(sim.puts_to(&settings.shutter.pv), vec![PvValue::Int(0)]);
    assert!(!sim
        .puts_to(&settings.detector.acquire())
        .contains(&PvValue::Int(1)));
    let commands = sim.pso_commands();
    assert_eq!(
        commands[commands.len() - 2..],
        ["PSOWINDOW X 1 OFF".to_string(), "PSOCONTROL X OFF".to_string()]
    );
    assert_eq!(
        sim.value(&settings.detector.trigger_mode()),
        Some(PvValue::Int(0))
    );
}

#[tokio::test]
async fn test_failed_detector_write_restores_file_path() {
    let settings = fast_settings();
    let (sim, engine, _events, _status) = connect(&settings).await;
    let det = &settings.detector;
    sim.fail_key(&det.acquire_time());

    let result = engine
        .prepare_scan(&ScanRequest::still(1.0, "sample", "/data/new/"))
        .await;

    assert!(matches!(result, Err(AcqError::Hardware(ref msg)) if msg.contains("AcquireTime")));
    assert_eq!(engine.state(), ScanState::Idle);
    assert_eq!(
        sim.puts_to(&det.tiff_file_path()),
        vec![PvValue::from("/data/new/"), PvValue::from("/DAC/previous/")]
    );
    assert_eq!(
        sim.value(&det.tiff_file_path()),
        Some(PvValue::from("/DAC/previous/"))
    );
}

#[tokio::test]
async fn test_second_prepare_is_refused() {
    let settings = fast_settings();
    let (sim, engine, _events, _status) = connect(&settings).await;
    let det = &settings.detector;

    assert!(!engine
        .prepare_scan(&ScanRequest::still(0.1, "first", "/data/a/"))
        .await
        .unwrap());
    let second = engine
        .prepare_scan(&ScanRequest::still(0.1, "second", "/data/b/"))
        .await;
    assert!(matches!(second, Err(AcqError::Precondition(_))));
    assert_eq!(engine.state(), ScanState::Preparing);
    assert_eq!(sim.value(&det.tiff_file_name()), Some(PvValue::from("first")));

    engine.collect_prepared(&CancelFlag::new()).await.unwrap();
    // the operator's settings come back, not the first scan's
    assert_eq!(sim.value(&det.tiff_file_name()), Some(PvValue::from("previous")));
    assert_eq!(
        sim.value(&det.tiff_file_path()),
        Some(PvValue::from("/DAC/previous/"))
    );
    assert_eq!(engine.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_unwritable_directory_disables_pulse_generator() {
    let mut settings = fast_settings();
    settings.paths.create_directories = true;
    let (sim, engine, _events, _status) = connect(&settings).await;
    // a regular file where the output directory should go
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let filepath = format!("{}/", blocker.path().display());
    sim.clear_log();

    let request = ScanRequest::rotation(1.0, 0.0, 10.0, Some(1.0), "sample", filepath);
    let result = engine.prepare_scan(&request).await;

    assert!(matches!(result, Err(AcqError::Io(_))));
    assert_eq!(engine.state(), ScanState::Idle);
    let commands = sim.pso_commands();
    assert_eq!(commands.first().map(String::as_str), Some("PSOCONTROL X RESET"));
    assert_eq!(
        commands[commands.len() - 2..],
        ["PSOWINDOW X 1 OFF".to_string(), "PSOCONTROL X OFF".to_string()]
    );
    assert!(sim.puts_to(&settings.detector.trigger_mode()).is_empty());
}
