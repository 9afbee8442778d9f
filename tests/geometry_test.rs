//! Detector geometry moves.

use tomo_xrd::config::Settings;
use tomo_xrd::coordinator::{ActiveOperation, Geometry, GeometryRequest};
use tomo_xrd::events::ScanEvent;
use tomo_xrd::hardware::{PvValue, SimulatedBeamline};
use tomo_xrd::{AcqError, AcquisitionApp};

async fn connect(settings: &Settings) -> (SimulatedBeamline, AcquisitionApp) {
    let sim = SimulatedBeamline::new(settings);
    let app = AcquisitionApp::connect(sim.client(), settings.clone())
        .await
        .expect("app connects to the simulator");
    (sim, app)
}

fn val(motor: &str) -> String {
    format!("{}.VAL", motor)
}

#[tokio::test(start_paused = true)]
async fn test_move_retracts_before_crossing() {
    let settings = Settings::default();
    let (sim, app) = connect(&settings).await;
    let geometry = &settings.geometry;
    sim.clear_log();

    let GeometryRequest::Started(handle) = app.move_to_geometry(Geometry::Tomo).await.unwrap() else {
        panic!("move should start");
    };
    assert_eq!(app.active_operation(), Some(ActiveOperation::MoveToTomo));
    handle.await.unwrap().unwrap();

    let moves: Vec<(String, PvValue)> = sim
        .puts()
        .into_iter()
        .filter(|(key, _)| key == &val(&geometry.detector_x) || key == &val(&geometry.detector_z))
        .collect();
    assert_eq!(
        moves,
        vec![
            (val(&geometry.detector_z), PvValue::Float(geometry.detector_out)),
            (val(&geometry.detector_x), PvValue::Float(geometry.tomo_x)),
            (val(&geometry.detector_z), PvValue::Float(geometry.tomo_z)),
        ]
    );
    assert!(app.is_at(Geometry::Tomo).await.unwrap());
    assert!(!app.is_at(Geometry::Xrd).await.unwrap());
    assert_eq!(app.active_operation(), None);
}

#[tokio::test(start_paused = true)]
async fn test_slot_held_through_settle() {
    let settings = Settings::default();
    let (_sim, app) = connect(&settings).await;
    let mut rx = app.subscribe();

    let GeometryRequest::Started(handle) = app.move_to_geometry(Geometry::Tomo).await.unwrap() else {
        panic!("move should start");
    };
    let start = tokio::time::Instant::now();
    handle.await.unwrap().unwrap();
    assert!(start.elapsed() >= settings.geometry.abort_settle());

    let mut moving = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ScanEvent::GeometryMoving { geometry, moving: m } = event {
            moving.push((geometry, m));
        }
    }
    assert_eq!(moving, vec![(Geometry::Tomo, true), (Geometry::Tomo, false)]);
}

#[tokio::test]
async fn test_refused_with_shutter_open() {
    let settings = Settings::default();
    let (sim, app) = connect(&settings).await;
    sim.set_value(&settings.shutter.pv, 1);
    sim.clear_log();

    let result = app.move_to_geometry(Geometry::Tomo).await;
    assert!(matches!(result, Err(AcqError::Precondition(msg)) if msg.contains("shutter")));
    assert!(sim.puts().is_empty());
    assert_eq!(app.active_operation(), None);
}

#[tokio::test(start_paused = true)]
async fn test_second_request_stops_the_move() {
    let settings = Settings::default();
    let (sim, app) = connect(&settings).await;
    let geometry = &settings.geometry;
    let mut rx = app.subscribe();
    sim.hang_on(&val(&geometry.detector_z));

    let GeometryRequest::Started(handle) = app.move_to_geometry(Geometry::Tomo).await.unwrap() else {
        panic!("move should start");
    };
    loop {
        if let ScanEvent::GeometryMoving { moving: true, .. } = rx.recv().await.unwrap() {
            break;
        }
    }

    assert!(matches!(
        app.move_to_geometry(Geometry::Xrd).await.unwrap(),
        GeometryRequest::Ignored(ActiveOperation::MoveToTomo)
    ));
    assert!(matches!(
        app.move_to_geometry(Geometry::Tomo).await.unwrap(),
        GeometryRequest::StopRequested
    ));
    for key in &geometry.all_stop {
        assert_eq!(sim.puts_to(key), vec![PvValue::Int(1)]);
    }

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(AcqError::HardwareTimeout { .. })));
    // the crossing move never started
    assert!(sim.puts_to(&val(&geometry.detector_x)).is_empty());
    assert_eq!(app.active_operation(), None);
}

#[tokio::test(start_paused = true)]
async fn test_no_crossing_when_retraction_falls_short() {
    let settings = Settings::default();
    let (sim, app) = connect(&settings).await;
    let geometry = &settings.geometry;
    sim.stall_motor(&geometry.detector_z);

    let GeometryRequest::Started(handle) = app.move_to_geometry(Geometry::Tomo).await.unwrap() else {
        panic!("move should start");
    };
    handle.await.unwrap().unwrap();
    assert!(sim.puts_to(&val(&geometry.detector_x)).is_empty());
    assert!(app.is_at(Geometry::Xrd).await.unwrap());
}
