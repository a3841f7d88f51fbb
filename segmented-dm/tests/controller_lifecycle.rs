//! End-to-end pipeline tests against the mock driver backend.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use ndarray::Array2;
use segmented_dm::driver::{MockFailure, MockHandle};
use segmented_dm::formats::device_native::{serialize, NativeRecordSet};
use segmented_dm::formats::RawCommand;
use segmented_dm::{
    validate, ApplyError, Command, CommandFormat, ConfigError, ConnectionError, ControllerState,
    DmConfig, DmController, MockDriver, Ptt, SegmentId, TestbedState, ValidationError,
};

/// 37-segment mirror using a seven-segment pupil centred on segment 3
fn config(dir: &Path, serial: &str) -> DmConfig {
    let json = serde_json::json!({
        "mirror_serial": serial,
        "driver_serial": "09160017",
        "total_segments": 37,
        "pupil_segment_count": 7,
        "segments_used": [3, 9, 10, 11, 4, 1, 2],
        "command_file": dir.join("command.ini"),
        "driver_executable": "/opt/dm/apply_shape",
        "driver_timeout_secs": 2.0,
    });
    let config: DmConfig = serde_json::from_value(json).unwrap();
    config.validate().unwrap();
    config
}

fn controller(config: &DmConfig) -> (DmController<MockDriver>, MockHandle, TestbedState) {
    let driver = MockDriver::new();
    let handle = driver.handle();
    let testbed = TestbedState::new();
    let controller = DmController::new(config, driver)
        .unwrap()
        .with_testbed(testbed.clone());
    (controller, handle, testbed)
}

fn shape() -> Command {
    Command::device([
        (SegmentId(3), Ptt::new(1.0, 0.0, 0.0)),
        (SegmentId(10), Ptt::new(-0.4, 0.2, -0.1)),
    ])
}

#[test]
fn test_gui_export_unknown_segment_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let adapters = config(dir.path(), "it-gui-scenario").adapters().unwrap();

    let err = adapters
        .parse(RawCommand::GuiExport("[3, 1.0, 0.0, 0.0]\n[99, 0.0, 0.0, 0.0]\n"))
        .unwrap_err();
    assert_eq!(err.unknown_segment(), Some(SegmentId(99)));
}

#[test]
fn test_every_adapter_rejects_segments_outside_pupil() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-outside-pupil");
    let adapters = config.adapters().unwrap();

    let gui = adapters.parse(RawCommand::GuiExport("[20, 0.1, 0, 0]"));
    assert_eq!(gui.unwrap_err().unknown_segment(), Some(SegmentId(20)));

    // A device file for a wider pupil than this map knows about
    let wide = DmConfig {
        mirror_serial: "it-outside-pupil-wide".to_string(),
        pupil_segment_count: 8,
        segments_used: [3, 9, 10, 11, 4, 1, 2, 20].into_iter().map(SegmentId).collect(),
        ..config.clone()
    };
    let wide_map = wide.segment_map().unwrap();
    let text = serialize(
        &Command::device([(SegmentId(20), Ptt::new(0.1, 0.0, 0.0))]),
        &wide_map,
        &Command::zeros(&wide_map),
        wide.unit_params().header(),
    )
    .render();
    assert!(adapters.device_native.parse(&text).is_err());

    let mut array = Array2::<f64>::zeros((37, 3));
    array[[19, 0]] = 1e-7;
    let mut sim_config = config.clone();
    sim_config.simulation.ordering = segmented_dm::formats::SimulationOrdering::FullAperture;
    let sim = sim_config
        .adapters()
        .unwrap()
        .parse(RawCommand::Simulation(array.view()));
    assert_eq!(sim.unwrap_err().unknown_segment(), Some(SegmentId(20)));
}

#[test]
fn test_serialize_parse_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-round-trip");
    let map = config.segment_map().unwrap();
    let flat = config.load_flat(&map).unwrap();
    let adapters = config.adapters().unwrap();

    let command = validate(shape(), &map, &config.limits).unwrap();
    let text = serialize(&command, &map, &flat, config.unit_params().header()).render();
    let parsed = adapters.parse(RawCommand::DeviceNative(&text)).unwrap();
    let parsed = validate(parsed, &map, &config.limits).unwrap();

    assert_eq!(parsed, command.resolved(&map, &flat));
    // A full-pupil command survives unchanged
    let full = command.resolved(&map, &flat);
    let text = serialize(&full, &map, &flat, config.unit_params().header()).render();
    assert_eq!(adapters.device_native.parse(&text).unwrap(), full);
}

#[test]
fn test_apply_updates_state_and_published_slot() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-apply");
    let (controller, handle, testbed) = controller(&config);

    controller.open().unwrap();
    assert!(testbed.current_command().is_none());

    controller.apply(shape()).unwrap();
    assert_eq!(controller.current_command().as_deref(), Some(&shape()));
    assert_eq!(testbed.current_command().as_deref(), Some(&shape()));

    // The driver saw exactly the file the controller wrote
    let written = NativeRecordSet::read_from(&config.command_file).unwrap();
    assert_eq!(handle.last_applied(), Some(written.render()));
    assert_eq!(written.records.len(), 7);

    controller.close().unwrap();
}

#[test]
fn test_out_of_limit_command_never_reaches_driver() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-limits");
    let (controller, handle, _) = controller(&config);
    controller.open().unwrap();

    let bad = Command::device([(SegmentId(11), Ptt::new(0.0, 0.0, 9.0))]);
    let err = controller.apply(bad).unwrap_err();
    assert!(matches!(
        err,
        ApplyError::Validation(ValidationError::OutOfRange {
            segment: SegmentId(11),
            ..
        })
    ));
    assert_eq!(handle.apply_count(), 0);
    assert!(!config.command_file.exists());
    assert!(controller.current_command().is_none());
}

#[test]
fn test_out_of_range_flat_never_reaches_driver() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "it-bad-flat");
    let map = config.segment_map().unwrap();

    let flat_path = dir.path().join("flat.ini");
    let flat = Command::device([(SegmentId(9), Ptt::new(40.0, 0.0, 0.0))]);
    serialize(&flat, &map, &Command::zeros(&map), config.unit_params().header())
        .write_to(&flat_path)
        .unwrap();
    config.flat_file = Some(flat_path);

    let driver = MockDriver::new();
    let handle = driver.handle();
    let err = DmController::new(&config, driver).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::FlatOutOfRange(ValidationError::OutOfRange {
            segment: SegmentId(9),
            ..
        })
    ));
    assert_eq!(handle.apply_count(), 0);
    assert!(!config.command_file.exists());
}

#[test]
fn test_close_always_resets_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-close-reset");
    let (controller, handle, testbed) = controller(&config);

    controller.open().unwrap();
    controller.apply(shape()).unwrap();
    handle.fail_next_apply(MockFailure::Timeout);
    assert!(controller.apply(Command::zeros(controller.segment_map())).is_err());

    // Flatten on close also fails
    handle.fail_next_apply(MockFailure::Exit(1));
    assert!(matches!(
        controller.close(),
        Err(ConnectionError::ParkFailed(_))
    ));
    assert_eq!(controller.state(), ControllerState::default());
    assert!(testbed.current_command().is_none());
    assert_eq!(handle.stops(), 1);
}

#[test]
fn test_flatten_replaces_current_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-flatten");
    let (controller, handle, testbed) = controller(&config);

    controller.open().unwrap();
    controller.apply(shape()).unwrap();
    controller.flatten().unwrap();

    let current = controller.current_command().unwrap();
    assert_eq!(current.len(), 7);
    assert!(current.iter().all(|(_, ptt)| ptt.is_zero()));
    assert!(Arc::ptr_eq(&current, &testbed.current_command().unwrap()));

    let last = handle.last_applied().unwrap();
    let records = NativeRecordSet::parse_str(&last).unwrap();
    assert!(records.records.iter().all(|r| r.ptt == Ptt::ZERO));
    controller.close().unwrap();
}

#[test]
fn test_concurrent_apply_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-busy");
    let (controller, handle, testbed) = controller(&config);
    controller.open().unwrap();

    let (entered, release) = handle.gate_next_apply();
    thread::scope(|scope| {
        let first = scope.spawn(|| controller.apply(shape()));

        // First apply is inside the driver
        entered.recv().unwrap();
        let second = Command::device([(SegmentId(1), Ptt::new(0.3, 0.0, 0.0))]);
        assert!(matches!(controller.apply(second), Err(ApplyError::Busy)));
        assert!(matches!(controller.flatten(), Err(ApplyError::Busy)));

        release.send(()).unwrap();
        first.join().unwrap().unwrap();
    });

    assert_eq!(handle.apply_count(), 1);
    assert_eq!(controller.current_command().as_deref(), Some(&shape()));
    assert_eq!(testbed.current_command().as_deref(), Some(&shape()));
    controller.close().unwrap();
}

#[test]
fn test_session_closes_on_early_return() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-session");
    let (controller, handle, testbed) = controller(&config);

    let result = controller.with_session(|dm| -> anyhow::Result<()> {
        dm.apply(shape())?;
        // Past the piston range, so the closure bails here
        dm.apply(Command::device([(SegmentId(2), Ptt::new(50.0, 0.0, 0.0))]))?;
        dm.apply(shape())?;
        Ok(())
    });
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApplyError>(),
        Some(ApplyError::Validation(_))
    ));
    assert!(!controller.is_open());
    assert!(testbed.current_command().is_none());
    assert_eq!(handle.stops(), 1);
    // shape, then the flatten on close
    assert_eq!(handle.apply_count(), 2);

    {
        let session = controller.session().unwrap();
        session.apply(shape()).unwrap();
    }
    assert!(!controller.is_open());
    assert_eq!(handle.stops(), 2);
}

#[test]
fn test_session_reports_close_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-session-close");
    let (controller, handle, _) = controller(&config);

    handle.fail_stop(true);
    let result = controller.with_session(|_| -> anyhow::Result<()> { Ok(()) });
    assert!(matches!(
        result.unwrap_err().downcast_ref::<ConnectionError>(),
        Some(ConnectionError::DriverStop(_))
    ));
    assert!(!controller.is_open());
}

#[test]
fn test_session_open_failure_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "it-session-open");
    let (controller, handle, _) = controller(&config);

    handle.fail_start(true);
    let mut ran = false;
    let result = controller.with_session(|_| -> anyhow::Result<()> {
        ran = true;
        Ok(())
    });
    assert!(result.is_err());
    assert!(!ran);
    assert_eq!(handle.stops(), 0);
}
