//! Integration tests for the engine lifecycle: load, discover, acquire, reset.

use harvest::sim::{SimConfig, SimDevice, SimProducer};
use harvest::{
    AcquirerConfig, AcquirerState, DeviceQuery, DeviceSelector, Engine, EngineConfig,
    HandleKind, HarvestError,
};
use std::sync::Arc;
use std::time::Duration;

/// Engine with one simulated producer exposing the given devices.
fn engine_with(devices: Vec<SimDevice>) -> (Engine, Arc<SimProducer>) {
    let engine = Engine::new(EngineConfig::default()).expect("default config is valid");
    let sim = Arc::new(SimProducer::new(
        SimConfig::with_devices(devices).frame_interval(Duration::from_millis(2)),
    ));
    engine
        .add_producer_instance(sim.clone())
        .expect("Failed to bind simulated producer");
    (engine, sim)
}

#[test]
fn test_single_device_scenario() -> anyhow::Result<()> {
    let (engine, sim) = engine_with(vec![SimDevice::new("SIM-0")]);

    let devices = engine.list_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id(), "SIM-0");

    let acquirer = engine.create_acquirer("SIM-0")?;
    acquirer.start()?;

    let mut frame_ids = Vec::new();
    for _ in 0..3 {
        let payload = acquirer.fetch(Duration::from_secs(1))?;
        frame_ids.push(payload.frame_id());
        payload.release();
    }
    assert!(frame_ids.windows(2).all(|w| w[0] < w[1]), "frame ids {:?}", frame_ids);

    assert!(acquirer.stop()?.is_clean());
    assert!(acquirer.destroy().is_clean());
    assert_eq!(acquirer.state(), AcquirerState::Destroyed);

    assert!(engine.reset().is_clean());
    assert!(engine.list_devices().is_empty());
    assert!(sim.is_closed());
    assert_eq!(sim.open_handle_count(), 0);
    Ok(())
}

#[test]
fn test_unresolvable_selector_leaves_acquirer_set_unchanged() {
    let (engine, _sim) = engine_with(vec![SimDevice::new("SIM-0")]);
    let existing = engine.create_acquirer("SIM-0").expect("SIM-0 resolves");
    assert_eq!(engine.acquirer_count(), 1);

    for selector in [
        DeviceSelector::from("SIM-9"),
        DeviceSelector::Index(4),
        DeviceSelector::Serial("nope".into()),
    ] {
        let err = engine.create_acquirer(selector).unwrap_err();
        assert!(matches!(err, HarvestError::DeviceNotFound { .. }), "{err}");
    }
    assert_eq!(engine.acquirer_count(), 1);
    assert_eq!(engine.acquirers()[0].id(), existing.id());
}

#[test]
fn test_reset_is_idempotent() {
    let (engine, _sim) = engine_with(vec![SimDevice::new("SIM-0"), SimDevice::new("SIM-1")]);
    let acquirer = engine.create_acquirer(1usize).unwrap();
    acquirer.start().unwrap();

    let first = engine.reset();
    assert!(first.is_clean(), "{:?}", first.failures());
    assert_eq!(acquirer.state(), AcquirerState::Destroyed);
    assert!(engine.producers().is_empty());
    assert_eq!(engine.acquirer_count(), 0);
    assert!(engine.list_devices().is_empty());

    let second = engine.reset();
    assert!(second.is_clean());
    assert!(engine.producers().is_empty());
    assert_eq!(engine.acquirer_count(), 0);
    assert!(engine.list_devices().is_empty());
}

#[test]
fn test_engine_is_reusable_after_reset() {
    let (engine, _first) = engine_with(vec![SimDevice::new("SIM-0")]);
    engine.create_acquirer("SIM-0").unwrap().start().unwrap();
    engine.reset();

    let second = Arc::new(SimProducer::new(SimConfig::single_device("SIM-0")));
    engine.add_producer_instance(second.clone()).unwrap();
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    assert!(acquirer.fetch(Duration::from_secs(1)).is_ok());
    engine.reset();
    assert_eq!(second.open_handle_count(), 0);
}

#[test]
fn test_selectors() {
    let (engine, _sim) = engine_with(vec![
        SimDevice::new("SIM-0").serial("1000"),
        SimDevice::new("SIM-1").serial("1001").user_defined_name("left-cam"),
    ]);

    let by_serial = engine.create_acquirer(DeviceSelector::Serial("1001".into())).unwrap();
    assert_eq!(by_serial.device_info().id(), "SIM-1");
    by_serial.destroy();

    let by_name = engine.create_acquirer("left-cam").unwrap();
    assert_eq!(by_name.device_info().id(), "SIM-1");
    by_name.destroy();

    let by_query = engine
        .create_acquirer(DeviceQuery::new().serial_number("1000"))
        .unwrap();
    assert_eq!(by_query.device_info().id(), "SIM-0");
}

#[test]
fn test_stale_device_info_is_rejected_after_refresh() {
    let (engine, _sim) = engine_with(vec![SimDevice::new("SIM-0")]);
    let device = engine.list_devices().remove(0);
    engine.update_device_info_list();

    let err = engine.create_acquirer(&device).unwrap_err();
    assert!(matches!(err, HarvestError::DeviceNotFound { .. }));

    let fresh = engine.list_devices().remove(0);
    assert!(engine.create_acquirer(&fresh).is_ok());
}

#[test]
fn test_exclusive_access_conflict_is_reported() {
    let (engine, _sim) = engine_with(vec![SimDevice::new("SIM-0")]);
    let _first = engine.create_acquirer("SIM-0").unwrap();
    let err = engine.create_acquirer("SIM-0").unwrap_err();
    assert!(matches!(err, HarvestError::Native(_)), "{err}");
    assert_eq!(engine.acquirer_count(), 1);
}

#[test]
fn test_open_on_create_disabled() {
    let (engine, sim) = engine_with(vec![SimDevice::new("SIM-0")]);
    let config = AcquirerConfig {
        open_on_create: false,
        ..Default::default()
    };
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();
    assert_eq!(acquirer.state(), AcquirerState::Created);
    assert_eq!(sim.open_handles_of(HandleKind::Device), 0);

    acquirer.open().unwrap();
    assert_eq!(acquirer.state(), AcquirerState::Opened);
    assert_eq!(sim.open_handles_of(HandleKind::Device), 1);
}

#[test]
fn test_missing_producer_file_is_rejected() {
    let engine = Engine::default();
    let err = engine.add_producer("/nonexistent/vendor.cti").unwrap_err();
    assert!(matches!(err, HarvestError::ProducerLoad { .. }));
    assert!(engine.producers().is_empty());
}
