//! Teardown under faults: device loss, failing closes, held payloads and
//! callbacks that call back into their acquirer.

use harvest::sim::{SimConfig, SimFaults, SimProducer};
use harvest::{
    AcquirerConfig, AcquirerEvent, AcquirerState, DeliveryPolicy, DiagnosticKind, Engine,
    HandleKind, HarvestError, ImageAcquirer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

const DEVICE_SCOPED: [HandleKind; 4] = [
    HandleKind::Device,
    HandleKind::DataStream,
    HandleKind::Buffer,
    HandleKind::Event,
];

fn setup(sim: SimConfig) -> (Engine, Arc<SimProducer>) {
    let engine = Engine::default();
    let sim = Arc::new(SimProducer::new(sim.frame_interval(Duration::from_millis(1))));
    engine.add_producer_instance(sim.clone()).unwrap();
    (engine, sim)
}

fn assert_no_device_handles(sim: &SimProducer) {
    for kind in DEVICE_SCOPED {
        assert_eq!(sim.open_handles_of(kind), 0, "{:?} handles left open", kind);
    }
}

fn wait_for_state(acquirer: &ImageAcquirer, state: AcquirerState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while acquirer.state() != state {
        assert!(Instant::now() < deadline, "acquirer stuck in {}", acquirer.state());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_destroy_from_every_state_releases_device_handles() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let manual = AcquirerConfig {
        open_on_create: false,
        ..Default::default()
    };

    // Created
    let acquirer = engine.create_acquirer_with("SIM-0", manual.clone()).unwrap();
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);

    // Opened
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    assert_eq!(sim.open_handles_of(HandleKind::DataStream), 1);
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);

    // Acquiring
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    acquirer.fetch(Duration::from_secs(1)).unwrap().release();
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);

    // Stopped, with payloads still queued
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    acquirer.stop().unwrap();
    assert_eq!(acquirer.state(), AcquirerState::Stopped);
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);

    // Destroyed: a second destroy is a no-op, other operations are state errors.
    assert!(acquirer.destroy().is_clean());
    assert!(matches!(acquirer.start(), Err(HarvestError::State { .. })));
    assert!(matches!(acquirer.stop(), Err(HarvestError::State { .. })));
    assert!(matches!(
        acquirer.fetch(Duration::from_millis(1)),
        Err(HarvestError::State { .. })
    ));
    assert_eq!(engine.acquirer_count(), 0);

    engine.reset();
    assert_eq!(sim.open_handle_count(), 0);
}

#[test]
fn test_dropping_last_reference_destroys_acquirer() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    assert_eq!(engine.acquirer_count(), 1);

    drop(acquirer);
    assert_eq!(engine.acquirer_count(), 0);
    assert_no_device_handles(&sim);
}

#[test]
fn test_device_lost_delivers_pending_then_error() {
    let faults = SimFaults {
        device_lost_after_frames: Some(3),
        ..Default::default()
    };
    let (engine, sim) = setup(SimConfig::single_device("SIM-0").faults(faults));
    let config = AcquirerConfig {
        num_buffers: 4,
        queue_depth: 4,
        ..Default::default()
    };
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    acquirer.on_event(move |event| sink.lock().push(event.clone()));

    acquirer.start().unwrap();
    wait_for_state(&acquirer, AcquirerState::Stopped);

    let mut frame_ids = Vec::new();
    let err = loop {
        match acquirer.fetch(Duration::from_millis(200)) {
            Ok(payload) => frame_ids.push(payload.frame_id()),
            Err(e) => break e,
        }
    };
    assert_eq!(frame_ids, vec![0, 1, 2]);
    assert!(err.is_device_lost(), "{err}");

    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, AcquirerEvent::DeviceLost { .. })));
    assert!(acquirer
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::DeviceLost));

    // The acquisition thread already released the stream resources.
    assert_eq!(sim.open_handles_of(HandleKind::Event), 0);
    acquirer.destroy();
    assert_no_device_handles(&sim);
}

#[test]
fn test_unplugged_device_stops_acquirer_and_leaves_listing() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    acquirer.fetch(Duration::from_secs(1)).unwrap().release();

    sim.unplug("SIM-0");
    let err = loop {
        match acquirer.fetch(Duration::from_secs(1)) {
            Ok(payload) => payload.release(),
            Err(e) => break e,
        }
    };
    assert!(err.is_device_lost(), "{err}");
    assert_eq!(acquirer.state(), AcquirerState::Stopped);
    assert!(acquirer.start().is_err());

    assert!(acquirer.destroy().is_clean());
    assert!(engine.update_device_info_list().is_empty());
    assert_no_device_handles(&sim);
}

#[test]
#[traced_test]
fn test_failing_close_is_logged_and_teardown_continues() {
    let faults = SimFaults {
        failing_closes: vec![HandleKind::DataStream],
        ..Default::default()
    };
    let (engine, sim) = setup(SimConfig::single_device("SIM-0").faults(faults));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    acquirer.fetch(Duration::from_secs(1)).unwrap().release();

    let report = acquirer.destroy();
    assert_eq!(report.failures().len(), 1, "{:?}", report.failures());
    assert!(matches!(report.failures()[0], HarvestError::Native(_)));
    assert!(logs_contain("Teardown step failed"));
    assert!(acquirer
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::TeardownFailure));

    // The device close after the failed stream close still ran.
    assert_no_device_handles(&sim);
    assert_eq!(acquirer.state(), AcquirerState::Destroyed);
}

#[test]
fn test_held_payload_stays_readable_after_destroy() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    acquirer.start().unwrap();
    let payload = acquirer.fetch(Duration::from_secs(1)).unwrap();
    let expected = payload.bytes().to_vec();
    assert!(!payload.is_detached());

    assert!(engine.reset().is_clean());
    assert_eq!(acquirer.state(), AcquirerState::Destroyed);
    assert_eq!(sim.open_handle_count(), 0);

    assert!(payload.is_detached());
    assert_eq!(payload.bytes(), expected.as_slice());
    payload.release();
}

/// Run `f` on another thread and fail the test if it has not returned
/// within `limit`.
fn returns_within<T: Send + 'static>(limit: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(limit).expect("call did not return in time")
}

fn wait_for_frames(acquirer: &ImageAcquirer, frames: u64) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while acquirer.statistics().delivered < frames {
        assert!(Instant::now() < deadline, "{:?}", acquirer.statistics());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_callbacks_use_acquirer_during_stop_and_destroy() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    let stopped_in = Arc::new(Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&acquirer);
        let stopped_in = stopped_in.clone();
        acquirer.on_event(move |event| {
            let Some(acq) = weak.upgrade() else {
                return;
            };
            match event {
                AcquirerEvent::NewBufferAvailable { .. } => {
                    if let Ok(Some(payload)) = acq.try_fetch(Duration::from_millis(1)) {
                        payload.release();
                    }
                }
                AcquirerEvent::AcquisitionStopped => stopped_in.lock().push(acq.state()),
                _ => {}
            }
        });
    }

    acquirer.start().unwrap();
    wait_for_frames(&acquirer, 5);
    let acq = acquirer.clone();
    let report = returns_within(Duration::from_secs(3), move || acq.stop()).unwrap();
    assert!(report.is_clean());
    assert_eq!(acquirer.state(), AcquirerState::Stopped);

    acquirer.start().unwrap();
    wait_for_frames(&acquirer, 10);
    let acq = acquirer.clone();
    let report = returns_within(Duration::from_secs(3), move || acq.destroy());
    assert!(report.is_clean());
    assert_no_device_handles(&sim);

    // The stop callback saw the acquirer still acquiring, the destroy one saw it gone.
    assert_eq!(
        *stopped_in.lock(),
        vec![AcquirerState::Acquiring, AcquirerState::Destroyed]
    );
}

#[test]
fn test_stop_from_callback_only_requests_stop() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let config = AcquirerConfig {
        num_buffers: 4,
        queue_depth: 4,
        ..Default::default()
    };
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let weak = Arc::downgrade(&acquirer);
        acquirer.on_event(move |event| {
            if !matches!(event, AcquirerEvent::NewBufferAvailable { frame_id: 2 }) {
                return;
            }
            if let Some(acq) = weak.upgrade() {
                let stopped = acq.stop().map(|report| report.is_clean());
                let restart_refused = matches!(acq.start(), Err(HarvestError::State { .. }));
                let _ = tx.try_send((stopped, restart_refused));
            }
        });
    }

    acquirer.start().unwrap();
    let (stopped, restart_refused) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert!(stopped.unwrap());
    assert!(restart_refused);
    wait_for_state(&acquirer, AcquirerState::Stopped);

    let mut frame_ids = Vec::new();
    while let Ok(payload) = acquirer.fetch(Duration::from_millis(50)) {
        frame_ids.push(payload.frame_id());
    }
    assert_eq!(frame_ids.last(), Some(&2));
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);
}

#[test]
fn test_destroy_from_callback_releases_handles_after_thread_exits() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    let acquirer = engine.create_acquirer("SIM-0").unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let weak = Arc::downgrade(&acquirer);
        acquirer.on_event(move |event| {
            if !matches!(event, AcquirerEvent::NewBufferAvailable { .. }) {
                return;
            }
            if let Some(acq) = weak.upgrade() {
                let _ = tx.try_send(acq.destroy().is_clean());
            }
        });
    }

    acquirer.start().unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(3)).unwrap());
    assert_eq!(acquirer.state(), AcquirerState::Destroyed);
    assert_eq!(engine.acquirer_count(), 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    while sim.open_handles_of(HandleKind::Device) > 0 {
        assert!(Instant::now() < deadline, "device handle still open");
        thread::sleep(Duration::from_millis(5));
    }
    assert_no_device_handles(&sim);
}

#[test]
fn test_last_handle_dropped_in_callback_tears_down() {
    let (engine, sim) = setup(SimConfig::single_device("SIM-0"));
    // Nobody fetches; dropping keeps the events coming.
    let config = AcquirerConfig {
        policy: DeliveryPolicy::DropOldest,
        ..Default::default()
    };
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();
    let held: Arc<Mutex<Option<Arc<ImageAcquirer>>>> = Arc::new(Mutex::new(None));
    {
        let held = held.clone();
        acquirer.on_event(move |event| {
            if matches!(event, AcquirerEvent::NewBufferAvailable { .. }) {
                let last = held.lock().take();
                drop(last);
            }
        });
    }
    acquirer.start().unwrap();
    *held.lock() = Some(acquirer);

    let deadline = Instant::now() + Duration::from_secs(3);
    while engine.acquirer_count() > 0 || sim.open_handles_of(HandleKind::Device) > 0 {
        assert!(Instant::now() < deadline, "acquirer not torn down");
        thread::sleep(Duration::from_millis(5));
    }
    assert_no_device_handles(&sim);
}

#[test]
fn test_failed_start_returns_queued_buffers() {
    let faults = SimFaults {
        queue_buffer_fails_after: Some(1),
        ..Default::default()
    };
    let (engine, sim) = setup(SimConfig::single_device("SIM-0").faults(faults));
    let config = AcquirerConfig {
        num_buffers: 3,
        ..Default::default()
    };
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();

    assert!(matches!(acquirer.start(), Err(HarvestError::Native(_))));
    assert_eq!(acquirer.state(), AcquirerState::Opened);
    let counts = acquirer.pool_counts().unwrap();
    assert_eq!(counts.queued, 0, "{:?}", counts);
    assert_eq!(counts.free, 3);

    // Nothing is left with the producer, so every buffer can be revoked.
    assert!(acquirer.destroy().is_clean());
    assert_no_device_handles(&sim);
}
