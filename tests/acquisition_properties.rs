//! Buffer ownership and delivery ordering under concurrent fetch/release.

use harvest::sim::{SimConfig, SimPayload, SimProducer};
use harvest::{
    AcquirerConfig, AcquirerEvent, ComponentKind, DeliveryPolicy, Engine, ImageAcquirer,
    PayloadType,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn acquirer(sim: SimConfig, config: AcquirerConfig) -> (Engine, Arc<SimProducer>, Arc<ImageAcquirer>) {
    let engine = Engine::default();
    let sim = Arc::new(SimProducer::new(sim));
    engine.add_producer_instance(sim.clone()).unwrap();
    let acquirer = engine.create_acquirer_with("SIM-0", config).unwrap();
    (engine, sim, acquirer)
}

fn fast_sim() -> SimConfig {
    SimConfig::single_device("SIM-0").frame_interval(Duration::from_millis(1))
}

fn config(policy: DeliveryPolicy, queue_depth: usize, num_buffers: usize) -> AcquirerConfig {
    AcquirerConfig {
        policy,
        queue_depth,
        num_buffers,
        wait_timeout: Duration::from_millis(20),
        ..Default::default()
    }
}

#[test]
fn test_free_count_restored_after_stop_and_drain() {
    let (_engine, _sim, acq) = acquirer(fast_sim(), config(DeliveryPolicy::Block, 2, 4));
    acq.start().unwrap();
    let before = 4;

    let mut held = Vec::new();
    for _ in 0..10 {
        let payload = acq.fetch(Duration::from_secs(1)).unwrap();
        held.push(payload);
        if held.len() > 2 {
            held.remove(0).release();
        }
    }
    acq.stop().unwrap();

    // Drain what is left in the queue, then release what the consumer holds.
    while let Ok(payload) = acq.fetch(Duration::from_millis(10)) {
        payload.release();
    }
    held.clear();

    let counts = acq.pool_counts().unwrap();
    assert_eq!(counts.free, before, "{:?}", counts);
    assert_eq!(counts.queued + counts.filled + counts.delivered, 0);
}

#[test]
fn test_held_buffer_is_never_queued() {
    let (_engine, _sim, acq) = acquirer(fast_sim(), config(DeliveryPolicy::DropOldest, 1, 3));
    acq.start().unwrap();

    let violation = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    // The consumer keeps one payload for a while, checking that its buffer
    // stays with it, while a second thread keeps the producer busy.
    let consumer = {
        let acq = acq.clone();
        let violation = violation.clone();
        let done = done.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                let Ok(payload) = acq.fetch(Duration::from_secs(1)) else {
                    continue;
                };
                let first = payload.bytes()[0];
                thread::sleep(Duration::from_millis(3));
                // The producer writes a frame-dependent pattern; a requeued
                // buffer would have been overwritten.
                if payload.bytes()[0] != first || payload.is_detached() {
                    violation.store(true, Ordering::SeqCst);
                }
                payload.release();
            }
            done.store(true, Ordering::SeqCst);
        })
    };
    consumer.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert!(!violation.load(Ordering::SeqCst));
    assert!(acq.stop().unwrap().is_clean());
}

#[test]
fn test_frame_ids_non_decreasing() {
    for policy in [DeliveryPolicy::Block, DeliveryPolicy::DropOldest, DeliveryPolicy::NewestOnly] {
        let (_engine, _sim, acq) = acquirer(fast_sim(), config(policy, 3, 4));
        acq.start().unwrap();
        let mut last = None;
        for _ in 0..15 {
            let payload = acq.fetch(Duration::from_secs(1)).unwrap();
            if let Some(last) = last {
                assert!(payload.frame_id() > last, "{:?}: {} after {}", policy, payload.frame_id(), last);
            }
            last = Some(payload.frame_id());
            thread::sleep(Duration::from_millis(2));
        }
        acq.destroy();
    }
}

#[test]
fn test_drop_oldest_counts_dropped_payloads() {
    let (_engine, _sim, acq) = acquirer(fast_sim(), config(DeliveryPolicy::DropOldest, 1, 3));
    acq.start().unwrap();
    // Do not fetch; the producer keeps filling and the queue keeps only one.
    thread::sleep(Duration::from_millis(60));
    let stats = acq.statistics();
    assert!(stats.dropped > 0, "{:?}", stats);
    assert!(stats.delivered > 1);

    let newest = acq.fetch(Duration::from_secs(1)).unwrap();
    assert!(newest.frame_id() > 0);
}

#[test]
fn test_block_policy_waits_for_consumer() {
    let (_engine, _sim, acq) = acquirer(fast_sim(), config(DeliveryPolicy::Block, 1, 3));
    acq.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    let stats = acq.statistics();
    assert_eq!(stats.dropped, 0);
    // One in the queue plus one blocked in the thread at most.
    assert!(stats.delivered <= 2, "{:?}", stats);

    let ids: Vec<u64> = (0..3)
        .map(|_| acq.fetch(Duration::from_secs(1)).unwrap().frame_id())
        .collect();
    assert_eq!(ids, vec![0, 1, 2]);
}

#[test]
fn test_multi_part_and_chunk_payloads() {
    let (_engine, sim, acq) = acquirer(
        fast_sim().payload(SimPayload::MultiPart),
        AcquirerConfig::default(),
    );
    acq.start().unwrap();
    let payload = acq.fetch(Duration::from_secs(1)).unwrap();
    assert_eq!(payload.payload_type(), PayloadType::MultiPart);
    let kinds: Vec<ComponentKind> = payload.components().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ComponentKind::Intensity, ComponentKind::Confidence]);
    let image = payload.image().unwrap();
    assert_eq!(payload.data(image).len(), sim.config().width * sim.config().height);
    drop(payload);
    acq.destroy();

    let (_engine, _sim, acq) = acquirer(
        fast_sim().payload(SimPayload::ImageWithChunks),
        AcquirerConfig::default(),
    );
    acq.start().unwrap();
    let payload = acq.fetch(Duration::from_secs(1)).unwrap();
    assert!(payload.components().iter().any(|c| c.kind == ComponentKind::Chunk));
    assert!(payload.image().is_some());
    assert!(!payload.is_incomplete());
}

#[test]
fn test_events_and_statistics() {
    let (_engine, _sim, acq) = acquirer(fast_sim(), config(DeliveryPolicy::Block, 1, 3));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    acq.on_event(move |event| sink.lock().push(event.clone()));

    acq.start().unwrap();
    for _ in 0..3 {
        acq.fetch(Duration::from_secs(1)).unwrap().release();
    }
    acq.stop().unwrap();

    let events = events.lock();
    assert_eq!(events.first(), Some(&AcquirerEvent::AcquisitionStarted));
    assert_eq!(events.last(), Some(&AcquirerEvent::AcquisitionStopped));
    assert!(events.contains(&AcquirerEvent::NewBufferAvailable { frame_id: 2 }));

    let stats = acq.statistics();
    assert!(stats.delivered >= 3);
    assert!(stats.last_frame_id.is_some());
    acq.reset_statistics();
    assert_eq!(acq.statistics().delivered, 0);
}

#[test]
fn test_try_fetch_returns_none_on_timeout() {
    let slow = SimConfig::single_device("SIM-0").frame_interval(Duration::from_millis(500));
    let (_engine, _sim, acq) = acquirer(slow, config(DeliveryPolicy::Block, 1, 2));
    acq.start().unwrap();
    // The first frame is immediate; the second is 500ms away.
    assert!(acq.try_fetch(Duration::from_secs(1)).unwrap().is_some());
    assert!(acq.try_fetch(Duration::from_millis(20)).unwrap().is_none());
    assert_eq!(acq.statistics().fetch_timeouts, 1);
}
