//! Delivery queue between an acquisition thread and its consumer.
//!
//! A bounded crossbeam channel. The sending half belongs to the acquisition
//! thread; the receiving half belongs to the acquirer. Payloads come out in
//! the order they went in.
//!
//! When the queue is full the [`DeliveryPolicy`] decides:
//! - `Block`: the acquisition thread waits for the consumer, checking for a
//!   stop request while it waits
//! - `DropOldest`: the oldest queued payload is discarded (its buffer goes
//!   straight back to the producer) and the new one is queued
//! - `NewestOnly`: `DropOldest` with a depth of one
//!
//! When the acquisition thread exits it drops its sender. The consumer can
//! still drain what is queued; after that `pop` reports the fault the thread
//! left behind, or a state error if it stopped normally.

use crate::payload::Payload;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use harvest_core::{HarvestError, HarvestResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval of a blocked push, i.e. how quickly it notices a stop.
const BLOCKED_PUSH_POLL: Duration = Duration::from_millis(10);

/// What happens when a payload arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait for the consumer.
    #[default]
    Block,
    /// Discard the oldest queued payload.
    DropOldest,
    /// Keep only the latest payload.
    NewestOnly,
}

/// Outcome of one push.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Queued; `dropped` older payloads were discarded to make room.
    Delivered { dropped: u64 },
    /// A stop was requested while blocked; the payload was discarded.
    Abandoned,
    /// The consumer side is gone; the payload was discarded.
    Disconnected,
}

type FaultCell = Arc<Mutex<Option<HarvestError>>>;

/// Create a connected sender and queue.
pub(crate) fn delivery_channel(depth: usize, policy: DeliveryPolicy) -> (DeliverySender, DeliveryQueue) {
    let depth = match policy {
        DeliveryPolicy::NewestOnly => 1,
        _ => depth.max(1),
    };
    let (tx, rx) = bounded(depth);
    let fault: FaultCell = Arc::new(Mutex::new(None));
    (
        DeliverySender {
            tx,
            drain: rx.clone(),
            policy,
            fault: fault.clone(),
        },
        DeliveryQueue { rx, depth, fault },
    )
}

/// Producer-side half, owned by the acquisition thread.
pub(crate) struct DeliverySender {
    tx: Sender<Payload>,
    drain: Receiver<Payload>,
    policy: DeliveryPolicy,
    fault: FaultCell,
}

impl DeliverySender {
    pub(crate) fn push(&self, payload: Payload, stop_requested: impl Fn() -> bool) -> PushOutcome {
        match self.policy {
            DeliveryPolicy::Block => self.push_blocking(payload, stop_requested),
            DeliveryPolicy::DropOldest | DeliveryPolicy::NewestOnly => self.push_dropping(payload),
        }
    }

    fn push_blocking(&self, mut payload: Payload, stop_requested: impl Fn() -> bool) -> PushOutcome {
        loop {
            match self.tx.send_timeout(payload, BLOCKED_PUSH_POLL) {
                Ok(()) => return PushOutcome::Delivered { dropped: 0 },
                Err(SendTimeoutError::Timeout(p)) => {
                    if stop_requested() {
                        return PushOutcome::Abandoned;
                    }
                    payload = p;
                }
                Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Disconnected,
            }
        }
    }

    fn push_dropping(&self, mut payload: Payload) -> PushOutcome {
        let mut dropped = 0;
        loop {
            match self.tx.try_send(payload) {
                Ok(()) => return PushOutcome::Delivered { dropped },
                Err(TrySendError::Full(p)) => {
                    // The consumer may have emptied the queue in between.
                    if let Ok(oldest) = self.drain.try_recv() {
                        dropped += 1;
                        drop(oldest);
                    }
                    payload = p;
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Disconnected,
            }
        }
    }

    /// Leave an error for the consumer, reported once the queue is drained.
    pub(crate) fn set_fault(&self, error: HarvestError) {
        *self.fault.lock() = Some(error);
    }
}

/// Consumer-side half.
#[derive(Clone)]
pub struct DeliveryQueue {
    rx: Receiver<Payload>,
    depth: usize,
    fault: FaultCell,
}

impl DeliveryQueue {
    /// Wait up to `timeout` for the next payload.
    pub fn pop(&self, timeout: Duration) -> HarvestResult<Payload> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => Err(HarvestError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Next payload if one is queued.
    pub fn try_pop(&self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Hand a payload's buffer back to the pool.
    pub fn release(&self, payload: Payload) {
        payload.release();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The fault the acquisition thread stopped with, if any.
    #[must_use]
    pub fn fault(&self) -> Option<HarvestError> {
        self.fault.lock().clone()
    }

    fn closed_error(&self) -> HarvestError {
        self.fault()
            .unwrap_or_else(|| HarvestError::state("fetch", "Stopped with no pending payloads"))
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("len", &self.rx.len())
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{HandleKind, HandleRegistry, RawHandle};
    use harvest_pool::BufferPool;
    use harvest_transport::{AccessMode, Producer, SimConfig, SimProducer};

    /// A pool of `count` delivered-ready buffers on a simulated stream.
    struct Rig {
        sim: Arc<SimProducer>,
        pool: Arc<BufferPool>,
        event: RawHandle,
        stream: RawHandle,
    }

    fn rig(count: usize) -> Rig {
        let sim = Arc::new(SimProducer::new(
            SimConfig::single_device("SIM-0").frame_interval(Duration::from_millis(1)),
        ));
        let registry = Arc::new(HandleRegistry::new());
        let p = sim.clone();
        let system = registry.open(HandleKind::System, None, "system", || p.open_system()).unwrap();
        let iface = registry
            .open(HandleKind::Interface, Some(system), "SimIF-0", || p.open_interface(system, "SimIF-0"))
            .unwrap();
        let device = registry
            .open(HandleKind::Device, Some(iface), "SIM-0", || {
                p.open_device(iface, "SIM-0", AccessMode::Exclusive)
            })
            .unwrap();
        let stream = registry
            .open(HandleKind::DataStream, Some(device), "stream", || p.open_stream(device))
            .unwrap();
        let size = sim.config().payload_size();
        let pool = BufferPool::allocate(sim.clone(), registry, stream, count, size, 64).unwrap();
        let event = sim.register_new_buffer_event(stream).unwrap();
        pool.arm().unwrap();
        sim.start_acquisition(stream).unwrap();
        Rig { sim, pool, event, stream }
    }

    impl Rig {
        fn next_payload(&self) -> Payload {
            let new = self.sim.wait_new_buffer(self.event, Duration::from_secs(1)).unwrap();
            self.pool.mark_filled(new.user_index, new.buffer).unwrap();
            let desc = self.sim.buffer_info(self.stream, new.buffer).unwrap();
            let lease = self.pool.deliver(new.user_index).unwrap();
            Payload::new(lease, desc, Vec::new())
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = self.sim.stop_acquisition(self.stream);
        }
    }

    #[test]
    fn test_fifo_order() {
        let rig = rig(3);
        let (tx, queue) = delivery_channel(3, DeliveryPolicy::Block);
        for _ in 0..3 {
            assert_eq!(tx.push(rig.next_payload(), || false), PushOutcome::Delivered { dropped: 0 });
        }
        let ids: Vec<u64> = (0..3).map(|_| queue.pop(Duration::from_millis(10)).unwrap().frame_id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_oldest_requeues_dropped_buffer() {
        let rig = rig(3);
        let (tx, queue) = delivery_channel(1, DeliveryPolicy::DropOldest);
        tx.push(rig.next_payload(), || false);
        let second = rig.next_payload();
        assert_eq!(tx.push(second, || false), PushOutcome::Delivered { dropped: 1 });

        // The discarded frame's buffer went back to the producer.
        assert_eq!(rig.pool.requeued_total(), 1);
        assert_eq!(queue.pop(Duration::from_millis(10)).unwrap().frame_id(), 1);
    }

    #[test]
    fn test_blocked_push_gives_up_on_stop() {
        let rig = rig(2);
        let (tx, _queue) = delivery_channel(1, DeliveryPolicy::Block);
        tx.push(rig.next_payload(), || false);
        assert_eq!(tx.push(rig.next_payload(), || true), PushOutcome::Abandoned);
    }

    #[test]
    fn test_pop_timeout_and_fault() {
        let (tx, queue) = delivery_channel(1, DeliveryPolicy::NewestOnly);
        assert_eq!(queue.depth(), 1);
        assert!(matches!(
            queue.pop(Duration::from_millis(5)),
            Err(HarvestError::Timeout(_))
        ));

        tx.set_fault(HarvestError::DeviceLost {
            device: "SIM-0".into(),
            reason: "unplugged".into(),
        });
        drop(tx);
        assert!(queue.pop(Duration::from_millis(5)).unwrap_err().is_device_lost());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_disconnected_without_fault_is_state_error() {
        let (tx, queue) = delivery_channel(2, DeliveryPolicy::Block);
        drop(tx);
        assert!(matches!(
            queue.pop(Duration::from_millis(5)),
            Err(HarvestError::State { .. })
        ));
    }
}
