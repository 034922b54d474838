//! Transport buffer pool.
//!
//! A [`BufferPool`] owns a fixed set of aligned memory blocks announced to
//! one data stream. Each block carries an ownership tag that says who may
//! touch it:
//!
//! ```text
//!            arm / reclaim                 producer fills
//!   Free ─────────────────────► Queued ─────────────────────► Filled
//!    ▲                                                          │
//!    │ lease dropped                               deliver      │
//!    └────────────────────────── Delivered ◄────────────────────┘
//!
//!   any state ── close() ──► Revoked  (Delivered waits for its lease)
//! ```
//!
//! # Key invariant
//!
//! A block is only ever queued to the producer from `Free`. The transition
//! is a compare-and-swap on the tag, so a block held by a consumer
//! (`Delivered`) can never be handed back to the producer while the
//! consumer still reads it. Breaking this is a bug in the engine, not a
//! runtime condition, and panics.
//!
//! # Gate
//!
//! Native queue and revoke calls are serialised by a small gate mutex that
//! also records whether the pool is `Armed` (streaming, released blocks go
//! straight back to the producer), `Idle` (stopped, released blocks stay
//! free) or `Closed` (revoked, released blocks are retired). Tag
//! transitions themselves are lock-free.
//!
//! # Memory
//!
//! Block memory is allocated by the pool, not by the producer, and is
//! reference counted. A [`BufferLease`] keeps its block alive, so a lease
//! that outlives [`BufferPool::close`] stays readable; it is reported as
//! detached and releasing it does nothing.

use harvest_core::{HandleKind, HandleRegistry, HarvestError, HarvestResult, RawHandle, TeardownReport};
use harvest_transport::Producer;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Aligned memory
// =============================================================================

/// A zeroed, aligned heap block.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuffer is a plain owned allocation. Concurrent access to
// its bytes is coordinated by the pool's ownership tags.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `align` (rounded up to a power
    /// of two). `None` if the size is zero or the allocation fails.
    pub fn new(len: usize, align: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let align = align.max(1).checked_next_power_of_two()?;
        let layout = Layout::from_size_align(len, align).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    /// Start of the block, as announced to the producer. Writing through it
    /// is only sound while the pool's ownership tags allow it.
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Actual alignment, a power of two at least the requested one.
    #[must_use]
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// # Safety
    ///
    /// Nobody may write to the block for the lifetime of the slice.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live allocation; the caller rules out writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// =============================================================================
// Ownership tags
// =============================================================================

/// Who currently owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BufferState {
    /// Owned by the pool; may be queued.
    Free = 0,
    /// Owned by the producer.
    Queued = 1,
    /// Returned by the producer, owned by the acquisition thread.
    Filled = 2,
    /// Owned by a consumer through a [`BufferLease`].
    Delivered = 3,
    /// Revoked from the stream; never used again.
    Revoked = 4,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Queued,
            2 => Self::Filled,
            3 => Self::Delivered,
            _ => Self::Revoked,
        }
    }
}

/// Snapshot of how many blocks are in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Owned by the pool, neither queued nor handed out.
    pub free: usize,
    /// With the producer, waiting to be filled.
    pub queued: usize,
    /// Returned by the producer, not yet wrapped in a payload.
    pub filled: usize,
    /// Held by a payload in the delivery queue or by the consumer.
    pub delivered: usize,
    /// Revoked from the stream; no longer usable.
    pub revoked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Idle,
    Armed,
    Closed,
}

struct Slot {
    memory: Arc<AlignedBuffer>,
    handle: RawHandle,
    state: AtomicU8,
}

impl Slot {
    fn load(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: BufferState, to: BufferState) -> Result<(), BufferState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BufferState::from_u8)
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Fixed-size set of blocks announced to one data stream.
pub struct BufferPool {
    producer: Arc<dyn Producer>,
    registry: Arc<HandleRegistry>,
    stream: RawHandle,
    buffer_size: usize,
    slots: Vec<Slot>,
    gate: Mutex<Gate>,
    requeued: AtomicU64,
}

impl BufferPool {
    /// Allocate `count` blocks of `buffer_size` bytes and announce them.
    ///
    /// Blocks start `Free`; nothing is queued until [`BufferPool::arm`]. If
    /// an announce fails, the blocks announced so far are revoked again.
    pub fn allocate(
        producer: Arc<dyn Producer>,
        registry: Arc<HandleRegistry>,
        stream: RawHandle,
        count: usize,
        buffer_size: usize,
        alignment: usize,
    ) -> HarvestResult<Arc<Self>> {
        if count == 0 {
            return Err(HarvestError::Configuration("buffer count must be > 0".into()));
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(count);
        for index in 0..count {
            let result = AlignedBuffer::new(buffer_size, alignment)
                .ok_or_else(|| {
                    HarvestError::Configuration(format!(
                        "cannot allocate {} byte buffer aligned to {}",
                        buffer_size, alignment
                    ))
                })
                .and_then(|memory| {
                    let base = memory.as_mut_ptr();
                    let handle = registry.open(
                        HandleKind::Buffer,
                        Some(stream),
                        format!("buffer {}", index),
                        // SAFETY: the block is owned by the slot and outlives
                        // the matching revoke in `close`.
                        || unsafe { producer.announce_buffer(stream, base, buffer_size, index) },
                    )?;
                    Ok(Slot {
                        memory: Arc::new(memory),
                        handle,
                        state: AtomicU8::new(BufferState::Free as u8),
                    })
                });
            match result {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots.iter().rev() {
                        let handle = slot.handle;
                        if let Err(revoke) =
                            registry.close(handle, |_| producer.revoke_buffer(stream, handle))
                        {
                            warn!(%handle, error = %revoke, "Revoke after failed allocation failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(count, buffer_size, %stream, "Announced buffer pool");
        Ok(Arc::new(Self {
            producer,
            registry,
            stream,
            buffer_size,
            slots,
            gate: Mutex::new(Gate::Idle),
            requeued: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn stream(&self) -> RawHandle {
        self.stream
    }

    /// Native handle of block `index`.
    #[must_use]
    pub fn handle(&self, index: usize) -> Option<RawHandle> {
        self.slots.get(index).map(|s| s.handle)
    }

    #[must_use]
    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.slots.get(index).map(Slot::load)
    }

    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in &self.slots {
            match slot.load() {
                BufferState::Free => counts.free += 1,
                BufferState::Queued => counts.queued += 1,
                BufferState::Filled => counts.filled += 1,
                BufferState::Delivered => counts.delivered += 1,
                BufferState::Revoked => counts.revoked += 1,
            }
        }
        counts
    }

    /// Number of blocks that went back to the producer after a consumer released them.
    #[must_use]
    pub fn requeued_total(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.gate.lock() == Gate::Closed
    }

    /// Queue one block. Caller holds the gate.
    #[allow(clippy::panic)]
    fn queue_locked(&self, index: usize) -> HarvestResult<()> {
        let slot = &self.slots[index];
        if let Err(actual) = slot.transition(BufferState::Free, BufferState::Queued) {
            panic!(
                "internal invariant violated: buffer {} queued while {:?}",
                index, actual
            );
        }
        if let Err(e) = self.producer.queue_buffer(self.stream, slot.handle) {
            slot.state.store(BufferState::Free as u8, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Queue every free block and start requeueing released ones.
    pub fn arm(&self) -> HarvestResult<()> {
        let mut gate = self.gate.lock();
        if *gate == Gate::Closed {
            return Err(HarvestError::state("arm", "Closed"));
        }
        for index in 0..self.slots.len() {
            if self.slots[index].load() == BufferState::Free {
                self.queue_locked(index)?;
            }
        }
        *gate = Gate::Armed;
        debug!(stream = %self.stream, queued = self.counts().queued, "Buffer pool armed");
        Ok(())
    }

    /// Stop requeueing released blocks.
    pub fn disarm(&self) {
        let mut gate = self.gate.lock();
        if *gate == Gate::Armed {
            *gate = Gate::Idle;
        }
    }

    /// Map a new-buffer event back to its block and take it from the producer.
    pub fn mark_filled(&self, index: usize, handle: RawHandle) -> HarvestResult<()> {
        let slot = self.slots.get(index).filter(|s| s.handle == handle).ok_or_else(|| {
            HarvestError::HandleMisuse(format!(
                "producer returned unknown buffer {} (index {})",
                handle, index
            ))
        })?;
        slot.transition(BufferState::Queued, BufferState::Filled)
            .map_err(|actual| {
                HarvestError::HandleMisuse(format!(
                    "producer returned buffer {} that was {:?}, not queued",
                    index, actual
                ))
            })
    }

    /// Hand a filled block to a consumer.
    pub fn deliver(self: &Arc<Self>, index: usize) -> HarvestResult<BufferLease> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| HarvestError::HandleMisuse(format!("no buffer {}", index)))?;
        slot.transition(BufferState::Filled, BufferState::Delivered)
            .map_err(|actual| {
                HarvestError::HandleMisuse(format!("buffer {} delivered while {:?}", index, actual))
            })?;
        Ok(BufferLease {
            pool: Arc::clone(self),
            index,
            memory: Arc::clone(&slot.memory),
            released: false,
        })
    }

    /// Give a filled block back without delivering it (e.g. its info could not be read).
    pub fn discard_filled(&self, index: usize) -> HarvestResult<()> {
        let gate = self.gate.lock();
        let Some(slot) = self.slots.get(index) else {
            return Ok(());
        };
        if slot.transition(BufferState::Filled, BufferState::Free).is_err() {
            return Ok(());
        }
        if *gate == Gate::Armed {
            self.queue_locked(index)?;
        }
        Ok(())
    }

    /// Return a delivered block. Called from [`BufferLease`]'s drop.
    fn reclaim(&self, index: usize) {
        let gate = self.gate.lock();
        let slot = &self.slots[index];
        match *gate {
            Gate::Closed => {
                let _ = slot.transition(BufferState::Delivered, BufferState::Revoked);
            }
            Gate::Idle => {
                let _ = slot.transition(BufferState::Delivered, BufferState::Free);
            }
            Gate::Armed => {
                if slot.transition(BufferState::Delivered, BufferState::Free).is_ok() {
                    match self.queue_locked(index) {
                        Ok(()) => {
                            self.requeued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Left free; the next arm() queues it again.
                            warn!(index, error = %e, "Requeue of released buffer failed");
                        }
                    }
                }
            }
        }
    }

    /// After the stream is stopped and flushed, everything the producer or
    /// the acquisition thread still held becomes free.
    pub fn reclaim_after_stop(&self) {
        let _gate = self.gate.lock();
        for slot in &self.slots {
            let _ = slot.transition(BufferState::Queued, BufferState::Free);
            let _ = slot.transition(BufferState::Filled, BufferState::Free);
        }
    }

    /// Revoke every block from the stream. Idempotent.
    ///
    /// The stream must be stopped and flushed. Blocks held by consumers stay
    /// readable through their leases and retire when released.
    pub fn close(&self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let mut gate = self.gate.lock();
        if *gate == Gate::Closed {
            return report;
        }
        *gate = Gate::Closed;
        for slot in &self.slots {
            let handle = slot.handle;
            if self.registry.is_open(handle) {
                report.record(
                    "DSRevokeBuffer",
                    self.registry
                        .close(handle, |_| self.producer.revoke_buffer(self.stream, handle)),
                );
            }
            let state = slot.load();
            if state != BufferState::Delivered {
                slot.state.store(BufferState::Revoked as u8, Ordering::Release);
            }
        }
        debug!(stream = %self.stream, failures = report.failures().len(), "Buffer pool closed");
        report
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            warn!(failures = report.failures().len(), "Buffer pool dropped with revoke failures");
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stream", &self.stream)
            .field("buffer_size", &self.buffer_size)
            .field("counts", &self.counts())
            .finish()
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Consumer ownership of one delivered block.
///
/// Dropping the lease hands the block back to the pool.
pub struct BufferLease {
    pool: Arc<BufferPool>,
    index: usize,
    memory: Arc<AlignedBuffer>,
    released: bool,
}

impl BufferLease {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn handle(&self) -> RawHandle {
        self.pool.slots[self.index].handle
    }

    /// The whole block, including bytes past the filled size.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: a Delivered block is never queued, and a revoked block is
        // unknown to the producer, so nothing writes while the lease lives.
        unsafe { self.memory.as_slice() }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// The pool was closed while this lease was out.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.pool.is_closed()
    }

    /// Return the block now rather than at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.reclaim(self.index);
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("index", &self.index)
            .field("capacity", &self.memory.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_transport::{AccessMode, SimConfig, SimProducer};
    use std::time::Duration;

    struct Fixture {
        sim: Arc<SimProducer>,
        registry: Arc<HandleRegistry>,
        stream: RawHandle,
        event: RawHandle,
    }

    fn fixture() -> Fixture {
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
        let event = p.register_new_buffer_event(stream).unwrap();
        Fixture { sim, registry, stream, event }
    }

    fn pool(f: &Fixture, count: usize) -> Arc<BufferPool> {
        let size = f.sim.config().payload_size();
        BufferPool::allocate(f.sim.clone(), f.registry.clone(), f.stream, count, size, 64).unwrap()
    }

    fn next_filled(f: &Fixture, pool: &BufferPool) -> usize {
        let new = f.sim.wait_new_buffer(f.event, Duration::from_secs(1)).unwrap();
        pool.mark_filled(new.user_index, new.buffer).unwrap();
        new.user_index
    }

    #[test]
    fn test_aligned_buffer() {
        let buffer = AlignedBuffer::new(100, 48).unwrap();
        assert_eq!(buffer.align(), 64);
        assert_eq!(buffer.as_mut_ptr() as usize % 64, 0);
        assert!(AlignedBuffer::new(0, 8).is_none());
    }

    #[test]
    fn test_allocate_announces_and_close_revokes() {
        let f = fixture();
        let pool = pool(&f, 3);
        assert_eq!(f.registry.count_kind(HandleKind::Buffer), 3);
        assert_eq!(pool.counts().free, 3);

        let report = pool.close();
        assert!(report.is_clean());
        assert_eq!(f.registry.count_kind(HandleKind::Buffer), 0);
        assert_eq!(pool.counts().revoked, 3);
        // Second close is a no-op.
        assert!(pool.close().is_clean());
    }

    #[test]
    fn test_lease_requeues_only_after_release() {
        let f = fixture();
        let pool = pool(&f, 2);
        pool.arm().unwrap();
        f.sim.start_acquisition(f.stream).unwrap();

        let index = next_filled(&f, &pool);
        let lease = pool.deliver(index).unwrap();
        assert_eq!(pool.state(index), Some(BufferState::Delivered));
        assert_eq!(lease.bytes().len(), pool.buffer_size());

        drop(lease);
        assert_eq!(pool.state(index), Some(BufferState::Queued));
        assert_eq!(pool.requeued_total(), 1);
        f.sim.stop_acquisition(f.stream).unwrap();
    }

    #[test]
    fn test_release_while_idle_frees() {
        let f = fixture();
        let pool = pool(&f, 2);
        pool.arm().unwrap();
        f.sim.start_acquisition(f.stream).unwrap();
        let index = next_filled(&f, &pool);
        let lease = pool.deliver(index).unwrap();

        pool.disarm();
        f.sim.stop_acquisition(f.stream).unwrap();
        f.sim.flush_queue(f.stream, harvest_transport::FlushMode::AllDiscard).unwrap();
        pool.reclaim_after_stop();
        assert_eq!(pool.counts().delivered, 1);

        lease.release();
        assert_eq!(pool.counts().free, 2);
    }

    #[test]
    fn test_close_detaches_outstanding_lease() {
        let f = fixture();
        let pool = pool(&f, 2);
        pool.arm().unwrap();
        f.sim.start_acquisition(f.stream).unwrap();
        let index = next_filled(&f, &pool);
        let lease = pool.deliver(index).unwrap();
        let first_byte = lease.bytes()[0];

        pool.disarm();
        f.sim.stop_acquisition(f.stream).unwrap();
        f.sim.flush_queue(f.stream, harvest_transport::FlushMode::AllDiscard).unwrap();
        pool.reclaim_after_stop();
        assert!(pool.close().is_clean());

        assert!(lease.is_detached());
        assert_eq!(lease.bytes()[0], first_byte);
        lease.release();
        assert_eq!(pool.counts().revoked, 2);
    }

    #[test]
    fn test_unknown_buffer_is_rejected() {
        let f = fixture();
        let pool = pool(&f, 1);
        let err = pool.mark_filled(0, RawHandle::new(0xdead)).unwrap_err();
        assert!(matches!(err, HarvestError::HandleMisuse(_)));
        // Not queued yet, so even the right handle is a protocol violation.
        let handle = pool.handle(0).unwrap();
        assert!(pool.mark_filled(0, handle).is_err());
    }

    #[test]
    #[should_panic(expected = "internal invariant violated")]
    fn test_queueing_a_non_free_buffer_panics() {
        let f = fixture();
        let pool = pool(&f, 1);
        pool.arm().unwrap();
        // Force the tag out of Free behind the pool's back, then re-arm.
        pool.slots[0].state.store(BufferState::Delivered as u8, Ordering::Release);
        let gate = pool.gate.lock();
        let _ = pool.queue_locked(0);
        drop(gate);
    }
}
