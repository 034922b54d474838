//! Image acquirer.
//!
//! The unit an application creates, starts, stops and destroys. It owns one
//! device handle, one data stream, the stream's buffer pool, the
//! acquisition thread and the delivery queue.
//!
//! ```text
//!   Created ──open()──► Opened ──start()──► Acquiring ──stop()──► Stopped
//!                                              ▲                    │
//!                                              └──────start()───────┘
//!   any state ──destroy()──► Destroyed
//! ```
//!
//! The state above is the single source of truth; the acquisition thread's
//! own state is only consulted to notice that it ended on its own (device
//! lost), in which case the acquirer moves to `Stopped` on the next call.
//!
//! # Locking
//!
//! `open`, `start`, `stop` and `destroy` are serialized by a lifecycle lock.
//! The state lock is only held for short sections and never while joining
//! the acquisition thread, so event callbacks may call back into the
//! acquirer (`state()`, `fetch()`, `stop()`) while a stop is in progress.
//!
//! Called from a callback, `stop()` only requests the stop; the thread
//! finishes once the callback returns. `destroy()` from a callback (or the
//! last handle dropped there) hands the teardown to a helper thread that
//! waits for the acquisition thread first.
//!
//! # Outstanding payloads
//!
//! `destroy()` never waits for the consumer. Buffer memory belongs to the
//! engine, so destroy revokes every buffer from the stream and closes the
//! stream and device; payloads still held become detached (readable, and
//! releasing them does nothing).

use crate::acquisition::{AcquisitionThread, Shared, StreamContext, WorkerState};
use crate::binding::ProducerBinding;
use crate::config::AcquirerConfig;
use crate::diagnostics::DiagnosticEvent;
use crate::discovery::DeviceInfo;
use crate::events::{AcquirerEvent, CallbackId};
use crate::payload::Payload;
use crate::queue::{delivery_channel, DeliveryQueue};
use crate::statistics::AcquisitionStatistics;
use harvest_core::{HarvestError, HarvestResult, RawHandle, TeardownReport};
use harvest_pool::{BufferPool, PoolCounts};
use harvest_transport::StreamProperties;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

static NEXT_ACQUIRER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an acquirer within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcquirerId(u64);

impl fmt::Display for AcquirerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acquirer-{}", self.0)
    }
}

/// Lifecycle state of an [`ImageAcquirer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquirerState {
    /// Device known, nothing opened.
    Created,
    /// Device and data stream open; no buffers announced yet.
    Opened,
    /// The acquisition thread is running.
    Acquiring,
    /// Stream stopped; pending payloads can still be fetched.
    Stopped,
    /// Every handle released. Terminal.
    Destroyed,
}

impl fmt::Display for AcquirerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The engine's set of live acquirers. Weak, so dropping the last user
/// handle destroys an acquirer.
#[derive(Debug, Default)]
pub(crate) struct AcquirerSet {
    live: Mutex<Vec<(AcquirerId, Weak<ImageAcquirer>)>>,
}

impl AcquirerSet {
    pub(crate) fn insert(&self, acquirer: &Arc<ImageAcquirer>) {
        self.live.lock().push((acquirer.id(), Arc::downgrade(acquirer)));
    }

    pub(crate) fn remove(&self, id: AcquirerId) {
        self.live.lock().retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Live acquirers, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ImageAcquirer>> {
        self.live.lock().iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }
}

struct Inner {
    state: AcquirerState,
    config: AcquirerConfig,
    device: Option<RawHandle>,
    stream: Option<RawHandle>,
    properties: Option<StreamProperties>,
    pool: Option<Arc<BufferPool>>,
    worker: Option<AcquisitionThread>,
    /// Kept until the thread is joined, also while `worker` is taken.
    worker_thread: Option<ThreadId>,
    /// Set by a callback's `destroy()` while a stop is joining the thread.
    destroy_pending: bool,
    queue: Option<DeliveryQueue>,
}

impl Inner {
    fn on_acquisition_thread(&self) -> bool {
        self.worker_thread == Some(thread::current().id())
    }
}

/// Resources taken out of an acquirer that is being destroyed, released in
/// dependency order.
struct Teardown {
    worker: Option<AcquisitionThread>,
    queue: Option<DeliveryQueue>,
    pool: Option<Arc<BufferPool>>,
    stream: Option<RawHandle>,
    device: Option<RawHandle>,
}

impl Teardown {
    /// Empty `inner` and mark it destroyed.
    fn take(inner: &mut Inner) -> Self {
        inner.state = AcquirerState::Destroyed;
        inner.properties = None;
        inner.worker_thread = None;
        inner.destroy_pending = false;
        Self {
            worker: inner.worker.take(),
            queue: inner.queue.take(),
            pool: inner.pool.take(),
            stream: inner.stream.take(),
            device: inner.device.take(),
        }
    }

    fn run(self, binding: &ProducerBinding) -> TeardownReport {
        let Self {
            worker,
            queue,
            pool,
            stream,
            device,
        } = self;
        let mut report = TeardownReport::new();
        if let Some(mut worker) = worker {
            report.merge(worker.stop());
        }
        // Pending payloads go back to the pool before it closes.
        drop(queue);
        if let Some(pool) = pool {
            report.merge(pool.close());
        }
        if let Some(stream) = stream {
            report.record("DSClose", binding.close_handle(stream));
        }
        if let Some(device) = device {
            report.record("DevClose", binding.close_handle(device));
        }
        report
    }
}

/// Streaming session on one device.
pub struct ImageAcquirer {
    id: AcquirerId,
    device: DeviceInfo,
    binding: Arc<ProducerBinding>,
    owner: Weak<AcquirerSet>,
    shared: Arc<Shared>,
    lifecycle: Mutex<()>,
    inner: Mutex<Inner>,
}

impl ImageAcquirer {
    pub(crate) fn new(
        device: DeviceInfo,
        binding: Arc<ProducerBinding>,
        config: AcquirerConfig,
        owner: Weak<AcquirerSet>,
    ) -> HarvestResult<Self> {
        config.validate()?;
        Ok(Self {
            id: AcquirerId(NEXT_ACQUIRER_ID.fetch_add(1, Ordering::Relaxed)),
            device,
            binding,
            owner,
            shared: Arc::new(Shared::default()),
            lifecycle: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: AcquirerState::Created,
                config,
                device: None,
                stream: None,
                properties: None,
                pool: None,
                worker: None,
                worker_thread: None,
                destroy_pending: false,
                queue: None,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> AcquirerId {
        self.id
    }

    #[must_use]
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    #[must_use]
    pub fn producer(&self) -> &Arc<ProducerBinding> {
        &self.binding
    }

    pub fn state(&self) -> AcquirerState {
        let mut inner = self.inner.lock();
        self.sync_worker(&mut inner);
        inner.state
    }

    /// State of the acquisition thread, `Idle` when there is none.
    pub fn worker_state(&self) -> WorkerState {
        self.inner
            .lock()
            .worker
            .as_ref()
            .map_or(WorkerState::Idle, AcquisitionThread::state)
    }

    #[must_use]
    pub fn config(&self) -> AcquirerConfig {
        self.inner.lock().config.clone()
    }

    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.inner.lock().config.num_buffers
    }

    /// Stream parameters, once the device is open.
    #[must_use]
    pub fn stream_properties(&self) -> Option<StreamProperties> {
        self.inner.lock().properties
    }

    /// Buffer ownership counts of the current pool.
    #[must_use]
    pub fn pool_counts(&self) -> Option<PoolCounts> {
        self.inner.lock().pool.as_ref().map(|pool| pool.counts())
    }

    /// Payloads waiting in the delivery queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.as_ref().map_or(0, DeliveryQueue::len)
    }

    /// Take the lifecycle lock. Refused on the acquisition thread, where a
    /// stop on another thread may hold it while waiting for this thread.
    fn serialize(&self, op: &'static str) -> HarvestResult<MutexGuard<'_, ()>> {
        if self.inner.lock().on_acquisition_thread() {
            return Err(HarvestError::state(op, "called from an event callback"));
        }
        Ok(self.lifecycle.lock())
    }

    /// Open the device and its first data stream. `Created` only.
    pub fn open(&self) -> HarvestResult<()> {
        let _lifecycle = self.serialize("open")?;
        let mut inner = self.inner.lock();
        if inner.state != AcquirerState::Created {
            return Err(HarvestError::state("open", inner.state));
        }
        let producer = self.device.producer()?;
        if !Arc::ptr_eq(&producer, &self.binding) {
            return Err(HarvestError::state("open", "producer was reloaded"));
        }

        let device = self.binding.open_device(
            self.device.interface_handle(),
            self.device.id(),
            inner.config.access,
        )?;
        let opened = self.binding.open_stream(device).and_then(|stream| {
            match self.binding.producer().stream_properties(stream) {
                Ok(properties) => Ok((stream, properties)),
                Err(e) => {
                    if let Err(close) = self.binding.close_handle(stream) {
                        warn!(acquirer = %self.id, error = %close, "Closing stream after failed open failed");
                    }
                    Err(e.into())
                }
            }
        });
        let (stream, properties) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(close) = self.binding.close_handle(device) {
                    warn!(acquirer = %self.id, error = %close, "Closing device after failed open failed");
                }
                return Err(e);
            }
        };

        inner.device = Some(device);
        inner.stream = Some(stream);
        inner.properties = Some(properties);
        inner.state = AcquirerState::Opened;
        info!(
            acquirer = %self.id,
            device = %self.device.id(),
            payload_size = ?properties.payload_size,
            announce_min = properties.announce_min,
            "Device opened"
        );
        Ok(())
    }

    /// Start streaming. Valid in `Opened` and `Stopped`.
    pub fn start(&self) -> HarvestResult<()> {
        let _lifecycle = self.serialize("start")?;
        let mut inner = self.inner.lock();
        self.sync_worker(&mut inner);
        if !matches!(inner.state, AcquirerState::Opened | AcquirerState::Stopped) {
            return Err(HarvestError::state("start", inner.state));
        }
        let (Some(stream), Some(properties)) = (inner.stream, inner.properties) else {
            return Err(HarvestError::state("start", "no data stream"));
        };

        // Payloads left over from a previous run go back to the pool first.
        inner.queue = None;
        let pool = self.ensure_pool(&mut inner, stream, properties)?;

        let config = &inner.config;
        let (sender, queue) = delivery_channel(config.effective_queue_depth(), config.policy);
        let ctx = StreamContext {
            producer: self.binding.producer().clone(),
            registry: self.binding.registry().clone(),
            stream,
            device_id: self.device.id().to_string(),
            wait_timeout: config.wait_timeout,
        };
        let worker = AcquisitionThread::start(ctx, pool, sender, self.shared.clone())?;
        worker.wait_running(config.wait_timeout);

        inner.worker_thread = worker.thread_id();
        inner.worker = Some(worker);
        inner.queue = Some(queue);
        inner.state = AcquirerState::Acquiring;
        Ok(())
    }

    /// The pool for the next run; reallocated when the buffer count changed.
    fn ensure_pool(
        &self,
        inner: &mut Inner,
        stream: RawHandle,
        properties: StreamProperties,
    ) -> HarvestResult<Arc<BufferPool>> {
        let count = inner.config.num_buffers.max(properties.announce_min);
        if let Some(pool) = &inner.pool {
            if pool.len() == count {
                return Ok(pool.clone());
            }
        }
        if let Some(old) = inner.pool.take() {
            let report = old.close();
            self.shared.record_teardown(&report);
            debug!(acquirer = %self.id, old = old.len(), new = count, "Reallocating buffer pool");
        }

        let buffer_size = properties
            .payload_size
            .or(inner.config.payload_size_hint)
            .ok_or_else(|| {
                HarvestError::Configuration(
                    "stream reports no payload size and payload_size_hint is unset".into(),
                )
            })?;
        let pool = BufferPool::allocate(
            self.binding.producer().clone(),
            self.binding.registry().clone(),
            stream,
            count,
            buffer_size,
            properties.alignment,
        )?;
        inner.pool = Some(pool.clone());
        Ok(pool)
    }

    /// Stop streaming. A no-op unless acquiring.
    ///
    /// Returns once the acquisition thread has exited and the native
    /// acquisition, event and queued buffers are released. Failures on the
    /// way are collected, not returned early.
    ///
    /// From an event callback this only requests the stop and returns an
    /// empty report; the acquirer turns `Stopped` once the thread is done.
    pub fn stop(&self) -> HarvestResult<TeardownReport> {
        {
            let inner = self.inner.lock();
            if inner.state == AcquirerState::Destroyed {
                return Err(HarvestError::state("stop", inner.state));
            }
            if inner.on_acquisition_thread() {
                // `worker` is absent while another thread is already joining it.
                if let Some(worker) = &inner.worker {
                    worker.request_stop();
                }
                debug!(acquirer = %self.id, "Stop requested from an event callback");
                return Ok(TeardownReport::new());
            }
        }
        let _lifecycle = self.lifecycle.lock();
        self.stop_serialized()
    }

    /// Caller holds the lifecycle lock.
    fn stop_serialized(&self) -> HarvestResult<TeardownReport> {
        let worker = {
            let mut inner = self.inner.lock();
            match inner.state {
                AcquirerState::Destroyed => return Err(HarvestError::state("stop", inner.state)),
                AcquirerState::Acquiring => inner.worker.take(),
                _ => {
                    // The thread may have ended on its own; its report was already recorded.
                    self.sync_worker(&mut inner);
                    return Ok(TeardownReport::new());
                }
            }
        };

        let mut report = worker.map_or_else(TeardownReport::new, |mut worker| worker.stop());
        let mut inner = self.inner.lock();
        self.mark_stopped(&mut inner);
        if inner.destroy_pending {
            let teardown = Teardown::take(&mut inner);
            drop(inner);
            let destroyed = teardown.run(&self.binding);
            self.finish_destroy(AcquirerState::Stopped, &destroyed);
            report.merge(destroyed);
        }
        Ok(report)
    }

    fn mark_stopped(&self, inner: &mut Inner) {
        inner.worker_thread = None;
        inner.state = AcquirerState::Stopped;
        let counts = inner.pool.as_ref().map(|pool| pool.counts());
        info!(acquirer = %self.id, pending = inner.queue.as_ref().map_or(0, DeliveryQueue::len), ?counts, "Acquirer stopped");
    }

    /// Notice a thread that ended on its own.
    fn sync_worker(&self, inner: &mut Inner) {
        if inner.state == AcquirerState::Acquiring
            && inner.worker.as_ref().is_some_and(AcquisitionThread::is_finished)
        {
            warn!(acquirer = %self.id, "Acquisition thread ended; acquirer stopped");
            // Already finished, so the join does not block.
            if let Some(mut worker) = inner.worker.take() {
                worker.stop();
            }
            self.mark_stopped(inner);
        }
    }

    /// Next payload, waiting up to `timeout`.
    ///
    /// Valid while acquiring, and while stopped as long as payloads are
    /// pending. After a device loss the pending payloads come first, then
    /// the `DeviceLost` error.
    pub fn fetch(&self, timeout: Duration) -> HarvestResult<Payload> {
        let queue = {
            let mut inner = self.inner.lock();
            self.sync_worker(&mut inner);
            match (inner.state, &inner.queue) {
                (AcquirerState::Acquiring | AcquirerState::Stopped, Some(queue)) => queue.clone(),
                (state, _) => return Err(HarvestError::state("fetch", state)),
            }
        };
        match queue.pop(timeout) {
            Err(HarvestError::Timeout(t)) => {
                self.shared.statistics.record_fetch_timeout();
                Err(HarvestError::Timeout(t))
            }
            other => other,
        }
    }

    /// Like [`ImageAcquirer::fetch`], but a timeout is `Ok(None)`.
    pub fn try_fetch(&self, timeout: Duration) -> HarvestResult<Option<Payload>> {
        match self.fetch(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(HarvestError::Timeout(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Change the buffer count. Valid in `Opened` and `Stopped`; applied at
    /// the next `start()`.
    pub fn set_num_buffers(&self, count: usize) -> HarvestResult<()> {
        let mut inner = self.inner.lock();
        self.sync_worker(&mut inner);
        if !matches!(inner.state, AcquirerState::Opened | AcquirerState::Stopped) {
            return Err(HarvestError::state("set_num_buffers", inner.state));
        }
        if count == 0 {
            return Err(HarvestError::Configuration("num_buffers must be > 0".into()));
        }
        inner.config.num_buffers = count;
        Ok(())
    }

    #[must_use]
    pub fn statistics(&self) -> AcquisitionStatistics {
        self.shared.statistics.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.shared.statistics.reset();
    }

    /// Recent diagnostic events, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<DiagnosticEvent> {
        self.shared.diagnostics.snapshot()
    }

    /// Register a callback run on the acquisition thread.
    pub fn on_event<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&AcquirerEvent) + Send + Sync + 'static,
    {
        self.shared.events.register(Arc::new(callback))
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.shared.events.remove(id)
    }

    /// Tear everything down. Idempotent; valid in every state.
    ///
    /// Stops the acquisition thread if needed, revokes the buffers, closes
    /// the stream and the device. Every step runs even if an earlier one
    /// failed; the failures are returned and recorded in the diagnostics.
    ///
    /// From an event callback the acquirer is `Destroyed` on return, but the
    /// handles are released by a helper thread once the acquisition thread
    /// has finished; its failures go to the diagnostics.
    pub fn destroy(&self) -> TeardownReport {
        {
            let mut inner = self.inner.lock();
            if inner.state == AcquirerState::Destroyed {
                return TeardownReport::new();
            }
            if inner.on_acquisition_thread() {
                let report = self.destroy_from_callback(&mut inner);
                drop(inner);
                if let Some(owner) = self.owner.upgrade() {
                    owner.remove(self.id);
                }
                return report;
            }
        }

        let _lifecycle = self.lifecycle.lock();
        let (from, teardown) = {
            let mut inner = self.inner.lock();
            if inner.state == AcquirerState::Destroyed {
                return TeardownReport::new();
            }
            (inner.state, Teardown::take(&mut inner))
        };
        let report = teardown.run(&self.binding);
        self.finish_destroy(from, &report);
        report
    }

    fn destroy_from_callback(&self, inner: &mut Inner) -> TeardownReport {
        let mut report = TeardownReport::new();
        match &inner.worker {
            Some(worker) => worker.request_stop(),
            None => {
                // A stop on another thread is joining; it finishes the teardown.
                inner.destroy_pending = true;
                debug!(acquirer = %self.id, "Destroy deferred to the stop in progress");
                return report;
            }
        }

        let from = inner.state;
        let teardown = Teardown::take(inner);
        let binding = self.binding.clone();
        let shared = self.shared.clone();
        let id = self.id;
        let device = self.device.id().to_string();
        let spawned = thread::Builder::new()
            .name(format!("harvest-teardown-{}", device))
            .spawn(move || {
                let report = teardown.run(&binding);
                shared.record_teardown(&report);
                info!(acquirer = %id, device = %device, from = %from, failures = report.failures().len(), "Acquirer destroyed");
            });
        if let Err(e) = spawned {
            error!(acquirer = %self.id, error = %e, "Failed to spawn teardown thread; stream and device stay open");
            let failure = HarvestError::state("destroy", format!("teardown thread spawn failed: {}", e));
            report.push(failure);
            self.shared.record_teardown(&report);
        }
        report
    }

    fn finish_destroy(&self, from: AcquirerState, report: &TeardownReport) {
        self.shared.record_teardown(report);
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
        info!(
            acquirer = %self.id,
            device = %self.device.id(),
            from = %from,
            failures = report.failures().len(),
            "Acquirer destroyed"
        );
    }
}

impl Drop for ImageAcquirer {
    fn drop(&mut self) {
        let report = self.destroy();
        if !report.is_clean() {
            warn!(acquirer = %self.id, failures = report.failures().len(), "Acquirer dropped with teardown failures");
        }
    }
}

impl fmt::Debug for ImageAcquirer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ImageAcquirer")
            .field("id", &self.id)
            .field("device", &self.device.id())
            .field("state", &inner.state)
            .finish()
    }
}
