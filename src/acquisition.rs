//! The acquisition thread.
//!
//! One dedicated OS thread per acquiring acquirer. State machine:
//!
//! ```text
//!   Idle ──start()──► Armed ──thread up──► Running
//!    ▲                                       │ stop request, abort,
//!    │                                       │ device loss or panic
//!    └────────────── epilogue ◄── Stopping ◄─┘
//! ```
//!
//! `start()` queues every free buffer, registers the new-buffer event and
//! starts the native acquisition before the thread exists, so a failure
//! there is returned to the caller with nothing left running and no buffer
//! left with the producer.
//!
//! Event callbacks run on this thread. A callback may call back into its
//! acquirer; a stop requested from here only raises the flag, and the
//! thread finishes its own epilogue once the callback returns.
//!
//! The loop waits for the producer with a bounded timeout, so a stop request
//! is seen within one `wait_timeout`. An in-progress native wait is never
//! interrupted; it is allowed to return or time out.
//!
//! The epilogue always runs on the thread itself, whatever ended the loop:
//! stop the native acquisition, flush the stream, unregister the event and
//! hand every buffer the thread or producer still holds back to the pool.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::events::{AcquirerEvent, EventHub};
use crate::payload::Payload;
use crate::queue::{DeliverySender, PushOutcome};
use crate::statistics::StatisticsRecorder;
use harvest_core::{
    parse_components, HandleKind, HandleRegistry, HarvestError, HarvestResult, RawHandle,
    TeardownReport,
};
use harvest_pool::BufferPool;
use harvest_transport::{FlushMode, Producer};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Acquisition thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// No acquisition, or the epilogue has finished.
    Idle,
    /// Buffers are queued and the stream started; the thread is not up yet.
    Armed,
    /// The loop is waiting for and delivering buffers.
    Running,
    /// The loop has ended and the epilogue is running.
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-acquirer state shared with its thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) statistics: StatisticsRecorder,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) events: EventHub,
}

impl Shared {
    fn emit(&self, event: AcquirerEvent) {
        self.events.emit(&event, &self.diagnostics);
    }

    pub(crate) fn record_teardown(&self, report: &TeardownReport) {
        for failure in report.failures() {
            self.diagnostics
                .record(DiagnosticKind::TeardownFailure, failure.to_string());
        }
    }
}

/// Everything the thread needs to drive one stream.
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub(crate) producer: Arc<dyn Producer>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) stream: RawHandle,
    pub(crate) device_id: String,
    pub(crate) wait_timeout: Duration,
}

struct Control {
    state: Mutex<WorkerState>,
    changed: Condvar,
    stop: AtomicBool,
}

impl Control {
    fn set(&self, state: WorkerState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

/// Handle to a running acquisition thread.
pub(crate) struct AcquisitionThread {
    control: Arc<Control>,
    join: Option<JoinHandle<TeardownReport>>,
}

impl AcquisitionThread {
    /// Arm the pool, start the stream and spawn the thread.
    pub(crate) fn start(
        ctx: StreamContext,
        pool: Arc<BufferPool>,
        sender: DeliverySender,
        shared: Arc<Shared>,
    ) -> HarvestResult<Self> {
        let control = Arc::new(Control {
            state: Mutex::new(WorkerState::Armed),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        if let Err(e) = pool.arm() {
            rollback_arm(&ctx, &pool, &shared);
            return Err(e);
        }
        let event = match ctx.registry.open(HandleKind::Event, Some(ctx.stream), "new buffer", || {
            ctx.producer.register_new_buffer_event(ctx.stream)
        }) {
            Ok(event) => event,
            Err(e) => {
                rollback_arm(&ctx, &pool, &shared);
                return Err(e);
            }
        };
        if let Err(e) = ctx.producer.start_acquisition(ctx.stream) {
            let report = epilogue(&ctx, event, &pool, false);
            shared.record_teardown(&report);
            return Err(e.into());
        }

        let name = format!("harvest-acq-{}", ctx.device_id);
        let spawned = std::thread::Builder::new().name(name).spawn({
            let ctx = ctx.clone();
            let pool = pool.clone();
            let shared = shared.clone();
            let control = control.clone();
            move || run(ctx, event, pool, sender, shared, control)
        });
        match spawned {
            Ok(join) => Ok(Self {
                control,
                join: Some(join),
            }),
            Err(e) => {
                error!(device = %ctx.device_id, error = %e, "Failed to spawn acquisition thread");
                let report = epilogue(&ctx, event, &pool, true);
                shared.record_teardown(&report);
                Err(HarvestError::state("start", format!("thread spawn failed: {}", e)))
            }
        }
    }

    /// Id of the spawned thread, until it has been joined or detached.
    #[must_use]
    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.join.as_ref().map(|join| join.thread().id())
    }

    /// Ask the loop to end without waiting for it.
    pub(crate) fn request_stop(&self) {
        self.control.stop.store(true, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn state(&self) -> WorkerState {
        *self.control.state.lock()
    }

    /// The thread has left its loop and finished the epilogue.
    #[must_use]
    pub(crate) fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait until the thread is `Running` or has already finished.
    pub(crate) fn wait_running(&self, timeout: Duration) -> WorkerState {
        let mut state = self.control.state.lock();
        if *state == WorkerState::Armed {
            let _ = self
                .control
                .changed
                .wait_while_for(&mut state, |s| *s == WorkerState::Armed, timeout);
        }
        *state
    }

    /// Request a stop and wait for the thread to finish its epilogue.
    ///
    /// Called on the acquisition thread itself, this only requests the stop
    /// and detaches; the epilogue runs after the current callback returns.
    pub(crate) fn stop(&mut self) -> TeardownReport {
        self.request_stop();
        let Some(join) = self.join.take() else {
            return TeardownReport::new();
        };
        if join.thread().id() == std::thread::current().id() {
            debug!("Stop requested from the acquisition thread; not joining");
            return TeardownReport::new();
        }
        match join.join() {
            Ok(report) => report,
            Err(_) => {
                let mut report = TeardownReport::new();
                report.push(HarvestError::state("stop", "acquisition thread panicked during teardown"));
                report
            }
        }
    }
}

impl Drop for AcquisitionThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            let report = self.stop();
            if !report.is_clean() {
                warn!(failures = report.failures().len(), "Acquisition thread dropped with teardown failures");
            }
        }
    }
}

fn run(
    ctx: StreamContext,
    event: RawHandle,
    pool: Arc<BufferPool>,
    sender: DeliverySender,
    shared: Arc<Shared>,
    control: Arc<Control>,
) -> TeardownReport {
    control.set(WorkerState::Running);
    shared.statistics.acquisition_started();
    info!(device = %ctx.device_id, stream = %ctx.stream, buffers = pool.len(), "Acquisition started");
    shared.emit(AcquirerEvent::AcquisitionStarted);

    let outcome = catch_unwind(AssertUnwindSafe(|| acquisition_loop(&ctx, event, &pool, &sender, &shared, &control)));
    if outcome.is_err() {
        error!(device = %ctx.device_id, "Acquisition loop panicked");
        shared
            .diagnostics
            .record(DiagnosticKind::WorkerPanic, "acquisition loop panicked");
        sender.set_fault(HarvestError::state("fetch", "Stopped after an acquisition thread panic"));
    }

    control.set(WorkerState::Stopping);
    let report = epilogue(&ctx, event, &pool, true);
    shared.record_teardown(&report);
    shared.statistics.acquisition_stopped();
    // Disconnects the queue; the consumer drains what is left.
    drop(sender);
    shared.emit(AcquirerEvent::AcquisitionStopped);
    info!(device = %ctx.device_id, failures = report.failures().len(), "Acquisition stopped");
    control.set(WorkerState::Idle);
    report
}

fn acquisition_loop(
    ctx: &StreamContext,
    event: RawHandle,
    pool: &Arc<BufferPool>,
    sender: &DeliverySender,
    shared: &Shared,
    control: &Control,
) {
    let stop_requested = || control.stop.load(Ordering::Acquire);

    while !stop_requested() {
        let new = match ctx.producer.wait_new_buffer(event, ctx.wait_timeout) {
            Ok(new) => new,
            Err(e) if e.is_timeout() => {
                shared.statistics.record_wait_timeout();
                shared.diagnostics.record(DiagnosticKind::WaitTimeout, e.to_string());
                continue;
            }
            Err(e) if e.is_abort() => {
                debug!(device = %ctx.device_id, "Wait aborted");
                break;
            }
            Err(e) => {
                let fault = HarvestError::DeviceLost {
                    device: ctx.device_id.clone(),
                    reason: e.to_string(),
                };
                error!(device = %ctx.device_id, error = %e, "Device lost during acquisition");
                shared.diagnostics.record(DiagnosticKind::DeviceLost, fault.to_string());
                sender.set_fault(fault);
                shared.emit(AcquirerEvent::DeviceLost {
                    reason: e.to_string(),
                });
                break;
            }
        };

        let Some(payload) = build_payload(ctx, pool, new.user_index, new.buffer, shared) else {
            continue;
        };
        let frame_id = payload.frame_id();
        if payload.is_incomplete() {
            shared.statistics.record_incomplete();
        }

        match sender.push(payload, stop_requested) {
            PushOutcome::Delivered { dropped } => {
                if dropped > 0 {
                    shared.statistics.record_dropped(dropped);
                    warn!(device = %ctx.device_id, dropped, "Delivery queue full; dropped oldest payload");
                    shared.diagnostics.record(
                        DiagnosticKind::PayloadDropped,
                        format!("{} payload(s) dropped before frame {}", dropped, frame_id),
                    );
                }
                shared.statistics.record_delivered(frame_id);
                shared.emit(AcquirerEvent::NewBufferAvailable { frame_id });
            }
            PushOutcome::Abandoned => break,
            PushOutcome::Disconnected => {
                debug!(device = %ctx.device_id, "Consumer side gone; leaving loop");
                break;
            }
        }
    }
}

/// Take a filled buffer from the producer and wrap it.
fn build_payload(
    ctx: &StreamContext,
    pool: &Arc<BufferPool>,
    index: usize,
    buffer: RawHandle,
    shared: &Shared,
) -> Option<Payload> {
    if let Err(e) = pool.mark_filled(index, buffer) {
        error!(device = %ctx.device_id, error = %e, "Producer returned an unexpected buffer");
        shared.diagnostics.record(DiagnosticKind::ProtocolViolation, e.to_string());
        return None;
    }

    let described = ctx.producer.buffer_info(ctx.stream, buffer).and_then(|desc| {
        let parts = ctx.producer.buffer_parts(ctx.stream, buffer)?;
        let chunks = ctx.producer.buffer_chunks(ctx.stream, buffer)?;
        Ok((desc, parts, chunks))
    });
    let (desc, parts, chunks) = match described {
        Ok(described) => described,
        Err(e) => {
            warn!(device = %ctx.device_id, error = %e, "Could not read buffer info; requeueing");
            shared.diagnostics.record(DiagnosticKind::NativeError, e.to_string());
            if let Err(e) = pool.discard_filled(index) {
                shared.diagnostics.record(DiagnosticKind::NativeError, e.to_string());
            }
            return None;
        }
    };

    let components = parse_components(&desc, &parts, &chunks, pool.buffer_size());
    match pool.deliver(index) {
        Ok(lease) => Some(Payload::new(lease, desc, components)),
        Err(e) => {
            shared.diagnostics.record(DiagnosticKind::ProtocolViolation, e.to_string());
            None
        }
    }
}

/// Undo a partial `arm()`: stop requeueing, take back whatever the producer
/// holds and return every block to the pool.
fn rollback_arm(ctx: &StreamContext, pool: &BufferPool, shared: &Shared) {
    pool.disarm();
    if let Err(e) = ctx.producer.flush_queue(ctx.stream, FlushMode::AllDiscard) {
        warn!(device = %ctx.device_id, error = %e, "Flush after failed start did not complete");
        shared.diagnostics.record(DiagnosticKind::NativeError, e.to_string());
    }
    pool.reclaim_after_stop();
}

/// Stop, flush, unregister and reclaim. Every step runs.
fn epilogue(ctx: &StreamContext, event: RawHandle, pool: &BufferPool, started: bool) -> TeardownReport {
    let mut report = TeardownReport::new();
    pool.disarm();
    if started {
        report.record("DSStopAcquisition", ctx.producer.stop_acquisition(ctx.stream));
    }
    report.record("DSFlushQueue", ctx.producer.flush_queue(ctx.stream, FlushMode::AllDiscard));
    report.record(
        "GCUnregisterEvent",
        ctx.registry.close(event, |_| {
            ctx.producer.unregister_new_buffer_event(ctx.stream, event)
        }),
    );
    pool.reclaim_after_stop();
    report
}
