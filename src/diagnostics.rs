//! Bounded per-acquirer event log.
//!
//! Everything the acquisition thread cannot return as an error (wait
//! timeouts, dropped payloads, teardown failures, a lost device, a panicking
//! callback) is logged through `tracing` and also kept here, so a consumer
//! can inspect what happened after the fact without a subscriber installed.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Events kept per acquirer; older ones are discarded.
pub const DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A native wait ended without a buffer.
    WaitTimeout,
    /// A native call failed but acquisition continued.
    NativeError,
    /// The queue was full and a payload was discarded.
    PayloadDropped,
    /// The producer reported a buffer the pool did not expect.
    ProtocolViolation,
    /// The device disappeared; acquisition stopped.
    DeviceLost,
    /// A close, revoke or unregister step failed.
    TeardownFailure,
    /// The acquisition loop panicked.
    WorkerPanic,
    /// A user callback panicked.
    CallbackPanic,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiagnosticKind::WaitTimeout => "wait timeout",
            DiagnosticKind::NativeError => "native error",
            DiagnosticKind::PayloadDropped => "payload dropped",
            DiagnosticKind::ProtocolViolation => "protocol violation",
            DiagnosticKind::DeviceLost => "device lost",
            DiagnosticKind::TeardownFailure => "teardown failure",
            DiagnosticKind::WorkerPanic => "worker panic",
            DiagnosticKind::CallbackPanic => "callback panic",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    pub at: SystemTime,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

impl Diagnostics {
    pub(crate) fn record(&self, kind: DiagnosticKind, message: impl Into<String>) {
        let mut events = self.events.lock();
        if events.len() == DIAGNOSTICS_CAPACITY {
            events.pop_front();
        }
        events.push_back(DiagnosticEvent {
            at: SystemTime::now(),
            kind,
            message: message.into(),
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub(crate) fn count(&self, kind: DiagnosticKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}
