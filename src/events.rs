//! Acquirer event callbacks.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Something that happened on an acquirer's acquisition thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquirerEvent {
    AcquisitionStarted,
    /// A payload entered the delivery queue.
    NewBufferAvailable { frame_id: u64 },
    AcquisitionStopped,
    DeviceLost { reason: String },
}

/// Returned by `on_event`; pass to `remove_callback` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback-{}", self.0)
    }
}

pub type EventCallback = Arc<dyn Fn(&AcquirerEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventHub {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
}

impl EventHub {
    pub(crate) fn register(&self, callback: EventCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Run every callback; a panicking one is recorded and skipped.
    pub(crate) fn emit(&self, event: &AcquirerEvent, diagnostics: &Diagnostics) {
        // Snapshot so callbacks may register or remove callbacks themselves.
        let callbacks: Vec<(CallbackId, EventCallback)> = self.callbacks.lock().clone();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(%id, ?event, "Event callback panicked");
                diagnostics.record(
                    DiagnosticKind::CallbackPanic,
                    format!("{} panicked handling {:?}", id, event),
                );
            }
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_remove() {
        let hub = EventHub::default();
        let diagnostics = Diagnostics::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = hub.register(Arc::new(move |event| sink.lock().push(event.clone())));
        hub.emit(&AcquirerEvent::NewBufferAvailable { frame_id: 3 }, &diagnostics);
        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        hub.emit(&AcquirerEvent::AcquisitionStopped, &diagnostics);

        assert_eq!(*seen.lock(), vec![AcquirerEvent::NewBufferAvailable { frame_id: 3 }]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let hub = EventHub::default();
        let diagnostics = Diagnostics::default();
        let calls = Arc::new(AtomicU64::new(0));

        hub.register(Arc::new(|_| panic!("boom")));
        let counter = calls.clone();
        hub.register(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        hub.emit(&AcquirerEvent::AcquisitionStarted, &diagnostics);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(diagnostics.count(DiagnosticKind::CallbackPanic), 1);
    }
}
