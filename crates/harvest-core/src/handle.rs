//! Native handle tracking.
//!
//! Every GenTL module (system, interface, device, data stream, buffer, event)
//! is referenced through an opaque pointer-sized handle. The native layer
//! forbids closing a parent while children derived from it are still open, and
//! most producers crash rather than report a double close. The
//! [`HandleRegistry`] sits in front of every open and close call and turns
//! that class of mistake into a [`HarvestError::HandleMisuse`] value.
//!
//! # Ordering
//!
//! Each successful open is stamped with a monotonically increasing sequence
//! number. [`HandleRegistry::open_in_reverse_order`] lists the handles that
//! are still open, newest first, which is always a valid close order because
//! a child can only be opened after its parent.
//!
//! # Locking
//!
//! The registry uses one coarse `parking_lot::Mutex`. The native call itself
//! runs outside the lock: `open` checks the parent, releases the lock, calls
//! the producer, then records the result; `close` removes the entry first
//! (claiming the right to close it) and then calls the producer.

use crate::error::{HarvestError, HarvestResult, NativeCallError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;

/// Opaque handle returned by a producer.
///
/// Stored as an integer so that it is `Send + Sync`; it is only turned back
/// into a pointer at the FFI boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(usize);

impl RawHandle {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    #[must_use]
    pub fn value(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The GenTL module a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    System,
    Interface,
    Device,
    DataStream,
    Buffer,
    Event,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandleKind::System => "system",
            HandleKind::Interface => "interface",
            HandleKind::Device => "device",
            HandleKind::DataStream => "data_stream",
            HandleKind::Buffer => "buffer",
            HandleKind::Event => "event",
        };
        write!(f, "{}", label)
    }
}

/// What the registry knows about one open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord {
    pub handle: RawHandle,
    pub kind: HandleKind,
    pub parent: Option<RawHandle>,
    /// Open order; higher means opened later.
    pub seq: u64,
    /// Human-readable identity (interface id, device id, ...), for logs.
    pub label: String,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<RawHandle, HandleRecord>,
    next_seq: u64,
    opened_total: u64,
    closed_total: u64,
}

/// Ownership tracker for the handles opened under one producer module.
#[derive(Default)]
pub struct HandleRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `open` and record the handle it returns.
    ///
    /// Fails with `HandleMisuse` if `parent` is not currently open or if the
    /// producer hands back a handle value that is already tracked.
    pub fn open<F>(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
        label: impl Into<String>,
        open: F,
    ) -> HarvestResult<RawHandle>
    where
        F: FnOnce() -> Result<RawHandle, NativeCallError>,
    {
        let label = label.into();
        if let Some(parent) = parent {
            if !self.inner.lock().entries.contains_key(&parent) {
                tracing::error!(%kind, %parent, label, "Open under a parent that is not open");
                return Err(HarvestError::HandleMisuse(format!(
                    "cannot open {} '{}' under unknown parent {}",
                    kind, label, parent
                )));
            }
        }

        let handle = open()?;

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&handle) {
            tracing::error!(%kind, %handle, "Producer returned a handle that is already open");
            return Err(HarvestError::HandleMisuse(format!(
                "producer returned {} handle {} which is already open",
                kind, handle
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.opened_total += 1;
        tracing::debug!(%kind, %handle, label, seq, "Opened native handle");
        inner.entries.insert(
            handle,
            HandleRecord {
                handle,
                kind,
                parent,
                seq,
                label,
            },
        );
        Ok(handle)
    }

    /// Release `handle` and run `close` with its record.
    ///
    /// The entry is removed before the native call, so a failing `close`
    /// still leaves the handle released; the native error is returned.
    /// Closing an unknown handle, a handle closed before, or a handle that
    /// still has open children is a `HandleMisuse`.
    pub fn close<F>(&self, handle: RawHandle, close: F) -> HarvestResult<()>
    where
        F: FnOnce(&HandleRecord) -> Result<(), NativeCallError>,
    {
        let record = {
            let mut inner = self.inner.lock();
            let children = inner
                .entries
                .values()
                .filter(|r| r.parent == Some(handle))
                .count();
            if children > 0 {
                tracing::error!(%handle, children, "Close requested while children are open");
                return Err(HarvestError::HandleMisuse(format!(
                    "handle {} still has {} open children",
                    handle, children
                )));
            }
            match inner.entries.remove(&handle) {
                Some(record) => {
                    inner.closed_total += 1;
                    record
                }
                None => {
                    tracing::error!(%handle, "Close of a handle that is not open");
                    return Err(HarvestError::HandleMisuse(format!(
                        "handle {} is not open (closed twice or never opened)",
                        handle
                    )));
                }
            }
        };

        tracing::debug!(kind = %record.kind, %handle, label = record.label, "Closing native handle");
        close(&record).map_err(HarvestError::from)
    }

    #[must_use]
    pub fn is_open(&self, handle: RawHandle) -> bool {
        self.inner.lock().entries.contains_key(&handle)
    }

    #[must_use]
    pub fn record(&self, handle: RawHandle) -> Option<HandleRecord> {
        self.inner.lock().entries.get(&handle).cloned()
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn count_kind(&self, kind: HandleKind) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Open handles that descend from `root` (not including `root`).
    #[must_use]
    pub fn descendants_of(&self, root: RawHandle) -> Vec<HandleRecord> {
        let inner = self.inner.lock();
        let mut found: Vec<HandleRecord> = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for record in inner.entries.values() {
                if record.parent == Some(parent) {
                    frontier.push(record.handle);
                    found.push(record.clone());
                }
            }
        }
        found.sort_by(|a, b| b.seq.cmp(&a.seq));
        found
    }

    /// All open handles, most recently opened first.
    #[must_use]
    pub fn open_in_reverse_order(&self) -> Vec<HandleRecord> {
        let mut records: Vec<HandleRecord> = self.inner.lock().entries.values().cloned().collect();
        records.sort_by(|a, b| b.seq.cmp(&a.seq));
        records
    }

    /// `(opened, closed)` totals over the registry's lifetime.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.opened_total, inner.closed_total)
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HandleRegistry")
            .field("open", &inner.entries.len())
            .field("opened_total", &inner.opened_total)
            .field("closed_total", &inner.closed_total)
            .finish()
    }
}
