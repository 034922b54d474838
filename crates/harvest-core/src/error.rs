//! Error types for the acquisition engine.
//!
//! `HarvestError` is the single error type returned by every fallible public
//! operation. Its variants follow the lifecycle of an acquisition session:
//!
//! - **`ProducerLoad`**: a producer module is missing, is not a loadable
//!   library, or lacks a required GenTL entry point. Fatal to that
//!   `add_producer` call only.
//! - **`DeviceNotFound`** / **`AmbiguousSelector`**: a device selector did not
//!   resolve to exactly one device in the current snapshot. Recoverable; the
//!   caller may refresh the device list and retry.
//! - **`Native`**: any failed call into the transport layer, tagged with the
//!   GenTL operation that failed.
//! - **`DeviceLost`**: the producer reported an unrecoverable stream error
//!   while acquiring. The acquisition thread has already stopped.
//! - **`State`**: the operation is not valid in the object's current state.
//! - **`Timeout`**: a fetch did not complete within the caller's timeout.
//! - **`HandleMisuse`**: a native handle was closed twice, closed while it
//!   still had open children, or was never opened. This is a programming
//!   error surfaced as a value so tests can catch it.
//! - **`Configuration`**: configuration values failed validation.
//!
//! Teardown paths do not use early returns. They accumulate failures in a
//! [`TeardownReport`] so that `destroy()` and `reset()` always reach a fully
//! closed state.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

/// A failed call into a producer module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct NativeCallError {
    /// GenTL entry point (or logical operation) that failed.
    pub operation: &'static str,
    /// Raw `GC_ERROR` value.
    pub code: i32,
    /// Producer-supplied error text, if any.
    pub message: String,
}

impl NativeCallError {
    pub fn new(operation: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            operation,
            code,
            message: message.into(),
        }
    }

    /// The wait call expired without a new buffer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.code == gentl_sys::GC_ERR_TIMEOUT
    }

    /// The wait call was aborted by the producer.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        self.code == gentl_sys::GC_ERR_ABORT
    }

    /// Symbolic name of the error code.
    #[must_use]
    pub fn code_name(&self) -> &'static str {
        gentl_sys::error_name(self.code)
    }
}

impl fmt::Display for NativeCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with {} ({})",
            self.operation,
            self.code_name(),
            self.code
        )?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Primary error type for the acquisition engine.
#[derive(Error, Debug, Clone)]
pub enum HarvestError {
    /// The producer module could not be loaded or validated.
    #[error("Failed to load producer {}: {reason}", .path.display())]
    ProducerLoad { path: PathBuf, reason: String },

    /// No device in the current snapshot matches the selector.
    #[error("No device matches selector {selector}")]
    DeviceNotFound { selector: String },

    /// More than one device matches an identifier-style selector.
    #[error("Selector {selector} is ambiguous: {matches} devices match")]
    AmbiguousSelector { selector: String, matches: usize },

    /// A call into the transport layer failed.
    #[error(transparent)]
    Native(#[from] NativeCallError),

    /// The producer reported that the device is gone mid-stream.
    #[error("Device {device} lost: {reason}")]
    DeviceLost { device: String, reason: String },

    /// The operation is invalid for the current state.
    #[error("{operation} is not valid in state {state}")]
    State {
        operation: &'static str,
        state: String,
    },

    /// A fetch exceeded the caller's timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A native handle was used in violation of open/close nesting.
    #[error("Handle misuse: {0}")]
    HandleMisuse(String),

    /// Configuration values failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl HarvestError {
    pub fn state(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::State {
            operation,
            state: state.to_string(),
        }
    }

    pub fn producer_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ProducerLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost { .. })
    }
}

/// Failures collected while tearing something down.
///
/// Teardown keeps going after a failed close so that every handle gets a
/// chance to be released; the failures end up here instead of in an early
/// return.
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<HarvestError>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one teardown step, logging any failure.
    pub fn record<E: Into<HarvestError>>(&mut self, step: &str, result: Result<(), E>) {
        if let Err(e) = result {
            let e = e.into();
            tracing::warn!(step, error = %e, "Teardown step failed; continuing");
            self.failures.push(e);
        }
    }

    pub fn push(&mut self, error: HarvestError) {
        self.failures.push(error);
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn failures(&self) -> &[HarvestError] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<HarvestError> {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_display() {
        let e = NativeCallError::new("DSQueueBuffer", gentl_sys::GC_ERR_INVALID_HANDLE, "bad");
        let text = e.to_string();
        assert!(text.contains("DSQueueBuffer"));
        assert!(text.contains("GC_ERR_INVALID_HANDLE"));
        assert!(!e.is_timeout());
    }

    #[test]
    fn test_native_error_classification() {
        assert!(NativeCallError::new("EventGetData", gentl_sys::GC_ERR_TIMEOUT, "").is_timeout());
        assert!(NativeCallError::new("EventGetData", gentl_sys::GC_ERR_ABORT, "").is_abort());
    }

    #[test]
    fn test_teardown_report_collects() {
        let mut report = TeardownReport::new();
        report.record::<HarvestError>("ok", Ok(()));
        assert!(report.is_clean());

        report.record(
            "close",
            Err(NativeCallError::new("DevClose", gentl_sys::GC_ERR_IO, "gone")),
        );
        let mut other = TeardownReport::new();
        other.push(HarvestError::HandleMisuse("double close".into()));
        report.merge(other);

        assert_eq!(report.failures().len(), 2);
        assert!(matches!(report.failures()[0], HarvestError::Native(_)));
    }

    #[test]
    fn test_state_error_message() {
        let e = HarvestError::state("fetch", "Opened");
        assert_eq!(e.to_string(), "fetch is not valid in state Opened");
    }
}
