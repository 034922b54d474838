//! Producer bindings.
//!
//! The engine never calls a transport module directly. It talks to a
//! [`Producer`], the fixed capability surface a GenTL module offers:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Producer (trait)                        │
//! │  system ─► interfaces ─► devices ─► data stream ─► buffers │
//! │                                     └─► new-buffer event   │
//! └────────────────────────────────────────────────────────────┘
//!            ▲                                  ▲
//!   CtiProducer (libloading, .cti)     SimProducer (in-process)
//! ```
//!
//! Implementations are plain call-throughs. Open/close bookkeeping,
//! ordering and state machines live above this layer, in the engine; a
//! producer only reports what the native call returned.
//!
//! - [`cti::CtiProducer`] resolves every entry point of a `.cti` module at
//!   load time and fails fast if one is missing.
//! - [`sim::SimProducer`] simulates a producer with configurable devices,
//!   payload layouts and fault injection.

pub mod cti;
pub mod sim;

pub use cti::CtiProducer;
pub use sim::{SimConfig, SimDevice, SimFaults, SimInterface, SimPayload, SimProducer};

use gentl_sys as sys;
use harvest_core::{
    BufferDescriptor, ChunkDescriptor, NativeCallError, PartDescriptor, RawHandle,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Result of a single producer call.
pub type NativeResult<T> = Result<T, NativeCallError>;

/// Identity of a producer module, read once at load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    /// File the module was loaded from; `None` for in-process producers.
    pub path: Option<PathBuf>,
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub tl_type: String,
    pub display_name: String,
    /// GenTL standard version implemented, `(major, minor)`.
    pub gentl_version: (u32, u32),
}

/// Requested device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    Control,
    #[default]
    Exclusive,
}

impl AccessMode {
    #[must_use]
    pub fn to_flags(self) -> sys::DEVICE_ACCESS_FLAGS {
        match self {
            AccessMode::ReadOnly => sys::DEVICE_ACCESS_READONLY,
            AccessMode::Control => sys::DEVICE_ACCESS_CONTROL,
            AccessMode::Exclusive => sys::DEVICE_ACCESS_EXCLUSIVE,
        }
    }
}

/// Device accessibility as reported by the interface module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    #[default]
    Unknown,
    ReadWrite,
    ReadOnly,
    NoAccess,
    Busy,
    OpenReadWrite,
    OpenReadOnly,
}

impl AccessStatus {
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            sys::DEVICE_ACCESS_STATUS_READWRITE => Self::ReadWrite,
            sys::DEVICE_ACCESS_STATUS_READONLY => Self::ReadOnly,
            sys::DEVICE_ACCESS_STATUS_NOACCESS => Self::NoAccess,
            sys::DEVICE_ACCESS_STATUS_BUSY => Self::Busy,
            sys::DEVICE_ACCESS_STATUS_OPEN_READWRITE => Self::OpenReadWrite,
            sys::DEVICE_ACCESS_STATUS_OPEN_READONLY => Self::OpenReadOnly,
            _ => Self::Unknown,
        }
    }

    /// Whether a new exclusive open could succeed.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Unknown | Self::ReadWrite)
    }
}

/// What an interface module reports about one device, without opening it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub tl_type: String,
    pub display_name: String,
    pub user_defined_name: String,
    pub serial_number: String,
    pub version: String,
    pub access_status: AccessStatus,
    pub timestamp_frequency: Option<u64>,
}

/// Data stream parameters the buffer pool needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperties {
    /// Bytes per payload, when the stream knows it.
    pub payload_size: Option<usize>,
    /// Whether `payload_size` comes from the stream rather than the device.
    pub defines_payload_size: bool,
    /// Minimum number of buffers to announce.
    pub announce_min: usize,
    /// Required buffer alignment in bytes.
    pub alignment: usize,
}

impl Default for StreamProperties {
    fn default() -> Self {
        Self {
            payload_size: None,
            defines_payload_size: false,
            announce_min: 1,
            alignment: 1,
        }
    }
}

/// `DSFlushQueue` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    InputToOutput,
    OutputDiscard,
    AllToInput,
    UnqueuedToInput,
    AllDiscard,
}

impl FlushMode {
    #[must_use]
    pub fn to_raw(self) -> sys::ACQ_QUEUE_TYPE {
        match self {
            FlushMode::InputToOutput => sys::ACQ_QUEUE_INPUT_TO_OUTPUT,
            FlushMode::OutputDiscard => sys::ACQ_QUEUE_OUTPUT_DISCARD,
            FlushMode::AllToInput => sys::ACQ_QUEUE_ALL_TO_INPUT,
            FlushMode::UnqueuedToInput => sys::ACQ_QUEUE_UNQUEUED_TO_INPUT,
            FlushMode::AllDiscard => sys::ACQ_QUEUE_ALL_DISCARD,
        }
    }
}

/// A completed buffer as reported by the new-buffer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBuffer {
    pub buffer: RawHandle,
    /// The private value passed to `announce_buffer`.
    pub user_index: usize,
}

/// The capability surface of one loaded transport module.
///
/// Every method maps onto one GenTL call (or a short fixed sequence of them,
/// such as update-list-then-enumerate). Handles are passed back exactly as
/// they were returned by the `open_*` calls.
///
/// All methods may be called from any thread. `wait_new_buffer` blocks and
/// runs concurrently with `queue_buffer` from consumer threads, which GenTL
/// permits.
pub trait Producer: Send + Sync {
    fn info(&self) -> &ProducerInfo;

    fn open_system(&self) -> NativeResult<RawHandle>;
    fn close_system(&self, system: RawHandle) -> NativeResult<()>;

    /// Refresh and list the interface ids of a system module.
    fn interface_ids(&self, system: RawHandle, timeout: Duration) -> NativeResult<Vec<String>>;
    fn open_interface(&self, system: RawHandle, id: &str) -> NativeResult<RawHandle>;
    fn close_interface(&self, interface: RawHandle) -> NativeResult<()>;

    /// Refresh and list the device ids visible on an interface.
    fn device_ids(&self, interface: RawHandle, timeout: Duration) -> NativeResult<Vec<String>>;
    fn device_descriptor(&self, interface: RawHandle, id: &str) -> NativeResult<DeviceDescriptor>;
    fn open_device(&self, interface: RawHandle, id: &str, access: AccessMode)
        -> NativeResult<RawHandle>;
    fn close_device(&self, device: RawHandle) -> NativeResult<()>;

    /// Open the device's first data stream.
    fn open_stream(&self, device: RawHandle) -> NativeResult<RawHandle>;
    fn close_stream(&self, stream: RawHandle) -> NativeResult<()>;
    fn stream_properties(&self, stream: RawHandle) -> NativeResult<StreamProperties>;

    /// Announce caller-owned memory to the stream.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay valid and must not be read or written by
    /// anyone else while the buffer is queued; the memory must outlive the
    /// matching `revoke_buffer`.
    unsafe fn announce_buffer(
        &self,
        stream: RawHandle,
        base: *mut u8,
        len: usize,
        user_index: usize,
    ) -> NativeResult<RawHandle>;
    fn revoke_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()>;
    fn queue_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()>;
    fn flush_queue(&self, stream: RawHandle, mode: FlushMode) -> NativeResult<()>;

    fn start_acquisition(&self, stream: RawHandle) -> NativeResult<()>;
    fn stop_acquisition(&self, stream: RawHandle) -> NativeResult<()>;

    fn register_new_buffer_event(&self, stream: RawHandle) -> NativeResult<RawHandle>;
    fn unregister_new_buffer_event(&self, stream: RawHandle, event: RawHandle) -> NativeResult<()>;
    /// Block until a buffer is filled. Times out with `GC_ERR_TIMEOUT`;
    /// some producers return `GC_ERR_ABORT` once the acquisition stops.
    fn wait_new_buffer(&self, event: RawHandle, timeout: Duration) -> NativeResult<NewBuffer>;

    fn buffer_info(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<BufferDescriptor>;
    /// Parts of a multi-part buffer; empty when the producer has none.
    fn buffer_parts(&self, stream: RawHandle, buffer: RawHandle)
        -> NativeResult<Vec<PartDescriptor>>;
    /// Chunks of a chunk-data buffer; empty when the producer has none.
    fn buffer_chunks(&self, stream: RawHandle, buffer: RawHandle)
        -> NativeResult<Vec<ChunkDescriptor>>;

    /// `GCCloseLib`. No handle may be open.
    fn close(&self) -> NativeResult<()>;
}

/// Convert a timeout to the millisecond value GenTL expects.
pub(crate) fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(sys::GENTL_INFINITE)
}
