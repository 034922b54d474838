//! In-process simulated producer.
//!
//! `SimProducer` behaves like a small GenTL module: a system module with
//! one or more interfaces, devices on those interfaces, one data stream per
//! device and a new-buffer event per stream. Frames are produced on demand:
//! a wait on the event fills the oldest queued buffer once the configured
//! frame interval has elapsed, writing a deterministic pattern through the
//! announced pointer exactly like a real producer writes through DMA.
//!
//! It is strict where real producers are strict (closing a parent with open
//! children, queueing a buffer twice, revoking a queued buffer, a second
//! exclusive open) so that ordering mistakes in the engine show up as
//! errors in tests. It also tracks its own open handles, which lets tests
//! assert that teardown leaves nothing behind.
//!
//! # Fault injection
//!
//! - [`SimFaults::device_lost_after_frames`]: the device disappears after N
//!   frames and every further wait fails with `GC_ERR_IO`.
//! - [`SimProducer::unplug`]: the same, triggered at runtime.
//! - [`SimFaults::failing_closes`]: close calls for the listed handle kinds
//!   release the handle but report `GC_ERR_IO`.
//! - [`SimFaults::queue_buffer_fails_after`]: `DSQueueBuffer` reports
//!   `GC_ERR_IO` once N calls succeeded.

use crate::{
    AccessMode, AccessStatus, DeviceDescriptor, FlushMode, NativeResult, NewBuffer, Producer,
    ProducerInfo, StreamProperties,
};
use gentl_sys as sys;
use harvest_core::{
    BufferDescriptor, ChunkDescriptor, HandleKind, NativeCallError, PartDescriptor, PayloadType,
    PixelFormat, RawHandle,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Chunk id used for the frame-counter chunk in [`SimPayload::ImageWithChunks`].
pub const SIM_CHUNK_FRAME_ID: u64 = 0x1000;
const CHUNK_LEN: usize = 8;

/// Each producer instance gets its own handle range so that handles from
/// different producers never collide in logs.
static NEXT_HANDLE_BASE: AtomicUsize = AtomicUsize::new(0x1000_0000);

/// Layout of the simulated payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimPayload {
    /// Single image.
    #[default]
    Image,
    /// Two parts: an intensity image followed by a confidence map.
    MultiPart,
    /// Image followed by one chunk carrying the frame id.
    ImageWithChunks,
}

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub user_defined_name: String,
    pub version: String,
}

impl SimDevice {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            serial_number: format!("SN-{}", id),
            id,
            vendor: "Harvest".to_string(),
            model: "SimCam".to_string(),
            user_defined_name: String::new(),
            version: "1.0".to_string(),
        }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    pub fn user_defined_name(mut self, name: impl Into<String>) -> Self {
        self.user_defined_name = name.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// One simulated interface and the devices reachable through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInterface {
    pub id: String,
    pub devices: Vec<SimDevice>,
}

/// Injected failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// The device is lost once this many frames were delivered on its stream.
    pub device_lost_after_frames: Option<u64>,
    /// Close calls for these kinds release the handle but fail.
    pub failing_closes: Vec<HandleKind>,
    /// `DSQueueBuffer` fails once this many calls succeeded.
    pub queue_buffer_fails_after: Option<u64>,
}

/// Configuration of a simulated producer.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub interfaces: Vec<SimInterface>,
    pub width: usize,
    pub height: usize,
    pub pixel_format: PixelFormat,
    pub payload: SimPayload,
    /// Minimum time between two frames on one stream.
    pub frame_interval: Duration,
    pub announce_min: usize,
    pub alignment: usize,
    pub faults: SimFaults,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            width: 64,
            height: 48,
            pixel_format: PixelFormat::MONO8,
            payload: SimPayload::Image,
            frame_interval: Duration::from_millis(5),
            announce_min: 1,
            alignment: 64,
            faults: SimFaults::default(),
        }
    }
}

impl SimConfig {
    /// One interface exposing exactly one device.
    pub fn single_device(id: impl Into<String>) -> Self {
        Self::with_devices(vec![SimDevice::new(id)])
    }

    /// One interface exposing the given devices.
    pub fn with_devices(devices: Vec<SimDevice>) -> Self {
        Self {
            interfaces: vec![SimInterface {
                id: "SimIF-0".to_string(),
                devices,
            }],
            ..Self::default()
        }
    }

    pub fn geometry(mut self, width: usize, height: usize, pixel_format: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.pixel_format = pixel_format;
        self
    }

    pub fn payload(mut self, payload: SimPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    fn image_bytes(&self) -> usize {
        (self.width * self.pixel_format.bits_per_pixel()).div_ceil(8) * self.height
    }

    /// Bytes of one complete payload.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match self.payload {
            SimPayload::Image => self.image_bytes(),
            SimPayload::MultiPart => self.image_bytes() + self.width * self.height,
            SimPayload::ImageWithChunks => self.image_bytes() + CHUNK_LEN,
        }
    }

    fn find_device(&self, interface: &str, id: &str) -> Option<&SimDevice> {
        self.interfaces
            .iter()
            .find(|i| i.id == interface)?
            .devices
            .iter()
            .find(|d| d.id == id)
    }
}

#[derive(Debug)]
enum SimHandle {
    System,
    Interface { id: String },
    Device { interface: String, id: String, access: AccessMode },
    Stream { device: usize },
    Buffer { stream: usize, base: usize, len: usize, user_index: usize },
    Event { stream: usize },
}

impl SimHandle {
    fn kind(&self) -> HandleKind {
        match self {
            SimHandle::System => HandleKind::System,
            SimHandle::Interface { .. } => HandleKind::Interface,
            SimHandle::Device { .. } => HandleKind::Device,
            SimHandle::Stream { .. } => HandleKind::DataStream,
            SimHandle::Buffer { .. } => HandleKind::Buffer,
            SimHandle::Event { .. } => HandleKind::Event,
        }
    }
}

/// What the simulated stream remembers about a filled buffer.
#[derive(Debug, Clone)]
struct Filled {
    frame_id: u64,
    size_filled: usize,
}

#[derive(Debug, Default)]
struct StreamState {
    acquiring: bool,
    input: VecDeque<usize>,
    filled: HashMap<usize, Filled>,
    next_frame_id: u64,
    delivered: u64,
    last_frame_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct SimState {
    handles: HashMap<usize, SimHandle>,
    streams: HashMap<usize, StreamState>,
    unplugged: HashSet<String>,
    next_handle: usize,
    closed: bool,
    queue_calls: u64,
}

impl SimState {
    fn allocate(&mut self, handle: SimHandle) -> RawHandle {
        let value = self.next_handle;
        self.next_handle += 0x10;
        self.handles.insert(value, handle);
        RawHandle::new(value)
    }

    fn get(&self, op: &'static str, handle: RawHandle, kind: HandleKind) -> NativeResult<&SimHandle> {
        match self.handles.get(&handle.value()) {
            Some(h) if h.kind() == kind => Ok(h),
            _ => Err(invalid_handle(op, handle)),
        }
    }

    fn has_children(&self, parent: usize) -> bool {
        self.handles.values().any(|h| match h {
            SimHandle::Stream { device } => *device == parent,
            SimHandle::Buffer { stream, .. } | SimHandle::Event { stream } => *stream == parent,
            SimHandle::Device { interface, .. } => self
                .handles
                .get(&parent)
                .is_some_and(|p| matches!(p, SimHandle::Interface { id } if id == interface)),
            SimHandle::Interface { .. } => {
                matches!(self.handles.get(&parent), Some(SimHandle::System))
            }
            SimHandle::System => false,
        })
    }

    fn device_of_stream(&self, stream: usize) -> Option<&str> {
        let SimHandle::Stream { device } = self.handles.get(&stream)? else {
            return None;
        };
        match self.handles.get(device)? {
            SimHandle::Device { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }
}

fn invalid_handle(op: &'static str, handle: RawHandle) -> NativeCallError {
    NativeCallError::new(op, sys::GC_ERR_INVALID_HANDLE, format!("unknown handle {}", handle))
}

/// A simulated GenTL producer.
pub struct SimProducer {
    config: SimConfig,
    info: ProducerInfo,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SimProducer {
    pub fn new(config: SimConfig) -> Self {
        let base = NEXT_HANDLE_BASE.fetch_add(0x0100_0000, Ordering::Relaxed);
        Self {
            config,
            info: ProducerInfo {
                path: None,
                id: "harvest.sim".to_string(),
                vendor: "Harvest".to_string(),
                model: "SimProducer".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                tl_type: "Custom".to_string(),
                display_name: "Harvest simulated producer".to_string(),
                gentl_version: (1, 6),
            },
            state: Mutex::new(SimState {
                next_handle: base,
                ..SimState::default()
            }),
            wake: Condvar::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of native handles currently open on this producer.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    #[must_use]
    pub fn open_handles_of(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .handles
            .values()
            .filter(|h| h.kind() == kind)
            .count()
    }

    /// Whether `GCCloseLib` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulate the device disappearing from the bus.
    pub fn unplug(&self, device_id: &str) {
        tracing::info!(device = device_id, "Simulating device removal");
        self.state.lock().unplugged.insert(device_id.to_string());
        self.wake.notify_all();
    }

    /// Bring an unplugged device back.
    pub fn replug(&self, device_id: &str) {
        self.state.lock().unplugged.remove(device_id);
    }

    fn lock_open(&self, op: &'static str) -> NativeResult<MutexGuard<'_, SimState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(NativeCallError::new(op, sys::GC_ERR_NOT_INITIALIZED, "library closed"));
        }
        Ok(state)
    }

    /// Shared close path: children check, release, then injected failure.
    fn close_handle(&self, op: &'static str, handle: RawHandle, kind: HandleKind) -> NativeResult<()> {
        let mut state = self.lock_open(op)?;
        state.get(op, handle, kind)?;
        if state.has_children(handle.value()) {
            return Err(NativeCallError::new(op, sys::GC_ERR_RESOURCE_IN_USE, "handle has open children"));
        }
        state.handles.remove(&handle.value());
        if kind == HandleKind::DataStream {
            state.streams.remove(&handle.value());
        }
        drop(state);
        self.wake.notify_all();

        if self.config.faults.failing_closes.contains(&kind) {
            return Err(NativeCallError::new(op, sys::GC_ERR_IO, "injected close failure"));
        }
        Ok(())
    }

    /// Write the frame pattern into `base..base+len`.
    fn fill(&self, base: usize, len: usize, frame_id: u64) -> usize {
        let size = self.config.payload_size().min(len);
        // SAFETY: `base..base+len` was announced and is queued to this
        // stream; the announcer guarantees exclusive access until it is
        // handed back through the new-buffer event.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base as *mut u8, len) };
        for (i, byte) in bytes[..size].iter_mut().enumerate() {
            *byte = (frame_id as usize).wrapping_add(i) as u8;
        }
        if self.config.payload == SimPayload::ImageWithChunks {
            let image = self.config.image_bytes();
            if image + CHUNK_LEN <= size {
                bytes[image..image + CHUNK_LEN].copy_from_slice(&frame_id.to_le_bytes());
            }
        }
        size
    }
}

impl Producer for SimProducer {
    fn info(&self) -> &ProducerInfo {
        &self.info
    }

    fn open_system(&self) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("TLOpen")?;
        Ok(state.allocate(SimHandle::System))
    }

    fn close_system(&self, system: RawHandle) -> NativeResult<()> {
        self.close_handle("TLClose", system, HandleKind::System)
    }

    fn interface_ids(&self, system: RawHandle, _timeout: Duration) -> NativeResult<Vec<String>> {
        let state = self.lock_open("TLUpdateInterfaceList")?;
        state.get("TLUpdateInterfaceList", system, HandleKind::System)?;
        Ok(self.config.interfaces.iter().map(|i| i.id.clone()).collect())
    }

    fn open_interface(&self, system: RawHandle, id: &str) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("TLOpenInterface")?;
        state.get("TLOpenInterface", system, HandleKind::System)?;
        if !self.config.interfaces.iter().any(|i| i.id == id) {
            return Err(NativeCallError::new("TLOpenInterface", sys::GC_ERR_INVALID_ID, id));
        }
        Ok(state.allocate(SimHandle::Interface { id: id.to_string() }))
    }

    fn close_interface(&self, interface: RawHandle) -> NativeResult<()> {
        self.close_handle("IFClose", interface, HandleKind::Interface)
    }

    fn device_ids(&self, interface: RawHandle, _timeout: Duration) -> NativeResult<Vec<String>> {
        let state = self.lock_open("IFUpdateDeviceList")?;
        let SimHandle::Interface { id } = state.get("IFUpdateDeviceList", interface, HandleKind::Interface)? else {
            return Err(invalid_handle("IFUpdateDeviceList", interface));
        };
        Ok(self
            .config
            .interfaces
            .iter()
            .filter(|i| &i.id == id)
            .flat_map(|i| i.devices.iter())
            .filter(|d| !state.unplugged.contains(&d.id))
            .map(|d| d.id.clone())
            .collect())
    }

    fn device_descriptor(&self, interface: RawHandle, id: &str) -> NativeResult<DeviceDescriptor> {
        let state = self.lock_open("IFGetDeviceInfo")?;
        let SimHandle::Interface { id: iface } = state.get("IFGetDeviceInfo", interface, HandleKind::Interface)? else {
            return Err(invalid_handle("IFGetDeviceInfo", interface));
        };
        let device = self
            .config
            .find_device(iface, id)
            .filter(|d| !state.unplugged.contains(&d.id))
            .ok_or_else(|| NativeCallError::new("IFGetDeviceInfo", sys::GC_ERR_INVALID_ID, id))?;
        let open_access = state.handles.values().find_map(|h| match h {
            SimHandle::Device { id, access, .. } if id == &device.id => Some(*access),
            _ => None,
        });
        let access_status = match open_access {
            Some(AccessMode::ReadOnly) => AccessStatus::OpenReadOnly,
            Some(_) => AccessStatus::OpenReadWrite,
            None => AccessStatus::ReadWrite,
        };
        Ok(DeviceDescriptor {
            id: device.id.clone(),
            vendor: device.vendor.clone(),
            model: device.model.clone(),
            tl_type: "Custom".to_string(),
            display_name: format!("{} {} ({})", device.vendor, device.model, device.id),
            user_defined_name: device.user_defined_name.clone(),
            serial_number: device.serial_number.clone(),
            version: device.version.clone(),
            access_status,
            timestamp_frequency: Some(1_000_000_000),
        })
    }

    fn open_device(&self, interface: RawHandle, id: &str, access: AccessMode) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("IFOpenDevice")?;
        let SimHandle::Interface { id: iface } = state.get("IFOpenDevice", interface, HandleKind::Interface)? else {
            return Err(invalid_handle("IFOpenDevice", interface));
        };
        let iface = iface.clone();
        if self.config.find_device(&iface, id).is_none() || state.unplugged.contains(id) {
            return Err(NativeCallError::new("IFOpenDevice", sys::GC_ERR_INVALID_ID, id));
        }
        let conflict = state.handles.values().any(|h| match h {
            SimHandle::Device { id: open_id, access: open_access, .. } if open_id == id => {
                access == AccessMode::Exclusive || *open_access == AccessMode::Exclusive
            }
            _ => false,
        });
        if conflict {
            return Err(NativeCallError::new(
                "IFOpenDevice",
                sys::GC_ERR_ACCESS_DENIED,
                format!("device {} is already open", id),
            ));
        }
        Ok(state.allocate(SimHandle::Device {
            interface: iface,
            id: id.to_string(),
            access,
        }))
    }

    fn close_device(&self, device: RawHandle) -> NativeResult<()> {
        self.close_handle("DevClose", device, HandleKind::Device)
    }

    fn open_stream(&self, device: RawHandle) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("DevOpenDataStream")?;
        state.get("DevOpenDataStream", device, HandleKind::Device)?;
        let already_open = state
            .handles
            .values()
            .any(|h| matches!(h, SimHandle::Stream { device: d } if *d == device.value()));
        if already_open {
            return Err(NativeCallError::new(
                "DevOpenDataStream",
                sys::GC_ERR_RESOURCE_IN_USE,
                "stream already open",
            ));
        }
        let stream = state.allocate(SimHandle::Stream {
            device: device.value(),
        });
        state.streams.insert(stream.value(), StreamState::default());
        Ok(stream)
    }

    fn close_stream(&self, stream: RawHandle) -> NativeResult<()> {
        {
            let state = self.lock_open("DSClose")?;
            if state.streams.get(&stream.value()).is_some_and(|s| s.acquiring) {
                return Err(NativeCallError::new("DSClose", sys::GC_ERR_RESOURCE_IN_USE, "acquisition running"));
            }
        }
        self.close_handle("DSClose", stream, HandleKind::DataStream)
    }

    fn stream_properties(&self, stream: RawHandle) -> NativeResult<StreamProperties> {
        let state = self.lock_open("DSGetInfo")?;
        state.get("DSGetInfo", stream, HandleKind::DataStream)?;
        Ok(StreamProperties {
            payload_size: Some(self.config.payload_size()),
            defines_payload_size: true,
            announce_min: self.config.announce_min,
            alignment: self.config.alignment,
        })
    }

    unsafe fn announce_buffer(
        &self,
        stream: RawHandle,
        base: *mut u8,
        len: usize,
        user_index: usize,
    ) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("DSAnnounceBuffer")?;
        state.get("DSAnnounceBuffer", stream, HandleKind::DataStream)?;
        if base.is_null() || len == 0 {
            return Err(NativeCallError::new("DSAnnounceBuffer", sys::GC_ERR_INVALID_PARAMETER, "empty buffer"));
        }
        Ok(state.allocate(SimHandle::Buffer {
            stream: stream.value(),
            base: base as usize,
            len,
            user_index,
        }))
    }

    fn revoke_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()> {
        {
            let state = self.lock_open("DSRevokeBuffer")?;
            let queued = state
                .streams
                .get(&stream.value())
                .is_some_and(|s| s.input.contains(&buffer.value()));
            if queued {
                return Err(NativeCallError::new("DSRevokeBuffer", sys::GC_ERR_BUSY, "buffer is queued"));
            }
        }
        self.close_handle("DSRevokeBuffer", buffer, HandleKind::Buffer)
    }

    fn queue_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()> {
        let mut state = self.lock_open("DSQueueBuffer")?;
        match state.get("DSQueueBuffer", buffer, HandleKind::Buffer)? {
            SimHandle::Buffer { stream: owner, .. } if *owner == stream.value() => {}
            _ => return Err(invalid_handle("DSQueueBuffer", buffer)),
        }
        if self
            .config
            .faults
            .queue_buffer_fails_after
            .is_some_and(|n| state.queue_calls >= n)
        {
            return Err(NativeCallError::new("DSQueueBuffer", sys::GC_ERR_IO, "injected queue failure"));
        }
        state.queue_calls += 1;
        let stream_state = state
            .streams
            .get_mut(&stream.value())
            .ok_or_else(|| invalid_handle("DSQueueBuffer", stream))?;
        if stream_state.input.contains(&buffer.value()) {
            return Err(NativeCallError::new("DSQueueBuffer", sys::GC_ERR_RESOURCE_IN_USE, "buffer already queued"));
        }
        stream_state.filled.remove(&buffer.value());
        stream_state.input.push_back(buffer.value());
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn flush_queue(&self, stream: RawHandle, mode: FlushMode) -> NativeResult<()> {
        let mut state = self.lock_open("DSFlushQueue")?;
        let stream_state = state
            .streams
            .get_mut(&stream.value())
            .ok_or_else(|| invalid_handle("DSFlushQueue", stream))?;
        match mode {
            FlushMode::AllDiscard | FlushMode::OutputDiscard => stream_state.input.clear(),
            // Filled buffers are handed out immediately, so the output queue
            // is always empty here.
            FlushMode::InputToOutput | FlushMode::AllToInput | FlushMode::UnqueuedToInput => {}
        }
        Ok(())
    }

    fn start_acquisition(&self, stream: RawHandle) -> NativeResult<()> {
        let mut state = self.lock_open("DSStartAcquisition")?;
        let device_gone = state
            .device_of_stream(stream.value())
            .is_some_and(|d| state.unplugged.contains(d));
        if device_gone {
            return Err(NativeCallError::new("DSStartAcquisition", sys::GC_ERR_IO, "device removed"));
        }
        let stream_state = state
            .streams
            .get_mut(&stream.value())
            .ok_or_else(|| invalid_handle("DSStartAcquisition", stream))?;
        if stream_state.acquiring {
            return Err(NativeCallError::new("DSStartAcquisition", sys::GC_ERR_RESOURCE_IN_USE, "already acquiring"));
        }
        stream_state.acquiring = true;
        stream_state.next_frame_id = 0;
        stream_state.last_frame_at = None;
        Ok(())
    }

    fn stop_acquisition(&self, stream: RawHandle) -> NativeResult<()> {
        let mut state = self.lock_open("DSStopAcquisition")?;
        let stream_state = state
            .streams
            .get_mut(&stream.value())
            .ok_or_else(|| invalid_handle("DSStopAcquisition", stream))?;
        stream_state.acquiring = false;
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn register_new_buffer_event(&self, stream: RawHandle) -> NativeResult<RawHandle> {
        let mut state = self.lock_open("GCRegisterEvent")?;
        state.get("GCRegisterEvent", stream, HandleKind::DataStream)?;
        let registered = state
            .handles
            .values()
            .any(|h| matches!(h, SimHandle::Event { stream: s } if *s == stream.value()));
        if registered {
            return Err(NativeCallError::new("GCRegisterEvent", sys::GC_ERR_RESOURCE_IN_USE, "event already registered"));
        }
        Ok(state.allocate(SimHandle::Event {
            stream: stream.value(),
        }))
    }

    fn unregister_new_buffer_event(&self, _stream: RawHandle, event: RawHandle) -> NativeResult<()> {
        self.close_handle("GCUnregisterEvent", event, HandleKind::Event)
    }

    fn wait_new_buffer(&self, event: RawHandle, timeout: Duration) -> NativeResult<NewBuffer> {
        const OP: &str = "EventGetData";
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_open(OP)?;
        loop {
            let stream = match state.handles.get(&event.value()) {
                Some(SimHandle::Event { stream }) => *stream,
                _ => return Err(invalid_handle(OP, event)),
            };
            let device = state.device_of_stream(stream).map(str::to_string);
            let lost_after = self.config.faults.device_lost_after_frames;

            let stream_state = state
                .streams
                .get_mut(&stream)
                .ok_or_else(|| invalid_handle(OP, event))?;
            if lost_after.is_some_and(|n| stream_state.delivered >= n) {
                if let Some(device) = &device {
                    state.unplugged.insert(device.clone());
                }
            }
            if device.as_ref().is_some_and(|d| state.unplugged.contains(d)) {
                return Err(NativeCallError::new(OP, sys::GC_ERR_IO, "device removed"));
            }

            let now = Instant::now();
            let stream_state = state
                .streams
                .get_mut(&stream)
                .ok_or_else(|| invalid_handle(OP, event))?;
            let next_due = stream_state
                .last_frame_at
                .map_or(now, |t| t + self.config.frame_interval);

            if stream_state.acquiring && !stream_state.input.is_empty() && now >= next_due {
                if let Some(buffer) = stream_state.input.pop_front() {
                    let frame_id = stream_state.next_frame_id;
                    stream_state.next_frame_id += 1;
                    stream_state.delivered += 1;
                    stream_state.last_frame_at = Some(now);
                    let Some(SimHandle::Buffer { base, len, user_index, .. }) = state.handles.get(&buffer) else {
                        return Err(invalid_handle(OP, RawHandle::new(buffer)));
                    };
                    let (base, len, user_index) = (*base, *len, *user_index);
                    let size_filled = self.fill(base, len, frame_id);
                    if let Some(s) = state.streams.get_mut(&stream) {
                        s.filled.insert(buffer, Filled { frame_id, size_filled });
                    }
                    return Ok(NewBuffer {
                        buffer: RawHandle::new(buffer),
                        user_index,
                    });
                }
            }

            if now >= deadline {
                return Err(NativeCallError::new(OP, sys::GC_ERR_TIMEOUT, "no buffer filled in time"));
            }
            let wake_at = if stream_state.acquiring && !stream_state.input.is_empty() {
                next_due.min(deadline)
            } else {
                deadline
            };
            self.wake.wait_until(&mut state, wake_at);
            if state.closed {
                return Err(NativeCallError::new(OP, sys::GC_ERR_NOT_INITIALIZED, "library closed"));
            }
        }
    }

    fn buffer_info(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<BufferDescriptor> {
        let state = self.lock_open("DSGetBufferInfo")?;
        state.get("DSGetBufferInfo", buffer, HandleKind::Buffer)?;
        let filled = state
            .streams
            .get(&stream.value())
            .and_then(|s| s.filled.get(&buffer.value()))
            .cloned()
            .ok_or_else(|| NativeCallError::new("DSGetBufferInfo", sys::GC_ERR_NO_DATA, "buffer not filled"))?;
        let interval_ns = u64::try_from(self.config.frame_interval.as_nanos()).unwrap_or(u64::MAX);
        let payload_type = match self.config.payload {
            SimPayload::Image => PayloadType::Image,
            SimPayload::MultiPart => PayloadType::MultiPart,
            SimPayload::ImageWithChunks => PayloadType::ChunkData,
        };
        Ok(BufferDescriptor {
            frame_id: filled.frame_id,
            timestamp: filled.frame_id.saturating_mul(interval_ns),
            timestamp_ns: Some(filled.frame_id.saturating_mul(interval_ns)),
            size_filled: filled.size_filled,
            payload_type: Some(payload_type),
            pixel_format: self.config.pixel_format,
            width: self.config.width,
            height: self.config.height,
            is_incomplete: filled.size_filled < self.config.payload_size(),
            contains_chunk_data: self.config.payload == SimPayload::ImageWithChunks,
            ..BufferDescriptor::default()
        })
    }

    fn buffer_parts(&self, _stream: RawHandle, buffer: RawHandle) -> NativeResult<Vec<PartDescriptor>> {
        let state = self.lock_open("DSGetNumBufferParts")?;
        state.get("DSGetNumBufferParts", buffer, HandleKind::Buffer)?;
        if self.config.payload != SimPayload::MultiPart {
            return Ok(Vec::new());
        }
        let image = self.config.image_bytes();
        Ok(vec![
            PartDescriptor {
                offset: 0,
                data_size: image,
                data_type: sys::PART_DATATYPE_2D_IMAGE,
                data_format: self.config.pixel_format,
                width: self.config.width,
                height: self.config.height,
                source_id: 0,
                ..PartDescriptor::default()
            },
            PartDescriptor {
                offset: image,
                data_size: self.config.width * self.config.height,
                data_type: sys::PART_DATATYPE_CONFIDENCE_MAP,
                data_format: PixelFormat::MONO8,
                width: self.config.width,
                height: self.config.height,
                source_id: 0,
                ..PartDescriptor::default()
            },
        ])
    }

    fn buffer_chunks(&self, _stream: RawHandle, buffer: RawHandle) -> NativeResult<Vec<ChunkDescriptor>> {
        let state = self.lock_open("DSGetBufferChunkData")?;
        state.get("DSGetBufferChunkData", buffer, HandleKind::Buffer)?;
        if self.config.payload != SimPayload::ImageWithChunks {
            return Ok(Vec::new());
        }
        Ok(vec![ChunkDescriptor {
            chunk_id: SIM_CHUNK_FRAME_ID,
            offset: self.config.image_bytes(),
            length: CHUNK_LEN,
        }])
    }

    fn close(&self) -> NativeResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if !state.handles.is_empty() {
            return Err(NativeCallError::new(
                "GCCloseLib",
                sys::GC_ERR_RESOURCE_IN_USE,
                format!("{} handles still open", state.handles.len()),
            ));
        }
        state.closed = true;
        drop(state);
        self.wake.notify_all();
        Ok(())
    }
}

impl std::fmt::Debug for SimProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimProducer")
            .field("interfaces", &self.config.interfaces.len())
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opened {
        system: RawHandle,
        iface: RawHandle,
        device: RawHandle,
        stream: RawHandle,
    }

    fn open_stream(sim: &SimProducer) -> Opened {
        let system = sim.open_system().unwrap();
        let ids = sim.interface_ids(system, Duration::ZERO).unwrap();
        let iface = sim.open_interface(system, &ids[0]).unwrap();
        let device_id = sim.device_ids(iface, Duration::ZERO).unwrap().remove(0);
        let device = sim.open_device(iface, &device_id, AccessMode::Exclusive).unwrap();
        let stream = sim.open_stream(device).unwrap();
        Opened { system, iface, device, stream }
    }

    #[test]
    fn test_enumeration_and_descriptor() {
        let sim = SimProducer::new(SimConfig::single_device("SIM-0"));
        let system = sim.open_system().unwrap();
        let iface = sim.open_interface(system, "SimIF-0").unwrap();
        assert_eq!(sim.device_ids(iface, Duration::ZERO).unwrap(), vec!["SIM-0"]);

        let descriptor = sim.device_descriptor(iface, "SIM-0").unwrap();
        assert_eq!(descriptor.serial_number, "SN-SIM-0");
        assert_eq!(descriptor.access_status, AccessStatus::ReadWrite);
        assert_eq!(sim.open_handle_count(), 2);
    }

    #[test]
    fn test_exclusive_open_conflicts() {
        let sim = SimProducer::new(SimConfig::single_device("SIM-0"));
        let opened = open_stream(&sim);
        let err = sim
            .open_device(opened.iface, "SIM-0", AccessMode::ReadOnly)
            .unwrap_err();
        assert_eq!(err.code, sys::GC_ERR_ACCESS_DENIED);
    }

    #[test]
    fn test_parent_close_with_children_is_refused() {
        let sim = SimProducer::new(SimConfig::single_device("SIM-0"));
        let opened = open_stream(&sim);
        let err = sim.close_device(opened.device).unwrap_err();
        assert_eq!(err.code, sys::GC_ERR_RESOURCE_IN_USE);

        sim.close_stream(opened.stream).unwrap();
        sim.close_device(opened.device).unwrap();
        sim.close_interface(opened.iface).unwrap();
        sim.close_system(opened.system).unwrap();
        assert_eq!(sim.open_handle_count(), 0);
        sim.close().unwrap();
        assert!(sim.is_closed());
    }

    #[test]
    fn test_fills_queued_buffers_in_order() {
        let sim = SimProducer::new(
            SimConfig::single_device("SIM-0").frame_interval(Duration::from_millis(1)),
        );
        let opened = open_stream(&sim);
        let size = sim.config().payload_size();
        let mut memory = vec![vec![0u8; size]; 2];
        let mut buffers = Vec::new();
        for (i, block) in memory.iter_mut().enumerate() {
            // SAFETY: `memory` outlives every use of the buffer in this test.
            let handle = unsafe { sim.announce_buffer(opened.stream, block.as_mut_ptr(), size, i) }.unwrap();
            sim.queue_buffer(opened.stream, handle).unwrap();
            buffers.push(handle);
        }
        let event = sim.register_new_buffer_event(opened.stream).unwrap();
        sim.start_acquisition(opened.stream).unwrap();

        let first = sim.wait_new_buffer(event, Duration::from_secs(1)).unwrap();
        let second = sim.wait_new_buffer(event, Duration::from_secs(1)).unwrap();
        assert_eq!((first.user_index, second.user_index), (0, 1));
        assert_eq!(sim.buffer_info(opened.stream, second.buffer).unwrap().frame_id, 1);

        // Nothing queued any more.
        let err = sim.wait_new_buffer(event, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());

        sim.stop_acquisition(opened.stream).unwrap();
        drop(memory);
    }

    #[test]
    fn test_unplug_fails_pending_wait() {
        let sim = SimProducer::new(SimConfig::single_device("SIM-0"));
        let opened = open_stream(&sim);
        let event = sim.register_new_buffer_event(opened.stream).unwrap();

        sim.unplug("SIM-0");
        let err = sim.wait_new_buffer(event, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code, sys::GC_ERR_IO);
        assert!(sim.device_ids(opened.iface, Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_queue_buffer_fault_after_n_calls() {
        let faults = SimFaults {
            queue_buffer_fails_after: Some(1),
            ..SimFaults::default()
        };
        let sim = SimProducer::new(SimConfig::single_device("SIM-0").faults(faults));
        let opened = open_stream(&sim);
        let size = sim.config().payload_size();
        let mut memory = vec![vec![0u8; size]; 2];
        let mut buffers = Vec::new();
        for (i, block) in memory.iter_mut().enumerate() {
            // SAFETY: `memory` outlives every use of the buffer in this test.
            buffers.push(unsafe { sim.announce_buffer(opened.stream, block.as_mut_ptr(), size, i) }.unwrap());
        }
        sim.queue_buffer(opened.stream, buffers[0]).unwrap();
        let err = sim.queue_buffer(opened.stream, buffers[1]).unwrap_err();
        assert_eq!(err.code, sys::GC_ERR_IO);

        // The first buffer is queued and cannot be revoked until flushed.
        assert!(sim.revoke_buffer(opened.stream, buffers[0]).is_err());
        sim.flush_queue(opened.stream, FlushMode::AllDiscard).unwrap();
        for buffer in buffers {
            sim.revoke_buffer(opened.stream, buffer).unwrap();
        }
        drop(memory);
    }

    #[test]
    fn test_failing_close_still_releases() {
        let faults = SimFaults {
            failing_closes: vec![HandleKind::Interface],
            ..SimFaults::default()
        };
        let sim = SimProducer::new(SimConfig::single_device("SIM-0").faults(faults));
        let system = sim.open_system().unwrap();
        let iface = sim.open_interface(system, "SimIF-0").unwrap();
        assert!(sim.close_interface(iface).is_err());
        assert_eq!(sim.open_handles_of(HandleKind::Interface), 0);
    }

    #[test]
    fn test_close_library_refuses_open_handles() {
        let sim = SimProducer::new(SimConfig::single_device("SIM-0"));
        let _system = sim.open_system().unwrap();
        assert!(sim.close().is_err());
        assert!(!sim.is_closed());
    }
}
