//! `.cti` producer modules loaded with `libloading`.
//!
//! Every required entry point is resolved in [`CtiProducer::load`]; a module
//! missing any of them is rejected before `GCInitLib` is called. The
//! multi-part and chunk entry points are optional (older GenTL versions do
//! not export them) and degrade to "no parts" / "no chunks".
//!
//! Strings are read with the usual GenTL two-call pattern: one call with a
//! null buffer to learn the size, one call to fill it.

use crate::{
    timeout_ms, AccessMode, AccessStatus, DeviceDescriptor, FlushMode, NativeResult, NewBuffer,
    Producer, ProducerInfo, StreamProperties,
};
use gentl_sys as sys;
use harvest_core::{
    BufferDescriptor, ChunkDescriptor, HarvestError, HarvestResult, NativeCallError,
    PartDescriptor, PayloadType, PixelFormat, RawHandle,
};
use libloading::Library;
use std::ffi::{c_char, c_void, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Resolved entry points of one module.
struct Api {
    gc_init_lib: sys::PGCInitLib,
    gc_close_lib: sys::PGCCloseLib,
    gc_get_info: sys::PGCGetInfo,
    gc_get_last_error: sys::PGCGetLastError,
    gc_register_event: sys::PGCRegisterEvent,
    gc_unregister_event: sys::PGCUnregisterEvent,
    event_get_data: sys::PEventGetData,
    tl_open: sys::PTLOpen,
    tl_close: sys::PTLClose,
    tl_update_interface_list: sys::PTLUpdateInterfaceList,
    tl_get_num_interfaces: sys::PTLGetNumInterfaces,
    tl_get_interface_id: sys::PTLGetInterfaceID,
    tl_open_interface: sys::PTLOpenInterface,
    if_close: sys::PIFClose,
    if_update_device_list: sys::PIFUpdateDeviceList,
    if_get_num_devices: sys::PIFGetNumDevices,
    if_get_device_id: sys::PIFGetDeviceID,
    if_get_device_info: sys::PIFGetDeviceInfo,
    if_open_device: sys::PIFOpenDevice,
    dev_close: sys::PDevClose,
    dev_get_num_data_streams: sys::PDevGetNumDataStreams,
    dev_get_data_stream_id: sys::PDevGetDataStreamID,
    dev_open_data_stream: sys::PDevOpenDataStream,
    ds_close: sys::PDSClose,
    ds_get_info: sys::PDSGetInfo,
    ds_announce_buffer: sys::PDSAnnounceBuffer,
    ds_revoke_buffer: sys::PDSRevokeBuffer,
    ds_queue_buffer: sys::PDSQueueBuffer,
    ds_flush_queue: sys::PDSFlushQueue,
    ds_start_acquisition: sys::PDSStartAcquisition,
    ds_stop_acquisition: sys::PDSStopAcquisition,
    ds_get_buffer_info: sys::PDSGetBufferInfo,
    ds_get_num_buffer_parts: Option<sys::PDSGetNumBufferParts>,
    ds_get_buffer_part_info: Option<sys::PDSGetBufferPartInfo>,
    ds_get_buffer_chunk_data: Option<sys::PDSGetBufferChunkData>,
}

/// Resolves symbols, remembering every missing required name.
struct Resolver<'lib> {
    library: &'lib Library,
    missing: Vec<&'static str>,
}

impl<'lib> Resolver<'lib> {
    fn optional<T: Copy>(&self, name: &'static str) -> Option<T> {
        // SAFETY: the caller names the GenTL entry point whose signature is `T`.
        unsafe { self.library.get::<T>(name.as_bytes()).ok().map(|symbol| *symbol) }
    }

    fn required<T: Copy>(&mut self, name: &'static str) -> Option<T> {
        let found = self.optional(name);
        if found.is_none() {
            self.missing.push(name);
        }
        found
    }
}

macro_rules! resolve_api {
    ($resolver:expr, { $($field:ident => $name:literal),* $(,)? }, optional { $($opt:ident => $opt_name:literal),* $(,)? }) => {{
        $(let $field = $resolver.required($name);)*
        let build = || {
            Some(Api {
                $($field: $field?,)*
                $($opt: $resolver.optional($opt_name),)*
            })
        };
        build()
    }};
}

/// A loaded `.cti` module.
pub struct CtiProducer {
    api: Api,
    info: ProducerInfo,
    closed: AtomicBool,
    // Dropped last so the resolved function pointers never outlive the module.
    _library: Library,
}

impl CtiProducer {
    /// Load, validate and initialise a producer module.
    pub fn load(path: impl AsRef<Path>) -> HarvestResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HarvestError::producer_load(path, "file not found"));
        }

        // SAFETY: loading a shared library runs its initialisers. Producer
        // modules are trusted code chosen by the application.
        let library = unsafe { Library::new(path) }
            .map_err(|e| HarvestError::producer_load(path, format!("not a loadable module: {}", e)))?;

        let mut resolver = Resolver {
            library: &library,
            missing: Vec::new(),
        };
        let api = resolve_api!(resolver, {
            gc_init_lib => "GCInitLib",
            gc_close_lib => "GCCloseLib",
            gc_get_info => "GCGetInfo",
            gc_get_last_error => "GCGetLastError",
            gc_register_event => "GCRegisterEvent",
            gc_unregister_event => "GCUnregisterEvent",
            event_get_data => "EventGetData",
            tl_open => "TLOpen",
            tl_close => "TLClose",
            tl_update_interface_list => "TLUpdateInterfaceList",
            tl_get_num_interfaces => "TLGetNumInterfaces",
            tl_get_interface_id => "TLGetInterfaceID",
            tl_open_interface => "TLOpenInterface",
            if_close => "IFClose",
            if_update_device_list => "IFUpdateDeviceList",
            if_get_num_devices => "IFGetNumDevices",
            if_get_device_id => "IFGetDeviceID",
            if_get_device_info => "IFGetDeviceInfo",
            if_open_device => "IFOpenDevice",
            dev_close => "DevClose",
            dev_get_num_data_streams => "DevGetNumDataStreams",
            dev_get_data_stream_id => "DevGetDataStreamID",
            dev_open_data_stream => "DevOpenDataStream",
            ds_close => "DSClose",
            ds_get_info => "DSGetInfo",
            ds_announce_buffer => "DSAnnounceBuffer",
            ds_revoke_buffer => "DSRevokeBuffer",
            ds_queue_buffer => "DSQueueBuffer",
            ds_flush_queue => "DSFlushQueue",
            ds_start_acquisition => "DSStartAcquisition",
            ds_stop_acquisition => "DSStopAcquisition",
            ds_get_buffer_info => "DSGetBufferInfo",
        }, optional {
            ds_get_num_buffer_parts => "DSGetNumBufferParts",
            ds_get_buffer_part_info => "DSGetBufferPartInfo",
            ds_get_buffer_chunk_data => "DSGetBufferChunkData",
        });
        let Some(api) = api else {
            return Err(HarvestError::producer_load(
                path,
                format!("missing entry points: {}", resolver.missing.join(", ")),
            ));
        };

        // SAFETY: resolved above with the GCInitLib signature.
        let code = unsafe { (api.gc_init_lib)() };
        if code != sys::GC_ERR_SUCCESS {
            return Err(HarvestError::producer_load(
                path,
                format!("GCInitLib failed with {}", sys::error_name(code)),
            ));
        }

        let mut producer = Self {
            api,
            info: ProducerInfo::default(),
            closed: AtomicBool::new(false),
            _library: library,
        };
        producer.info = producer.read_info(path.to_path_buf());
        tracing::info!(
            path = %path.display(),
            vendor = %producer.info.vendor,
            model = %producer.info.model,
            tl_type = %producer.info.tl_type,
            "Loaded GenTL producer"
        );
        Ok(producer)
    }

    fn read_info(&self, path: PathBuf) -> ProducerInfo {
        let text = |cmd: sys::TL_INFO_CMD| {
            read_info_string("GCGetInfo", |kind, buf, size| {
                // SAFETY: out pointers are valid for the duration of the call.
                unsafe { (self.api.gc_get_info)(cmd, kind, buf, size) }
            })
            .unwrap_or_default()
        };
        let number = |cmd: sys::TL_INFO_CMD| {
            read_info_unsigned("GCGetInfo", |kind, buf, size| {
                // SAFETY: as above.
                unsafe { (self.api.gc_get_info)(cmd, kind, buf, size) }
            })
            .ok()
            .flatten()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
        };
        ProducerInfo {
            path: Some(path),
            id: text(sys::TL_INFO_ID),
            vendor: text(sys::TL_INFO_VENDOR),
            model: text(sys::TL_INFO_MODEL),
            version: text(sys::TL_INFO_VERSION),
            tl_type: text(sys::TL_INFO_TLTYPE),
            display_name: text(sys::TL_INFO_DISPLAYNAME),
            gentl_version: (
                number(sys::TL_INFO_GENTL_VER_MAJOR),
                number(sys::TL_INFO_GENTL_VER_MINOR),
            ),
        }
    }

    /// Turn a `GC_ERROR` into a result, fetching the producer's error text.
    fn check(&self, operation: &'static str, code: sys::GC_ERROR) -> NativeResult<()> {
        if code == sys::GC_ERR_SUCCESS {
            return Ok(());
        }
        Err(NativeCallError::new(operation, code, self.last_error_text()))
    }

    fn last_error_text(&self) -> String {
        let mut code: sys::GC_ERROR = 0;
        let mut size: usize = 0;
        // SAFETY: null text buffer asks for the required size.
        let status = unsafe { (self.api.gc_get_last_error)(&mut code, ptr::null_mut(), &mut size) };
        if status != sys::GC_ERR_SUCCESS || size == 0 {
            return String::new();
        }
        let mut text = vec![0 as c_char; size];
        // SAFETY: `text` holds `size` bytes as announced by the first call.
        let status = unsafe { (self.api.gc_get_last_error)(&mut code, text.as_mut_ptr(), &mut size) };
        if status != sys::GC_ERR_SUCCESS {
            return String::new();
        }
        c_chars_to_string(&text)
    }

    fn c_id(operation: &'static str, id: &str) -> NativeResult<CString> {
        CString::new(id).map_err(|_| {
            NativeCallError::new(operation, sys::GC_ERR_INVALID_PARAMETER, "identifier contains NUL")
        })
    }

    fn device_text(&self, iface: RawHandle, id: &CString, cmd: sys::DEVICE_INFO_CMD) -> String {
        read_info_string("IFGetDeviceInfo", |kind, buf, size| {
            // SAFETY: `id` is NUL-terminated; out pointers are valid.
            unsafe { (self.api.if_get_device_info)(iface.as_ptr(), id.as_ptr(), cmd, kind, buf, size) }
        })
        .unwrap_or_default()
    }

    fn device_number(&self, iface: RawHandle, id: &CString, cmd: sys::DEVICE_INFO_CMD) -> Option<u64> {
        read_info_unsigned("IFGetDeviceInfo", |kind, buf, size| {
            // SAFETY: as above.
            unsafe { (self.api.if_get_device_info)(iface.as_ptr(), id.as_ptr(), cmd, kind, buf, size) }
        })
        .ok()
        .flatten()
    }

    fn stream_number(&self, stream: RawHandle, cmd: sys::STREAM_INFO_CMD) -> NativeResult<Option<u64>> {
        read_info_unsigned("DSGetInfo", |kind, buf, size| {
            // SAFETY: out pointers are valid for the duration of the call.
            unsafe { (self.api.ds_get_info)(stream.as_ptr(), cmd, kind, buf, size) }
        })
    }

    fn buffer_number(
        &self,
        stream: RawHandle,
        buffer: RawHandle,
        cmd: sys::BUFFER_INFO_CMD,
    ) -> NativeResult<Option<u64>> {
        read_info_unsigned("DSGetBufferInfo", |kind, buf, size| {
            // SAFETY: out pointers are valid for the duration of the call.
            unsafe { (self.api.ds_get_buffer_info)(stream.as_ptr(), buffer.as_ptr(), cmd, kind, buf, size) }
        })
    }

    fn part_number(
        &self,
        part_info: sys::PDSGetBufferPartInfo,
        stream: RawHandle,
        buffer: RawHandle,
        index: u32,
        cmd: sys::BUFFER_PART_INFO_CMD,
    ) -> NativeResult<Option<u64>> {
        read_info_unsigned("DSGetBufferPartInfo", |kind, buf, size| {
            // SAFETY: out pointers are valid for the duration of the call.
            unsafe { part_info(stream.as_ptr(), buffer.as_ptr(), index, cmd, kind, buf, size) }
        })
    }
}

impl Producer for CtiProducer {
    fn info(&self) -> &ProducerInfo {
        &self.info
    }

    fn open_system(&self) -> NativeResult<RawHandle> {
        let mut handle: sys::TL_HANDLE = ptr::null_mut();
        // SAFETY: `handle` is a valid out pointer.
        self.check("TLOpen", unsafe { (self.api.tl_open)(&mut handle) })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn close_system(&self, system: RawHandle) -> NativeResult<()> {
        // SAFETY: `system` came from TLOpen.
        self.check("TLClose", unsafe { (self.api.tl_close)(system.as_ptr()) })
    }

    fn interface_ids(&self, system: RawHandle, timeout: Duration) -> NativeResult<Vec<String>> {
        let mut changed: sys::bool8_t = 0;
        // SAFETY: valid system handle and out pointer.
        self.check("TLUpdateInterfaceList", unsafe {
            (self.api.tl_update_interface_list)(system.as_ptr(), &mut changed, timeout_ms(timeout))
        })?;
        let mut count: u32 = 0;
        // SAFETY: as above.
        self.check("TLGetNumInterfaces", unsafe {
            (self.api.tl_get_num_interfaces)(system.as_ptr(), &mut count)
        })?;
        (0..count)
            .map(|index| {
                read_string("TLGetInterfaceID", |buf, size| {
                    // SAFETY: `index` < count; buffer sized by the first call.
                    unsafe { (self.api.tl_get_interface_id)(system.as_ptr(), index, buf, size) }
                })
                .map_err(|code| NativeCallError::new("TLGetInterfaceID", code, self.last_error_text()))
            })
            .collect()
    }

    fn open_interface(&self, system: RawHandle, id: &str) -> NativeResult<RawHandle> {
        let c_id = Self::c_id("TLOpenInterface", id)?;
        let mut handle: sys::IF_HANDLE = ptr::null_mut();
        // SAFETY: NUL-terminated id, valid out pointer.
        self.check("TLOpenInterface", unsafe {
            (self.api.tl_open_interface)(system.as_ptr(), c_id.as_ptr(), &mut handle)
        })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn close_interface(&self, interface: RawHandle) -> NativeResult<()> {
        // SAFETY: handle came from TLOpenInterface.
        self.check("IFClose", unsafe { (self.api.if_close)(interface.as_ptr()) })
    }

    fn device_ids(&self, interface: RawHandle, timeout: Duration) -> NativeResult<Vec<String>> {
        let mut changed: sys::bool8_t = 0;
        // SAFETY: valid interface handle and out pointer.
        self.check("IFUpdateDeviceList", unsafe {
            (self.api.if_update_device_list)(interface.as_ptr(), &mut changed, timeout_ms(timeout))
        })?;
        let mut count: u32 = 0;
        // SAFETY: as above.
        self.check("IFGetNumDevices", unsafe {
            (self.api.if_get_num_devices)(interface.as_ptr(), &mut count)
        })?;
        (0..count)
            .map(|index| {
                read_string("IFGetDeviceID", |buf, size| {
                    // SAFETY: `index` < count; buffer sized by the first call.
                    unsafe { (self.api.if_get_device_id)(interface.as_ptr(), index, buf, size) }
                })
                .map_err(|code| NativeCallError::new("IFGetDeviceID", code, self.last_error_text()))
            })
            .collect()
    }

    fn device_descriptor(&self, interface: RawHandle, id: &str) -> NativeResult<DeviceDescriptor> {
        let c_id = Self::c_id("IFGetDeviceInfo", id)?;
        let access_status = self
            .device_number(interface, &c_id, sys::DEVICE_INFO_ACCESS_STATUS)
            .and_then(|v| i32::try_from(v).ok())
            .map(AccessStatus::from_raw)
            .unwrap_or_default();
        Ok(DeviceDescriptor {
            id: id.to_string(),
            vendor: self.device_text(interface, &c_id, sys::DEVICE_INFO_VENDOR),
            model: self.device_text(interface, &c_id, sys::DEVICE_INFO_MODEL),
            tl_type: self.device_text(interface, &c_id, sys::DEVICE_INFO_TLTYPE),
            display_name: self.device_text(interface, &c_id, sys::DEVICE_INFO_DISPLAYNAME),
            user_defined_name: self.device_text(interface, &c_id, sys::DEVICE_INFO_USER_DEFINED_NAME),
            serial_number: self.device_text(interface, &c_id, sys::DEVICE_INFO_SERIAL_NUMBER),
            version: self.device_text(interface, &c_id, sys::DEVICE_INFO_VERSION),
            access_status,
            timestamp_frequency: self.device_number(interface, &c_id, sys::DEVICE_INFO_TIMESTAMP_FREQUENCY),
        })
    }

    fn open_device(&self, interface: RawHandle, id: &str, access: AccessMode) -> NativeResult<RawHandle> {
        let c_id = Self::c_id("IFOpenDevice", id)?;
        let mut handle: sys::DEV_HANDLE = ptr::null_mut();
        // SAFETY: NUL-terminated id, valid out pointer.
        self.check("IFOpenDevice", unsafe {
            (self.api.if_open_device)(interface.as_ptr(), c_id.as_ptr(), access.to_flags(), &mut handle)
        })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn close_device(&self, device: RawHandle) -> NativeResult<()> {
        // SAFETY: handle came from IFOpenDevice.
        self.check("DevClose", unsafe { (self.api.dev_close)(device.as_ptr()) })
    }

    fn open_stream(&self, device: RawHandle) -> NativeResult<RawHandle> {
        let mut count: u32 = 0;
        // SAFETY: valid device handle and out pointer.
        self.check("DevGetNumDataStreams", unsafe {
            (self.api.dev_get_num_data_streams)(device.as_ptr(), &mut count)
        })?;
        if count == 0 {
            return Err(NativeCallError::new(
                "DevGetNumDataStreams",
                sys::GC_ERR_NOT_AVAILABLE,
                "device exposes no data stream",
            ));
        }
        let stream_id = read_string("DevGetDataStreamID", |buf, size| {
            // SAFETY: index 0 < count; buffer sized by the first call.
            unsafe { (self.api.dev_get_data_stream_id)(device.as_ptr(), 0, buf, size) }
        })
        .map_err(|code| NativeCallError::new("DevGetDataStreamID", code, self.last_error_text()))?;
        let c_id = Self::c_id("DevOpenDataStream", &stream_id)?;
        let mut handle: sys::DS_HANDLE = ptr::null_mut();
        // SAFETY: NUL-terminated id, valid out pointer.
        self.check("DevOpenDataStream", unsafe {
            (self.api.dev_open_data_stream)(device.as_ptr(), c_id.as_ptr(), &mut handle)
        })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn close_stream(&self, stream: RawHandle) -> NativeResult<()> {
        // SAFETY: handle came from DevOpenDataStream.
        self.check("DSClose", unsafe { (self.api.ds_close)(stream.as_ptr()) })
    }

    fn stream_properties(&self, stream: RawHandle) -> NativeResult<StreamProperties> {
        let as_usize = |v: Option<u64>| v.and_then(|v| usize::try_from(v).ok());
        let defines_payload_size = self
            .stream_number(stream, sys::STREAM_INFO_DEFINES_PAYLOADSIZE)?
            .is_some_and(|v| v != 0);
        Ok(StreamProperties {
            payload_size: as_usize(self.stream_number(stream, sys::STREAM_INFO_PAYLOAD_SIZE)?)
                .filter(|size| *size > 0),
            defines_payload_size,
            announce_min: as_usize(self.stream_number(stream, sys::STREAM_INFO_BUF_ANNOUNCE_MIN)?)
                .unwrap_or(1)
                .max(1),
            alignment: as_usize(self.stream_number(stream, sys::STREAM_INFO_BUF_ALIGNMENT)?)
                .unwrap_or(1)
                .max(1),
        })
    }

    unsafe fn announce_buffer(
        &self,
        stream: RawHandle,
        base: *mut u8,
        len: usize,
        user_index: usize,
    ) -> NativeResult<RawHandle> {
        let mut handle: sys::BUFFER_HANDLE = ptr::null_mut();
        // SAFETY: the caller keeps `base..base+len` alive until revoke. The
        // private pointer carries the pool index and is never dereferenced.
        self.check("DSAnnounceBuffer", unsafe {
            (self.api.ds_announce_buffer)(
                stream.as_ptr(),
                base.cast::<c_void>(),
                len,
                user_index as *mut c_void,
                &mut handle,
            )
        })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn revoke_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()> {
        // SAFETY: both out pointers are optional in the GenTL contract.
        self.check("DSRevokeBuffer", unsafe {
            (self.api.ds_revoke_buffer)(stream.as_ptr(), buffer.as_ptr(), ptr::null_mut(), ptr::null_mut())
        })
    }

    fn queue_buffer(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<()> {
        // SAFETY: handles came from DevOpenDataStream / DSAnnounceBuffer.
        self.check("DSQueueBuffer", unsafe {
            (self.api.ds_queue_buffer)(stream.as_ptr(), buffer.as_ptr())
        })
    }

    fn flush_queue(&self, stream: RawHandle, mode: FlushMode) -> NativeResult<()> {
        // SAFETY: valid stream handle.
        self.check("DSFlushQueue", unsafe {
            (self.api.ds_flush_queue)(stream.as_ptr(), mode.to_raw())
        })
    }

    fn start_acquisition(&self, stream: RawHandle) -> NativeResult<()> {
        // SAFETY: valid stream handle; GENTL_INFINITE means "until stopped".
        self.check("DSStartAcquisition", unsafe {
            (self.api.ds_start_acquisition)(stream.as_ptr(), sys::ACQ_START_FLAGS_DEFAULT, sys::GENTL_INFINITE)
        })
    }

    fn stop_acquisition(&self, stream: RawHandle) -> NativeResult<()> {
        // SAFETY: valid stream handle.
        self.check("DSStopAcquisition", unsafe {
            (self.api.ds_stop_acquisition)(stream.as_ptr(), sys::ACQ_STOP_FLAGS_DEFAULT)
        })
    }

    fn register_new_buffer_event(&self, stream: RawHandle) -> NativeResult<RawHandle> {
        let mut handle: sys::EVENT_HANDLE = ptr::null_mut();
        // SAFETY: a data stream handle is a valid event source.
        self.check("GCRegisterEvent", unsafe {
            (self.api.gc_register_event)(stream.as_ptr(), sys::EVENT_NEW_BUFFER, &mut handle)
        })?;
        Ok(RawHandle::from_ptr(handle))
    }

    fn unregister_new_buffer_event(&self, stream: RawHandle, _event: RawHandle) -> NativeResult<()> {
        // SAFETY: valid event source handle.
        self.check("GCUnregisterEvent", unsafe {
            (self.api.gc_unregister_event)(stream.as_ptr(), sys::EVENT_NEW_BUFFER)
        })
    }

    fn wait_new_buffer(&self, event: RawHandle, timeout: Duration) -> NativeResult<NewBuffer> {
        let mut data = sys::EVENT_NEW_BUFFER_DATA {
            BufferHandle: ptr::null_mut(),
            pUserPointer: ptr::null_mut(),
        };
        let mut size = std::mem::size_of::<sys::EVENT_NEW_BUFFER_DATA>();
        // SAFETY: `data` is a properly sized EVENT_NEW_BUFFER_DATA.
        let code = unsafe {
            (self.api.event_get_data)(
                event.as_ptr(),
                (&mut data as *mut sys::EVENT_NEW_BUFFER_DATA).cast::<c_void>(),
                &mut size,
                timeout_ms(timeout),
            )
        };
        self.check("EventGetData", code)?;
        Ok(NewBuffer {
            buffer: RawHandle::from_ptr(data.BufferHandle),
            user_index: data.pUserPointer as usize,
        })
    }

    fn buffer_info(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<BufferDescriptor> {
        let number = |cmd: sys::BUFFER_INFO_CMD| self.buffer_number(stream, buffer, cmd);
        let size = |cmd: sys::BUFFER_INFO_CMD| -> NativeResult<usize> {
            Ok(number(cmd)?.and_then(|v| usize::try_from(v).ok()).unwrap_or(0))
        };
        Ok(BufferDescriptor {
            frame_id: number(sys::BUFFER_INFO_FRAMEID)?.unwrap_or(0),
            timestamp: number(sys::BUFFER_INFO_TIMESTAMP)?.unwrap_or(0),
            timestamp_ns: number(sys::BUFFER_INFO_TIMESTAMP_NS)?,
            size_filled: size(sys::BUFFER_INFO_SIZE_FILLED)?,
            payload_type: number(sys::BUFFER_INFO_PAYLOADTYPE)?.map(PayloadType::from_raw),
            pixel_format: PixelFormat(number(sys::BUFFER_INFO_PIXELFORMAT)?.unwrap_or(0)),
            width: size(sys::BUFFER_INFO_WIDTH)?,
            height: size(sys::BUFFER_INFO_HEIGHT)?,
            x_offset: size(sys::BUFFER_INFO_XOFFSET)?,
            y_offset: size(sys::BUFFER_INFO_YOFFSET)?,
            x_padding: size(sys::BUFFER_INFO_XPADDING)?,
            y_padding: size(sys::BUFFER_INFO_YPADDING)?,
            image_offset: size(sys::BUFFER_INFO_IMAGEOFFSET)?,
            is_incomplete: number(sys::BUFFER_INFO_IS_INCOMPLETE)?.is_some_and(|v| v != 0),
            contains_chunk_data: number(sys::BUFFER_INFO_CONTAINS_CHUNKDATA)?.is_some_and(|v| v != 0),
        })
    }

    fn buffer_parts(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<Vec<PartDescriptor>> {
        let (Some(num_parts), Some(part_info)) =
            (self.api.ds_get_num_buffer_parts, self.api.ds_get_buffer_part_info)
        else {
            return Ok(Vec::new());
        };
        let mut count: u32 = 0;
        // SAFETY: valid handles and out pointer.
        let code = unsafe { num_parts(stream.as_ptr(), buffer.as_ptr(), &mut count) };
        if is_unsupported(code) {
            return Ok(Vec::new());
        }
        self.check("DSGetNumBufferParts", code)?;

        let buffer_base = self.buffer_number(stream, buffer, sys::BUFFER_INFO_BASE)?.unwrap_or(0);
        let mut parts = Vec::with_capacity(count as usize);
        for index in 0..count {
            let number = |cmd: sys::BUFFER_PART_INFO_CMD| {
                self.part_number(part_info, stream, buffer, index, cmd)
            };
            let size = |cmd: sys::BUFFER_PART_INFO_CMD| -> NativeResult<usize> {
                Ok(number(cmd)?.and_then(|v| usize::try_from(v).ok()).unwrap_or(0))
            };
            let part_base = number(sys::BUFFER_PART_INFO_BASE)?.unwrap_or(buffer_base);
            let Some(offset) = part_base
                .checked_sub(buffer_base)
                .and_then(|v| usize::try_from(v).ok())
            else {
                tracing::warn!(index, "Buffer part lies before the buffer base; skipped");
                continue;
            };
            parts.push(PartDescriptor {
                offset,
                data_size: size(sys::BUFFER_PART_INFO_DATA_SIZE)?,
                data_type: number(sys::BUFFER_PART_INFO_DATA_TYPE)?.unwrap_or(sys::PART_DATATYPE_UNKNOWN),
                data_format: PixelFormat(number(sys::BUFFER_PART_INFO_DATA_FORMAT)?.unwrap_or(0)),
                width: size(sys::BUFFER_PART_INFO_WIDTH)?,
                height: size(sys::BUFFER_PART_INFO_HEIGHT)?,
                x_offset: size(sys::BUFFER_PART_INFO_XOFFSET)?,
                y_offset: size(sys::BUFFER_PART_INFO_YOFFSET)?,
                x_padding: size(sys::BUFFER_PART_INFO_XPADDING)?,
                source_id: number(sys::BUFFER_PART_INFO_SOURCE_ID)?.unwrap_or(0),
            });
        }
        Ok(parts)
    }

    fn buffer_chunks(&self, stream: RawHandle, buffer: RawHandle) -> NativeResult<Vec<ChunkDescriptor>> {
        let Some(chunk_data) = self.api.ds_get_buffer_chunk_data else {
            return Ok(Vec::new());
        };
        let mut count: usize = 0;
        // SAFETY: a null array asks for the number of chunks.
        let code = unsafe { chunk_data(stream.as_ptr(), buffer.as_ptr(), ptr::null_mut(), &mut count) };
        if is_unsupported(code) || code == sys::GC_ERR_NO_DATA || count == 0 {
            return Ok(Vec::new());
        }
        self.check("DSGetBufferChunkData", code)?;

        let mut raw = vec![sys::SINGLE_CHUNK_DATA::default(); count];
        // SAFETY: `raw` has room for `count` entries.
        let code = unsafe { chunk_data(stream.as_ptr(), buffer.as_ptr(), raw.as_mut_ptr(), &mut count) };
        self.check("DSGetBufferChunkData", code)?;
        raw.truncate(count);

        Ok(raw
            .into_iter()
            .filter_map(|chunk| {
                let offset = usize::try_from(chunk.ChunkOffset).ok()?;
                Some(ChunkDescriptor {
                    chunk_id: chunk.ChunkID,
                    offset,
                    length: chunk.ChunkLength,
                })
            })
            .collect())
    }

    fn close(&self) -> NativeResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // SAFETY: called once; callers close every handle first.
        self.check("GCCloseLib", unsafe { (self.api.gc_close_lib)() })
    }
}

impl Drop for CtiProducer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "GCCloseLib failed while dropping producer");
        }
    }
}

fn is_unsupported(code: sys::GC_ERROR) -> bool {
    matches!(code, sys::GC_ERR_NOT_IMPLEMENTED | sys::GC_ERR_NOT_AVAILABLE)
}

fn c_chars_to_string(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Two-call string read for the `*GetID` style entry points.
fn read_string<F>(_operation: &'static str, mut call: F) -> Result<String, sys::GC_ERROR>
where
    F: FnMut(*mut c_char, *mut usize) -> sys::GC_ERROR,
{
    let mut size: usize = 0;
    let code = call(ptr::null_mut(), &mut size);
    if code != sys::GC_ERR_SUCCESS {
        return Err(code);
    }
    if size == 0 {
        return Ok(String::new());
    }
    let mut raw = vec![0 as c_char; size];
    let code = call(raw.as_mut_ptr(), &mut size);
    if code != sys::GC_ERR_SUCCESS {
        return Err(code);
    }
    Ok(c_chars_to_string(&raw))
}

/// Two-call string read for the `*GetInfo` style entry points.
fn read_info_string<F>(operation: &'static str, mut call: F) -> NativeResult<String>
where
    F: FnMut(*mut sys::INFO_DATATYPE, *mut c_void, *mut usize) -> sys::GC_ERROR,
{
    let mut kind: sys::INFO_DATATYPE = sys::INFO_DATATYPE_UNKNOWN;
    read_string(operation, |buf, size| call(&mut kind, buf.cast::<c_void>(), size))
        .map_err(|code| NativeCallError::new(operation, code, ""))
}

/// Read an integer-valued info command.
///
/// Returns `Ok(None)` when the producer does not implement the command, so
/// optional fields degrade instead of failing the whole query.
fn read_info_unsigned<F>(operation: &'static str, mut call: F) -> NativeResult<Option<u64>>
where
    F: FnMut(*mut sys::INFO_DATATYPE, *mut c_void, *mut usize) -> sys::GC_ERROR,
{
    let mut kind: sys::INFO_DATATYPE = sys::INFO_DATATYPE_UNKNOWN;
    let mut raw = [0u8; 8];
    let mut size = raw.len();
    let code = call(&mut kind, raw.as_mut_ptr().cast::<c_void>(), &mut size);
    if is_unsupported(code) || code == sys::GC_ERR_INVALID_PARAMETER || code == sys::GC_ERR_NO_DATA {
        return Ok(None);
    }
    if code != sys::GC_ERR_SUCCESS {
        return Err(NativeCallError::new(operation, code, ""));
    }
    Ok(decode_unsigned(&raw, size))
}

/// Decode a native-endian integer of `size` bytes.
fn decode_unsigned(raw: &[u8; 8], size: usize) -> Option<u64> {
    match size {
        1 => Some(u64::from(raw[0])),
        2 => Some(u64::from(u16::from_ne_bytes([raw[0], raw[1]]))),
        4 => Some(u64::from(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))),
        8 => Some(u64::from_ne_bytes(*raw)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_a_load_error() {
        let err = CtiProducer::load("/nonexistent/producer.cti").err();
        assert!(matches!(err, Some(HarvestError::ProducerLoad { .. })));
    }

    #[test]
    fn test_garbage_file_is_a_load_error() {
        let mut file = tempfile::Builder::new()
            .suffix(".cti")
            .tempfile()
            .unwrap();
        file.write_all(b"definitely not a shared library").unwrap();

        match CtiProducer::load(file.path()) {
            Err(HarvestError::ProducerLoad { reason, .. }) => {
                assert!(reason.contains("not a loadable module"), "{}", reason);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("garbage accepted as a producer"),
        }
    }

    #[test]
    fn test_decode_unsigned() {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&0x0108_0001u32.to_ne_bytes());
        assert_eq!(decode_unsigned(&raw, 4), Some(0x0108_0001));
        assert_eq!(decode_unsigned(&[1, 0, 0, 0, 0, 0, 0, 0], 1), Some(1));
        assert_eq!(decode_unsigned(&raw, 3), None);
    }

    #[test]
    fn test_c_chars_to_string_stops_at_nul() {
        let raw: Vec<c_char> = b"SIM-0\0junk".iter().map(|b| *b as c_char).collect();
        assert_eq!(c_chars_to_string(&raw), "SIM-0");
    }

    #[test]
    fn test_read_string_two_call_pattern() {
        let source = b"IF-0\0";
        let mut calls = 0;
        let result = read_string("TLGetInterfaceID", |buf, size| {
            calls += 1;
            // SAFETY: test closure mimics a producer writing into the caller's buffer.
            unsafe {
                if buf.is_null() {
                    *size = source.len();
                } else {
                    for (i, b) in source.iter().enumerate() {
                        *buf.add(i) = *b as c_char;
                    }
                }
            }
            sys::GC_ERR_SUCCESS
        });
        assert_eq!(result, Ok("IF-0".to_string()));
        assert_eq!(calls, 2);
    }
}
