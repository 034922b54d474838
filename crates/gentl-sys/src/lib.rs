//! Raw C ABI of the GenICam GenTL standard.
//!
//! A GenTL Producer is a shared library (conventionally with a `.cti`
//! extension) exporting a flat C interface. Every call returns a `GC_ERROR`
//! and passes opaque `void*` handles for the system, interface, device,
//! data stream, buffer and event modules.
//!
//! This crate only declares what the acquisition engine needs. The entry
//! points are resolved at runtime with `libloading`, so each function is
//! exposed as a pointer type (`PTLOpen`, `PDSQueueBuffer`, ...) rather than
//! an `extern` block.
//!
//! All producer functions use the platform calling convention
//! (`__stdcall` on 32-bit Windows), hence `extern "system"`.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(missing_docs)]

use std::ffi::{c_char, c_void};

// =============================================================================
// Scalar and handle types
// =============================================================================

pub type GC_ERROR = i32;
pub type bool8_t = u8;

pub type TL_HANDLE = *mut c_void;
pub type IF_HANDLE = *mut c_void;
pub type DEV_HANDLE = *mut c_void;
pub type DS_HANDLE = *mut c_void;
pub type BUFFER_HANDLE = *mut c_void;
pub type EVENT_HANDLE = *mut c_void;
pub type EVENTSRC_HANDLE = *mut c_void;

pub type INFO_DATATYPE = i32;
pub type TL_INFO_CMD = i32;
pub type DEVICE_INFO_CMD = i32;
pub type STREAM_INFO_CMD = i32;
pub type BUFFER_INFO_CMD = i32;
pub type BUFFER_PART_INFO_CMD = i32;
pub type DEVICE_ACCESS_FLAGS = i32;
pub type EVENT_TYPE = i32;
pub type ACQ_START_FLAGS = i32;
pub type ACQ_STOP_FLAGS = i32;
pub type ACQ_QUEUE_TYPE = i32;

/// Timeout value meaning "wait forever".
pub const GENTL_INFINITE: u64 = u64::MAX;

// =============================================================================
// Error codes
// =============================================================================

pub const GC_ERR_SUCCESS: GC_ERROR = 0;
pub const GC_ERR_ERROR: GC_ERROR = -1001;
pub const GC_ERR_NOT_INITIALIZED: GC_ERROR = -1002;
pub const GC_ERR_NOT_IMPLEMENTED: GC_ERROR = -1003;
pub const GC_ERR_RESOURCE_IN_USE: GC_ERROR = -1004;
pub const GC_ERR_ACCESS_DENIED: GC_ERROR = -1005;
pub const GC_ERR_INVALID_HANDLE: GC_ERROR = -1006;
pub const GC_ERR_INVALID_ID: GC_ERROR = -1007;
pub const GC_ERR_NO_DATA: GC_ERROR = -1008;
pub const GC_ERR_INVALID_PARAMETER: GC_ERROR = -1009;
pub const GC_ERR_IO: GC_ERROR = -1010;
pub const GC_ERR_TIMEOUT: GC_ERROR = -1011;
pub const GC_ERR_ABORT: GC_ERROR = -1012;
pub const GC_ERR_INVALID_BUFFER: GC_ERROR = -1013;
pub const GC_ERR_NOT_AVAILABLE: GC_ERROR = -1014;
pub const GC_ERR_INVALID_ADDRESS: GC_ERROR = -1015;
pub const GC_ERR_BUFFER_TOO_SMALL: GC_ERROR = -1016;
pub const GC_ERR_INVALID_INDEX: GC_ERROR = -1017;
pub const GC_ERR_PARSING_CHUNK_DATA: GC_ERROR = -1018;
pub const GC_ERR_INVALID_VALUE: GC_ERROR = -1019;
pub const GC_ERR_RESOURCE_EXHAUSTED: GC_ERROR = -1020;
pub const GC_ERR_OUT_OF_MEMORY: GC_ERROR = -1021;
pub const GC_ERR_BUSY: GC_ERROR = -1022;
pub const GC_ERR_AMBIGUOUS: GC_ERROR = -1023;

/// Symbolic name of a `GC_ERROR`, for log messages.
pub fn error_name(code: GC_ERROR) -> &'static str {
    match code {
        GC_ERR_SUCCESS => "GC_ERR_SUCCESS",
        GC_ERR_ERROR => "GC_ERR_ERROR",
        GC_ERR_NOT_INITIALIZED => "GC_ERR_NOT_INITIALIZED",
        GC_ERR_NOT_IMPLEMENTED => "GC_ERR_NOT_IMPLEMENTED",
        GC_ERR_RESOURCE_IN_USE => "GC_ERR_RESOURCE_IN_USE",
        GC_ERR_ACCESS_DENIED => "GC_ERR_ACCESS_DENIED",
        GC_ERR_INVALID_HANDLE => "GC_ERR_INVALID_HANDLE",
        GC_ERR_INVALID_ID => "GC_ERR_INVALID_ID",
        GC_ERR_NO_DATA => "GC_ERR_NO_DATA",
        GC_ERR_INVALID_PARAMETER => "GC_ERR_INVALID_PARAMETER",
        GC_ERR_IO => "GC_ERR_IO",
        GC_ERR_TIMEOUT => "GC_ERR_TIMEOUT",
        GC_ERR_ABORT => "GC_ERR_ABORT",
        GC_ERR_INVALID_BUFFER => "GC_ERR_INVALID_BUFFER",
        GC_ERR_NOT_AVAILABLE => "GC_ERR_NOT_AVAILABLE",
        GC_ERR_INVALID_ADDRESS => "GC_ERR_INVALID_ADDRESS",
        GC_ERR_BUFFER_TOO_SMALL => "GC_ERR_BUFFER_TOO_SMALL",
        GC_ERR_INVALID_INDEX => "GC_ERR_INVALID_INDEX",
        GC_ERR_PARSING_CHUNK_DATA => "GC_ERR_PARSING_CHUNK_DATA",
        GC_ERR_INVALID_VALUE => "GC_ERR_INVALID_VALUE",
        GC_ERR_RESOURCE_EXHAUSTED => "GC_ERR_RESOURCE_EXHAUSTED",
        GC_ERR_OUT_OF_MEMORY => "GC_ERR_OUT_OF_MEMORY",
        GC_ERR_BUSY => "GC_ERR_BUSY",
        GC_ERR_AMBIGUOUS => "GC_ERR_AMBIGUOUS",
        _ => "GC_ERR_CUSTOM",
    }
}

// =============================================================================
// INFO_DATATYPE
// =============================================================================

pub const INFO_DATATYPE_UNKNOWN: INFO_DATATYPE = 0;
pub const INFO_DATATYPE_STRING: INFO_DATATYPE = 1;
pub const INFO_DATATYPE_STRINGLIST: INFO_DATATYPE = 2;
pub const INFO_DATATYPE_INT16: INFO_DATATYPE = 3;
pub const INFO_DATATYPE_UINT16: INFO_DATATYPE = 4;
pub const INFO_DATATYPE_INT32: INFO_DATATYPE = 5;
pub const INFO_DATATYPE_UINT32: INFO_DATATYPE = 6;
pub const INFO_DATATYPE_INT64: INFO_DATATYPE = 7;
pub const INFO_DATATYPE_UINT64: INFO_DATATYPE = 8;
pub const INFO_DATATYPE_FLOAT64: INFO_DATATYPE = 9;
pub const INFO_DATATYPE_PTR: INFO_DATATYPE = 10;
pub const INFO_DATATYPE_BOOL8: INFO_DATATYPE = 11;
pub const INFO_DATATYPE_SIZET: INFO_DATATYPE = 12;
pub const INFO_DATATYPE_BUFFER: INFO_DATATYPE = 13;
pub const INFO_DATATYPE_PTRDIFF: INFO_DATATYPE = 14;

// =============================================================================
// Info commands
// =============================================================================

pub const TL_INFO_ID: TL_INFO_CMD = 0;
pub const TL_INFO_VENDOR: TL_INFO_CMD = 1;
pub const TL_INFO_MODEL: TL_INFO_CMD = 2;
pub const TL_INFO_VERSION: TL_INFO_CMD = 3;
pub const TL_INFO_TLTYPE: TL_INFO_CMD = 4;
pub const TL_INFO_NAME: TL_INFO_CMD = 5;
pub const TL_INFO_PATHNAME: TL_INFO_CMD = 6;
pub const TL_INFO_DISPLAYNAME: TL_INFO_CMD = 7;
pub const TL_INFO_CHAR_ENCODING: TL_INFO_CMD = 8;
pub const TL_INFO_GENTL_VER_MAJOR: TL_INFO_CMD = 9;
pub const TL_INFO_GENTL_VER_MINOR: TL_INFO_CMD = 10;

pub const DEVICE_INFO_ID: DEVICE_INFO_CMD = 0;
pub const DEVICE_INFO_VENDOR: DEVICE_INFO_CMD = 1;
pub const DEVICE_INFO_MODEL: DEVICE_INFO_CMD = 2;
pub const DEVICE_INFO_TLTYPE: DEVICE_INFO_CMD = 3;
pub const DEVICE_INFO_DISPLAYNAME: DEVICE_INFO_CMD = 4;
pub const DEVICE_INFO_ACCESS_STATUS: DEVICE_INFO_CMD = 5;
pub const DEVICE_INFO_USER_DEFINED_NAME: DEVICE_INFO_CMD = 6;
pub const DEVICE_INFO_SERIAL_NUMBER: DEVICE_INFO_CMD = 7;
pub const DEVICE_INFO_VERSION: DEVICE_INFO_CMD = 8;
pub const DEVICE_INFO_TIMESTAMP_FREQUENCY: DEVICE_INFO_CMD = 9;

pub const STREAM_INFO_ID: STREAM_INFO_CMD = 0;
pub const STREAM_INFO_NUM_DELIVERED: STREAM_INFO_CMD = 1;
pub const STREAM_INFO_NUM_UNDERRUN: STREAM_INFO_CMD = 2;
pub const STREAM_INFO_NUM_ANNOUNCED: STREAM_INFO_CMD = 3;
pub const STREAM_INFO_NUM_QUEUED: STREAM_INFO_CMD = 4;
pub const STREAM_INFO_NUM_AWAIT_DELIVERY: STREAM_INFO_CMD = 5;
pub const STREAM_INFO_NUM_STARTED: STREAM_INFO_CMD = 6;
pub const STREAM_INFO_PAYLOAD_SIZE: STREAM_INFO_CMD = 7;
pub const STREAM_INFO_IS_GRABBING: STREAM_INFO_CMD = 8;
pub const STREAM_INFO_DEFINES_PAYLOADSIZE: STREAM_INFO_CMD = 9;
pub const STREAM_INFO_TLTYPE: STREAM_INFO_CMD = 10;
pub const STREAM_INFO_NUM_CHUNKS_MAX: STREAM_INFO_CMD = 11;
pub const STREAM_INFO_BUF_ANNOUNCE_MIN: STREAM_INFO_CMD = 12;
pub const STREAM_INFO_BUF_ALIGNMENT: STREAM_INFO_CMD = 13;

pub const BUFFER_INFO_BASE: BUFFER_INFO_CMD = 0;
pub const BUFFER_INFO_SIZE: BUFFER_INFO_CMD = 1;
pub const BUFFER_INFO_USER_PTR: BUFFER_INFO_CMD = 2;
pub const BUFFER_INFO_TIMESTAMP: BUFFER_INFO_CMD = 3;
pub const BUFFER_INFO_NEW_DATA: BUFFER_INFO_CMD = 4;
pub const BUFFER_INFO_IS_QUEUED: BUFFER_INFO_CMD = 5;
pub const BUFFER_INFO_IS_ACQUIRING: BUFFER_INFO_CMD = 6;
pub const BUFFER_INFO_IS_INCOMPLETE: BUFFER_INFO_CMD = 7;
pub const BUFFER_INFO_TLTYPE: BUFFER_INFO_CMD = 8;
pub const BUFFER_INFO_SIZE_FILLED: BUFFER_INFO_CMD = 9;
pub const BUFFER_INFO_WIDTH: BUFFER_INFO_CMD = 10;
pub const BUFFER_INFO_HEIGHT: BUFFER_INFO_CMD = 11;
pub const BUFFER_INFO_XOFFSET: BUFFER_INFO_CMD = 12;
pub const BUFFER_INFO_YOFFSET: BUFFER_INFO_CMD = 13;
pub const BUFFER_INFO_XPADDING: BUFFER_INFO_CMD = 14;
pub const BUFFER_INFO_YPADDING: BUFFER_INFO_CMD = 15;
pub const BUFFER_INFO_FRAMEID: BUFFER_INFO_CMD = 16;
pub const BUFFER_INFO_IMAGEPRESENT: BUFFER_INFO_CMD = 17;
pub const BUFFER_INFO_IMAGEOFFSET: BUFFER_INFO_CMD = 18;
pub const BUFFER_INFO_PAYLOADTYPE: BUFFER_INFO_CMD = 19;
pub const BUFFER_INFO_PIXELFORMAT: BUFFER_INFO_CMD = 20;
pub const BUFFER_INFO_PIXELFORMAT_NAMESPACE: BUFFER_INFO_CMD = 21;
pub const BUFFER_INFO_DELIVERED_IMAGEHEIGHT: BUFFER_INFO_CMD = 22;
pub const BUFFER_INFO_DELIVERED_CHUNKPAYLOADSIZE: BUFFER_INFO_CMD = 23;
pub const BUFFER_INFO_CHUNKLAYOUTID: BUFFER_INFO_CMD = 24;
pub const BUFFER_INFO_FILENAME: BUFFER_INFO_CMD = 25;
pub const BUFFER_INFO_PIXEL_ENDIANNESS: BUFFER_INFO_CMD = 26;
pub const BUFFER_INFO_DATA_SIZE: BUFFER_INFO_CMD = 27;
pub const BUFFER_INFO_TIMESTAMP_NS: BUFFER_INFO_CMD = 28;
pub const BUFFER_INFO_DATA_LARGER_THAN_BUFFER: BUFFER_INFO_CMD = 29;
pub const BUFFER_INFO_CONTAINS_CHUNKDATA: BUFFER_INFO_CMD = 30;

pub const BUFFER_PART_INFO_BASE: BUFFER_PART_INFO_CMD = 0;
pub const BUFFER_PART_INFO_DATA_SIZE: BUFFER_PART_INFO_CMD = 1;
pub const BUFFER_PART_INFO_DATA_TYPE: BUFFER_PART_INFO_CMD = 2;
pub const BUFFER_PART_INFO_DATA_FORMAT: BUFFER_PART_INFO_CMD = 3;
pub const BUFFER_PART_INFO_DATA_FORMAT_NAMESPACE: BUFFER_PART_INFO_CMD = 4;
pub const BUFFER_PART_INFO_WIDTH: BUFFER_PART_INFO_CMD = 5;
pub const BUFFER_PART_INFO_HEIGHT: BUFFER_PART_INFO_CMD = 6;
pub const BUFFER_PART_INFO_XOFFSET: BUFFER_PART_INFO_CMD = 7;
pub const BUFFER_PART_INFO_YOFFSET: BUFFER_PART_INFO_CMD = 8;
pub const BUFFER_PART_INFO_XPADDING: BUFFER_PART_INFO_CMD = 9;
pub const BUFFER_PART_INFO_SOURCE_ID: BUFFER_PART_INFO_CMD = 10;
pub const BUFFER_PART_INFO_DELIVERED_IMAGEHEIGHT: BUFFER_PART_INFO_CMD = 11;

// =============================================================================
// Enumerations
// =============================================================================

pub const DEVICE_ACCESS_UNKNOWN: DEVICE_ACCESS_FLAGS = 0;
pub const DEVICE_ACCESS_NONE: DEVICE_ACCESS_FLAGS = 1;
pub const DEVICE_ACCESS_READONLY: DEVICE_ACCESS_FLAGS = 2;
pub const DEVICE_ACCESS_CONTROL: DEVICE_ACCESS_FLAGS = 3;
pub const DEVICE_ACCESS_EXCLUSIVE: DEVICE_ACCESS_FLAGS = 4;

pub const DEVICE_ACCESS_STATUS_UNKNOWN: i32 = 0;
pub const DEVICE_ACCESS_STATUS_READWRITE: i32 = 1;
pub const DEVICE_ACCESS_STATUS_READONLY: i32 = 2;
pub const DEVICE_ACCESS_STATUS_NOACCESS: i32 = 3;
pub const DEVICE_ACCESS_STATUS_BUSY: i32 = 4;
pub const DEVICE_ACCESS_STATUS_OPEN_READWRITE: i32 = 5;
pub const DEVICE_ACCESS_STATUS_OPEN_READONLY: i32 = 6;

pub const PAYLOAD_TYPE_UNKNOWN: u64 = 0;
pub const PAYLOAD_TYPE_IMAGE: u64 = 1;
pub const PAYLOAD_TYPE_RAW_DATA: u64 = 2;
pub const PAYLOAD_TYPE_FILE: u64 = 3;
pub const PAYLOAD_TYPE_CHUNK_DATA: u64 = 4;
pub const PAYLOAD_TYPE_JPEG: u64 = 5;
pub const PAYLOAD_TYPE_JPEG2000: u64 = 6;
pub const PAYLOAD_TYPE_H264: u64 = 7;
pub const PAYLOAD_TYPE_CHUNK_ONLY: u64 = 8;
pub const PAYLOAD_TYPE_DEVICE_SPECIFIC: u64 = 9;
pub const PAYLOAD_TYPE_MULTI_PART: u64 = 10;

pub const PART_DATATYPE_UNKNOWN: u64 = 0;
pub const PART_DATATYPE_2D_IMAGE: u64 = 1;
pub const PART_DATATYPE_2D_PLANE_BIPLANAR: u64 = 2;
pub const PART_DATATYPE_2D_PLANE_TRIPLANAR: u64 = 3;
pub const PART_DATATYPE_2D_PLANE_QUADPLANAR: u64 = 4;
pub const PART_DATATYPE_3D_IMAGE: u64 = 5;
pub const PART_DATATYPE_3D_PLANE_BIPLANAR: u64 = 6;
pub const PART_DATATYPE_3D_PLANE_TRIPLANAR: u64 = 7;
pub const PART_DATATYPE_3D_PLANE_QUADPLANAR: u64 = 8;
pub const PART_DATATYPE_CONFIDENCE_MAP: u64 = 9;

pub const EVENT_ERROR: EVENT_TYPE = 0;
pub const EVENT_NEW_BUFFER: EVENT_TYPE = 1;
pub const EVENT_FEATURE_INVALIDATE: EVENT_TYPE = 2;
pub const EVENT_FEATURE_CHANGE: EVENT_TYPE = 3;
pub const EVENT_REMOTE_DEVICE: EVENT_TYPE = 4;
pub const EVENT_MODULE: EVENT_TYPE = 5;

pub const ACQ_START_FLAGS_DEFAULT: ACQ_START_FLAGS = 0;
pub const ACQ_STOP_FLAGS_DEFAULT: ACQ_STOP_FLAGS = 0;
pub const ACQ_STOP_FLAGS_KILL: ACQ_STOP_FLAGS = 1;

pub const ACQ_QUEUE_INPUT_TO_OUTPUT: ACQ_QUEUE_TYPE = 0;
pub const ACQ_QUEUE_OUTPUT_DISCARD: ACQ_QUEUE_TYPE = 1;
pub const ACQ_QUEUE_ALL_TO_INPUT: ACQ_QUEUE_TYPE = 2;
pub const ACQ_QUEUE_UNQUEUED_TO_INPUT: ACQ_QUEUE_TYPE = 3;
pub const ACQ_QUEUE_ALL_DISCARD: ACQ_QUEUE_TYPE = 4;

// =============================================================================
// Event payloads
// =============================================================================

/// Data delivered by `EventGetData` for an `EVENT_NEW_BUFFER` registration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EVENT_NEW_BUFFER_DATA {
    pub BufferHandle: BUFFER_HANDLE,
    pub pUserPointer: *mut c_void,
}

/// One chunk descriptor filled in by `DSGetBufferChunkData`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SINGLE_CHUNK_DATA {
    pub ChunkID: u64,
    pub ChunkOffset: isize,
    pub ChunkLength: usize,
}

// =============================================================================
// Entry point signatures
// =============================================================================

pub type PGCInitLib = unsafe extern "system" fn() -> GC_ERROR;
pub type PGCCloseLib = unsafe extern "system" fn() -> GC_ERROR;
pub type PGCGetInfo = unsafe extern "system" fn(
    iInfoCmd: TL_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PGCGetLastError =
    unsafe extern "system" fn(piErrorCode: *mut GC_ERROR, sErrText: *mut c_char, piSize: *mut usize) -> GC_ERROR;
pub type PGCRegisterEvent = unsafe extern "system" fn(
    hEventSrc: EVENTSRC_HANDLE,
    iEventID: EVENT_TYPE,
    phEvent: *mut EVENT_HANDLE,
) -> GC_ERROR;
pub type PGCUnregisterEvent =
    unsafe extern "system" fn(hEventSrc: EVENTSRC_HANDLE, iEventID: EVENT_TYPE) -> GC_ERROR;

pub type PEventGetData = unsafe extern "system" fn(
    hEvent: EVENT_HANDLE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
    iTimeout: u64,
) -> GC_ERROR;
pub type PEventFlush = unsafe extern "system" fn(hEvent: EVENT_HANDLE) -> GC_ERROR;
pub type PEventKill = unsafe extern "system" fn(hEvent: EVENT_HANDLE) -> GC_ERROR;

pub type PTLOpen = unsafe extern "system" fn(phSystem: *mut TL_HANDLE) -> GC_ERROR;
pub type PTLClose = unsafe extern "system" fn(hSystem: TL_HANDLE) -> GC_ERROR;
pub type PTLUpdateInterfaceList =
    unsafe extern "system" fn(hSystem: TL_HANDLE, pbChanged: *mut bool8_t, iTimeout: u64) -> GC_ERROR;
pub type PTLGetNumInterfaces =
    unsafe extern "system" fn(hSystem: TL_HANDLE, piNumIfaces: *mut u32) -> GC_ERROR;
pub type PTLGetInterfaceID = unsafe extern "system" fn(
    hSystem: TL_HANDLE,
    iIndex: u32,
    sID: *mut c_char,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PTLOpenInterface = unsafe extern "system" fn(
    hSystem: TL_HANDLE,
    sIfaceID: *const c_char,
    phIface: *mut IF_HANDLE,
) -> GC_ERROR;

pub type PIFClose = unsafe extern "system" fn(hIface: IF_HANDLE) -> GC_ERROR;
pub type PIFUpdateDeviceList =
    unsafe extern "system" fn(hIface: IF_HANDLE, pbChanged: *mut bool8_t, iTimeout: u64) -> GC_ERROR;
pub type PIFGetNumDevices =
    unsafe extern "system" fn(hIface: IF_HANDLE, piNumDevices: *mut u32) -> GC_ERROR;
pub type PIFGetDeviceID = unsafe extern "system" fn(
    hIface: IF_HANDLE,
    iIndex: u32,
    sIDeviceID: *mut c_char,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PIFGetDeviceInfo = unsafe extern "system" fn(
    hIface: IF_HANDLE,
    sDeviceID: *const c_char,
    iInfoCmd: DEVICE_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PIFOpenDevice = unsafe extern "system" fn(
    hIface: IF_HANDLE,
    sDeviceID: *const c_char,
    iOpenFlag: DEVICE_ACCESS_FLAGS,
    phDevice: *mut DEV_HANDLE,
) -> GC_ERROR;

pub type PDevClose = unsafe extern "system" fn(hDevice: DEV_HANDLE) -> GC_ERROR;
pub type PDevGetNumDataStreams =
    unsafe extern "system" fn(hDevice: DEV_HANDLE, piNumDataStreams: *mut u32) -> GC_ERROR;
pub type PDevGetDataStreamID = unsafe extern "system" fn(
    hDevice: DEV_HANDLE,
    iIndex: u32,
    sDataStreamID: *mut c_char,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PDevOpenDataStream = unsafe extern "system" fn(
    hDevice: DEV_HANDLE,
    sDataStreamID: *const c_char,
    phDataStream: *mut DS_HANDLE,
) -> GC_ERROR;

pub type PDSClose = unsafe extern "system" fn(hDataStream: DS_HANDLE) -> GC_ERROR;
pub type PDSGetInfo = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    iInfoCmd: STREAM_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PDSAnnounceBuffer = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    pBuffer: *mut c_void,
    iSize: usize,
    pPrivate: *mut c_void,
    phBuffer: *mut BUFFER_HANDLE,
) -> GC_ERROR;
pub type PDSRevokeBuffer = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    pBuffer: *mut *mut c_void,
    pPrivate: *mut *mut c_void,
) -> GC_ERROR;
pub type PDSQueueBuffer =
    unsafe extern "system" fn(hDataStream: DS_HANDLE, hBuffer: BUFFER_HANDLE) -> GC_ERROR;
pub type PDSFlushQueue =
    unsafe extern "system" fn(hDataStream: DS_HANDLE, iOperation: ACQ_QUEUE_TYPE) -> GC_ERROR;
pub type PDSStartAcquisition = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    iStartFlags: ACQ_START_FLAGS,
    iNumToAcquire: u64,
) -> GC_ERROR;
pub type PDSStopAcquisition =
    unsafe extern "system" fn(hDataStream: DS_HANDLE, iStopFlags: ACQ_STOP_FLAGS) -> GC_ERROR;
pub type PDSGetBufferInfo = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    iInfoCmd: BUFFER_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PDSGetNumBufferParts = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    piNumParts: *mut u32,
) -> GC_ERROR;
pub type PDSGetBufferPartInfo = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    iPartIndex: u32,
    iInfoCmd: BUFFER_PART_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type PDSGetBufferChunkData = unsafe extern "system" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    pChunkData: *mut SINGLE_CHUNK_DATA,
    piNumChunks: *mut usize,
) -> GC_ERROR;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        assert_eq!(error_name(GC_ERR_TIMEOUT), "GC_ERR_TIMEOUT");
        assert_eq!(error_name(GC_ERR_ABORT), "GC_ERR_ABORT");
        assert_eq!(error_name(-42), "GC_ERR_CUSTOM");
    }

    #[test]
    fn test_event_struct_layout() {
        assert_eq!(
            std::mem::size_of::<EVENT_NEW_BUFFER_DATA>(),
            2 * std::mem::size_of::<*mut c_void>()
        );
        assert_eq!(std::mem::size_of::<SINGLE_CHUNK_DATA>(), 8 + 2 * std::mem::size_of::<usize>());
    }
}
