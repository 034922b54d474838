//! Payload component model.
//!
//! A filled buffer is described by the producer through a set of info queries
//! (frame id, payload type, geometry, pixel format, ...), optionally a list of
//! parts (multi-part payloads) and optionally a list of chunks (chunk data
//! appended to or replacing the image). [`parse_components`] turns those
//! descriptors into an ordered list of [`Component`]s, each a bounded byte
//! range of the buffer with a semantic [`ComponentKind`].
//!
//! Parsing is pure so that layouts can be tested without a producer.

use gentl_sys as sys;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `BUFFER_INFO_PAYLOADTYPE` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    Unknown,
    Image,
    RawData,
    File,
    ChunkData,
    Jpeg,
    Jpeg2000,
    H264,
    ChunkOnly,
    DeviceSpecific,
    MultiPart,
}

impl PayloadType {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            sys::PAYLOAD_TYPE_IMAGE => Self::Image,
            sys::PAYLOAD_TYPE_RAW_DATA => Self::RawData,
            sys::PAYLOAD_TYPE_FILE => Self::File,
            sys::PAYLOAD_TYPE_CHUNK_DATA => Self::ChunkData,
            sys::PAYLOAD_TYPE_JPEG => Self::Jpeg,
            sys::PAYLOAD_TYPE_JPEG2000 => Self::Jpeg2000,
            sys::PAYLOAD_TYPE_H264 => Self::H264,
            sys::PAYLOAD_TYPE_CHUNK_ONLY => Self::ChunkOnly,
            sys::PAYLOAD_TYPE_DEVICE_SPECIFIC => Self::DeviceSpecific,
            sys::PAYLOAD_TYPE_MULTI_PART => Self::MultiPart,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        match self {
            Self::Unknown => sys::PAYLOAD_TYPE_UNKNOWN,
            Self::Image => sys::PAYLOAD_TYPE_IMAGE,
            Self::RawData => sys::PAYLOAD_TYPE_RAW_DATA,
            Self::File => sys::PAYLOAD_TYPE_FILE,
            Self::ChunkData => sys::PAYLOAD_TYPE_CHUNK_DATA,
            Self::Jpeg => sys::PAYLOAD_TYPE_JPEG,
            Self::Jpeg2000 => sys::PAYLOAD_TYPE_JPEG2000,
            Self::H264 => sys::PAYLOAD_TYPE_H264,
            Self::ChunkOnly => sys::PAYLOAD_TYPE_CHUNK_ONLY,
            Self::DeviceSpecific => sys::PAYLOAD_TYPE_DEVICE_SPECIFIC,
            Self::MultiPart => sys::PAYLOAD_TYPE_MULTI_PART,
        }
    }
}

/// A PFNC pixel format code.
///
/// PFNC packs the occupied bits per pixel into bits 16..24 of the code, so
/// the size of unknown formats can still be derived.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelFormat(pub u64);

impl PixelFormat {
    pub const MONO8: PixelFormat = PixelFormat(0x0108_0001);
    pub const MONO10: PixelFormat = PixelFormat(0x0110_0003);
    pub const MONO12: PixelFormat = PixelFormat(0x0110_0005);
    pub const MONO16: PixelFormat = PixelFormat(0x0110_0007);
    pub const BAYER_GR8: PixelFormat = PixelFormat(0x0108_0008);
    pub const BAYER_RG8: PixelFormat = PixelFormat(0x0108_0009);
    pub const BAYER_GB8: PixelFormat = PixelFormat(0x0108_000A);
    pub const BAYER_BG8: PixelFormat = PixelFormat(0x0108_000B);
    pub const RGB8: PixelFormat = PixelFormat(0x0218_0014);
    pub const BGR8: PixelFormat = PixelFormat(0x0218_0015);

    #[must_use]
    pub fn bits_per_pixel(self) -> usize {
        ((self.0 >> 16) & 0xFF) as usize
    }

    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::MONO8 => "Mono8",
            Self::MONO10 => "Mono10",
            Self::MONO12 => "Mono12",
            Self::MONO16 => "Mono16",
            Self::BAYER_GR8 => "BayerGR8",
            Self::BAYER_RG8 => "BayerRG8",
            Self::BAYER_GB8 => "BayerGB8",
            Self::BAYER_BG8 => "BayerBG8",
            Self::RGB8 => "RGB8",
            Self::BGR8 => "BGR8",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "PixelFormat({:#010x})", self.0),
        }
    }
}

/// Buffer-level info reported for a filled buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub frame_id: u64,
    /// Device timestamp in device ticks.
    pub timestamp: u64,
    /// Timestamp in nanoseconds, when the producer supports it.
    pub timestamp_ns: Option<u64>,
    /// Bytes written by the producer. Zero means "not reported".
    pub size_filled: usize,
    pub payload_type: Option<PayloadType>,
    pub pixel_format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_padding: usize,
    pub y_padding: usize,
    pub image_offset: usize,
    pub is_incomplete: bool,
    pub contains_chunk_data: bool,
}

/// One part of a multi-part buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartDescriptor {
    /// Offset from the buffer base.
    pub offset: usize,
    pub data_size: usize,
    /// `PARTDATATYPE_IDS` value.
    pub data_type: u64,
    pub data_format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_padding: usize,
    pub source_id: u64,
}

/// One chunk reported by the producer's chunk parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub chunk_id: u64,
    pub offset: usize,
    pub length: usize,
}

/// Semantic type of a payload component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// 2D intensity image (including planar formats).
    Intensity,
    /// 3D range / point data.
    Range,
    /// Per-pixel confidence map.
    Confidence,
    /// Chunk metadata.
    Chunk,
    /// Anything else: raw data, compressed streams, files.
    Raw,
}

impl ComponentKind {
    #[must_use]
    pub fn from_part_data_type(data_type: u64) -> Self {
        match data_type {
            sys::PART_DATATYPE_2D_IMAGE
            | sys::PART_DATATYPE_2D_PLANE_BIPLANAR
            | sys::PART_DATATYPE_2D_PLANE_TRIPLANAR
            | sys::PART_DATATYPE_2D_PLANE_QUADPLANAR => Self::Intensity,
            sys::PART_DATATYPE_3D_IMAGE
            | sys::PART_DATATYPE_3D_PLANE_BIPLANAR
            | sys::PART_DATATYPE_3D_PLANE_TRIPLANAR
            | sys::PART_DATATYPE_3D_PLANE_QUADPLANAR => Self::Range,
            sys::PART_DATATYPE_CONFIDENCE_MAP => Self::Confidence,
            _ => Self::Raw,
        }
    }
}

/// A byte range of a delivered buffer with its meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub kind: ComponentKind,
    /// Offset from the buffer base.
    pub offset: usize,
    pub len: usize,
    pub width: usize,
    pub height: usize,
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_padding: usize,
    pub pixel_format: Option<PixelFormat>,
    pub source_id: Option<u64>,
    pub chunk_id: Option<u64>,
}

impl Component {
    fn raw(kind: ComponentKind, offset: usize, len: usize) -> Self {
        Self {
            kind,
            offset,
            len,
            width: 0,
            height: 0,
            x_offset: 0,
            y_offset: 0,
            x_padding: 0,
            pixel_format: None,
            source_id: None,
            chunk_id: None,
        }
    }

    /// Bytes per line including padding, when the pixel format is sized.
    #[must_use]
    pub fn stride(&self) -> Option<usize> {
        let bpp = self.pixel_format?.bits_per_pixel();
        if bpp == 0 || self.width == 0 {
            return None;
        }
        Some((self.width * bpp).div_ceil(8) + self.x_padding)
    }
}

/// Clamp `[offset, offset + len)` to `limit`. `None` if nothing is left.
fn bounded(offset: usize, len: usize, limit: usize, what: &str) -> Option<usize> {
    if offset >= limit {
        tracing::warn!(what, offset, limit, "Component starts past the filled region; skipped");
        return None;
    }
    let available = limit - offset;
    if len > available {
        tracing::warn!(what, offset, len, limit, "Component overruns the filled region; clamped");
        return Some(available);
    }
    Some(len)
}

fn image_component(desc: &BufferDescriptor, limit: usize, has_chunks: bool) -> Option<Component> {
    let bpp = desc.pixel_format.bits_per_pixel();
    let available = limit.saturating_sub(desc.image_offset);
    // With trailing chunks the image size has to come from the geometry;
    // otherwise the image runs to the end of the filled region.
    let len = if has_chunks && bpp > 0 && desc.width > 0 && desc.height > 0 {
        let line = (desc.width * bpp).div_ceil(8) + desc.x_padding;
        line * desc.height + desc.y_padding
    } else {
        available
    };
    let len = bounded(desc.image_offset, len, limit, "image")?;
    Some(Component {
        kind: ComponentKind::Intensity,
        offset: desc.image_offset,
        len,
        width: desc.width,
        height: desc.height,
        x_offset: desc.x_offset,
        y_offset: desc.y_offset,
        x_padding: desc.x_padding,
        pixel_format: Some(desc.pixel_format),
        source_id: None,
        chunk_id: None,
    })
}

fn chunk_components(chunks: &[ChunkDescriptor], limit: usize) -> impl Iterator<Item = Component> + '_ {
    chunks.iter().filter_map(move |chunk| {
        let len = bounded(chunk.offset, chunk.length, limit, "chunk")?;
        let mut component = Component::raw(ComponentKind::Chunk, chunk.offset, len);
        component.chunk_id = Some(chunk.chunk_id);
        Some(component)
    })
}

/// Build the component list for one filled buffer.
///
/// `capacity` is the size of the announced buffer; nothing past
/// `min(size_filled, capacity)` is ever exposed.
#[must_use]
pub fn parse_components(
    desc: &BufferDescriptor,
    parts: &[PartDescriptor],
    chunks: &[ChunkDescriptor],
    capacity: usize,
) -> Vec<Component> {
    let limit = if desc.size_filled == 0 {
        capacity
    } else {
        desc.size_filled.min(capacity)
    };

    let payload_type = match desc.payload_type {
        Some(t) => t,
        // Producers that do not report a payload type: infer from what they did report.
        None if !parts.is_empty() => PayloadType::MultiPart,
        None if desc.width > 0 && desc.height > 0 => PayloadType::Image,
        None => PayloadType::Unknown,
    };

    match payload_type {
        PayloadType::MultiPart => parts
            .iter()
            .filter_map(|part| {
                let len = bounded(part.offset, part.data_size, limit, "part")?;
                Some(Component {
                    kind: ComponentKind::from_part_data_type(part.data_type),
                    offset: part.offset,
                    len,
                    width: part.width,
                    height: part.height,
                    x_offset: part.x_offset,
                    y_offset: part.y_offset,
                    x_padding: part.x_padding,
                    pixel_format: Some(part.data_format),
                    source_id: Some(part.source_id),
                    chunk_id: None,
                })
            })
            .collect(),
        PayloadType::Image | PayloadType::ChunkData => {
            let has_chunks = !chunks.is_empty();
            let mut components: Vec<Component> =
                image_component(desc, limit, has_chunks).into_iter().collect();
            components.extend(chunk_components(chunks, limit));
            components
        }
        PayloadType::ChunkOnly => chunk_components(chunks, limit).collect(),
        _ => bounded(0, limit, limit, "raw")
            .map(|len| vec![Component::raw(ComponentKind::Raw, 0, len)])
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono8(width: usize, height: usize) -> BufferDescriptor {
        BufferDescriptor {
            payload_type: Some(PayloadType::Image),
            pixel_format: PixelFormat::MONO8,
            width,
            height,
            size_filled: width * height,
            ..Default::default()
        }
    }

    #[test]
    fn test_pixel_format_bits() {
        assert_eq!(PixelFormat::MONO8.bits_per_pixel(), 8);
        assert_eq!(PixelFormat::MONO12.bits_per_pixel(), 16);
        assert_eq!(PixelFormat::RGB8.bits_per_pixel(), 24);
        assert_eq!(format!("{:?}", PixelFormat(0x1234)), "PixelFormat(0x00001234)");
    }

    #[test]
    fn test_payload_type_roundtrip_codes() {
        for raw in 0..=10u64 {
            assert_eq!(PayloadType::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(PayloadType::from_raw(999), PayloadType::Unknown);
    }

    #[test]
    fn test_single_image() {
        let components = parse_components(&mono8(4, 2), &[], &[], 64);
        assert_eq!(components.len(), 1);
        let image = &components[0];
        assert_eq!(image.kind, ComponentKind::Intensity);
        assert_eq!((image.offset, image.len), (0, 8));
        assert_eq!(image.stride(), Some(4));
    }

    #[test]
    fn test_image_with_chunks() {
        let mut desc = mono8(4, 2);
        desc.payload_type = Some(PayloadType::ChunkData);
        desc.size_filled = 8 + 16;
        let chunks = [
            ChunkDescriptor { chunk_id: 0xA, offset: 8, length: 8 },
            ChunkDescriptor { chunk_id: 0xB, offset: 16, length: 8 },
        ];

        let components = parse_components(&desc, &[], &chunks, 64);
        let kinds: Vec<ComponentKind> = components.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ComponentKind::Intensity, ComponentKind::Chunk, ComponentKind::Chunk]
        );
        assert_eq!(components[0].len, 8);
        assert_eq!(components[2].chunk_id, Some(0xB));
    }

    #[test]
    fn test_multi_part() {
        let desc = BufferDescriptor {
            payload_type: Some(PayloadType::MultiPart),
            size_filled: 300,
            ..Default::default()
        };
        let parts = [
            PartDescriptor {
                offset: 0,
                data_size: 100,
                data_type: sys::PART_DATATYPE_2D_IMAGE,
                data_format: PixelFormat::MONO8,
                width: 10,
                height: 10,
                ..Default::default()
            },
            PartDescriptor {
                offset: 100,
                data_size: 100,
                data_type: sys::PART_DATATYPE_3D_IMAGE,
                ..Default::default()
            },
            PartDescriptor {
                offset: 200,
                data_size: 100,
                data_type: sys::PART_DATATYPE_CONFIDENCE_MAP,
                source_id: 3,
                ..Default::default()
            },
        ];

        let components = parse_components(&desc, &parts, &[], 512);
        let kinds: Vec<ComponentKind> = components.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ComponentKind::Intensity, ComponentKind::Range, ComponentKind::Confidence]
        );
        assert_eq!(components[2].source_id, Some(3));
    }

    #[test]
    fn test_overrunning_part_is_clamped_and_out_of_range_part_skipped() {
        let desc = BufferDescriptor {
            payload_type: Some(PayloadType::MultiPart),
            size_filled: 150,
            ..Default::default()
        };
        let parts = [
            PartDescriptor { offset: 100, data_size: 100, data_type: sys::PART_DATATYPE_2D_IMAGE, ..Default::default() },
            PartDescriptor { offset: 400, data_size: 10, data_type: sys::PART_DATATYPE_2D_IMAGE, ..Default::default() },
        ];

        let components = parse_components(&desc, &parts, &[], 512);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len, 50);
    }

    #[test]
    fn test_size_filled_never_exceeds_capacity() {
        let mut desc = mono8(16, 16);
        desc.size_filled = 1024;
        let components = parse_components(&desc, &[], &[], 100);
        assert_eq!(components[0].len, 100);
    }

    #[test]
    fn test_chunk_only_and_raw() {
        let desc = BufferDescriptor {
            payload_type: Some(PayloadType::ChunkOnly),
            size_filled: 32,
            ..Default::default()
        };
        let chunks = [ChunkDescriptor { chunk_id: 1, offset: 0, length: 32 }];
        let components = parse_components(&desc, &[], &chunks, 32);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].kind, ComponentKind::Chunk);

        let raw = BufferDescriptor {
            payload_type: Some(PayloadType::Jpeg),
            size_filled: 10,
            ..Default::default()
        };
        let components = parse_components(&raw, &[], &[], 32);
        assert_eq!(components[0].kind, ComponentKind::Raw);
        assert_eq!(components[0].len, 10);
    }

    #[test]
    fn test_unreported_payload_type_is_inferred() {
        let mut desc = mono8(2, 2);
        desc.payload_type = None;
        let components = parse_components(&desc, &[], &[], 4);
        assert_eq!(components[0].kind, ComponentKind::Intensity);
    }
}
