//! Consumer-facing view of one delivered buffer.

use harvest_core::{BufferDescriptor, Component, ComponentKind, PayloadType, PixelFormat};
use harvest_pool::BufferLease;
use std::fmt;

/// One delivered unit of acquired data.
///
/// A payload owns its buffer until it is dropped or [`Payload::release`]d;
/// the buffer goes back to the producer only after that. If the acquirer is
/// destroyed first, the payload becomes detached: its bytes stay readable
/// and releasing it does nothing.
pub struct Payload {
    lease: BufferLease,
    descriptor: BufferDescriptor,
    payload_type: PayloadType,
    components: Vec<Component>,
}

impl Payload {
    pub(crate) fn new(
        lease: BufferLease,
        descriptor: BufferDescriptor,
        components: Vec<Component>,
    ) -> Self {
        let payload_type = descriptor.payload_type.unwrap_or_else(|| {
            if components.iter().any(|c| c.source_id.is_some()) {
                PayloadType::MultiPart
            } else if components.iter().any(|c| c.kind == ComponentKind::Intensity) {
                PayloadType::Image
            } else {
                PayloadType::Unknown
            }
        });
        Self {
            lease,
            descriptor,
            payload_type,
            components,
        }
    }

    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.descriptor.frame_id
    }

    /// Device timestamp in ticks.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.descriptor.timestamp
    }

    #[must_use]
    pub fn timestamp_ns(&self) -> Option<u64> {
        self.descriptor.timestamp_ns
    }

    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// The producer did not fill the whole buffer.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.descriptor.is_incomplete
    }

    #[must_use]
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// First intensity component, if any.
    #[must_use]
    pub fn image(&self) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.kind == ComponentKind::Intensity)
    }

    #[must_use]
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.image().and_then(|c| c.pixel_format)
    }

    /// Bytes of one component. Components are bounds-checked at parse time;
    /// anything else yields an empty slice.
    #[must_use]
    pub fn data(&self, component: &Component) -> &[u8] {
        let bytes = self.lease.bytes();
        component
            .offset
            .checked_add(component.len)
            .and_then(|end| bytes.get(component.offset..end))
            .unwrap_or(&[])
    }

    /// The filled part of the buffer.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        let bytes = self.lease.bytes();
        match self.descriptor.size_filled {
            0 => bytes,
            filled => &bytes[..filled.min(bytes.len())],
        }
    }

    /// Index of the underlying buffer in its pool.
    #[must_use]
    pub fn buffer_index(&self) -> usize {
        self.lease.index()
    }

    /// The acquirer was destroyed while this payload was held.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.lease.is_detached()
    }

    /// Hand the buffer back now instead of at drop.
    pub fn release(self) {
        self.lease.release();
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("frame_id", &self.descriptor.frame_id)
            .field("payload_type", &self.payload_type)
            .field("components", &self.components.len())
            .field("buffer", &self.lease.index())
            .finish()
    }
}
