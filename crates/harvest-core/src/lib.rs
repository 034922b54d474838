//! Core types shared by every harvest crate.
//!
//! - [`error`]: the engine's error taxonomy and teardown reporting
//! - [`handle`]: opaque native handles and the [`HandleRegistry`] that enforces
//!   open/close symmetry
//! - [`selector`]: the ways a caller can name a device
//! - [`component`]: the payload component model and the parser that turns
//!   producer buffer descriptors into components

pub mod component;
pub mod error;
pub mod handle;
pub mod selector;

pub use component::{
    parse_components, BufferDescriptor, ChunkDescriptor, Component, ComponentKind, PartDescriptor,
    PayloadType, PixelFormat,
};
pub use error::{HarvestError, HarvestResult, NativeCallError, TeardownReport};
pub use handle::{HandleKind, HandleRecord, HandleRegistry, RawHandle};
pub use selector::{DeviceQuery, DeviceSelector};
