//! # Harvest
//!
//! An image-acquisition engine for GenTL producers. It sits between a
//! machine-vision application and one or more vendor transport modules
//! (`.cti` files) and offers one discovery and streaming API regardless of
//! vendor.
//!
//! ## Crate Structure
//!
//! - **`engine`**: the [`Engine`] root. Loads producers, lists devices,
//!   creates acquirers and resets everything.
//! - **`binding`**: one loaded producer and the handles opened through it.
//! - **`discovery`**: the device snapshot and selector resolution.
//! - **`acquirer`**: the [`ImageAcquirer`] façade and its state machine.
//! - **`acquisition`**: the per-acquirer acquisition thread.
//! - **`queue`**: the bounded delivery queue and its full-queue policies.
//! - **`payload`**: the consumer view of one delivered buffer.
//! - **`events`**, **`statistics`**, **`diagnostics`**: what consumers can
//!   observe about a running acquirer.
//! - **`config`**: `EngineConfig` loaded with figment.
//! - **`logging`**: optional tracing-subscriber setup.
//!
//! The workspace crates underneath: `harvest-core` (errors, handles,
//! selectors, component parsing), `harvest-transport` (the `Producer` trait,
//! the `.cti` loader and the simulated producer) and `harvest-pool` (the
//! buffer pool).
//!
//! ## Example
//!
//! ```no_run
//! use harvest::{Engine, EngineConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), harvest::HarvestError> {
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.add_producer("/opt/vendor/lib/producer.cti")?;
//! for device in engine.list_devices() {
//!     println!("{} ({} {})", device.id(), device.vendor(), device.model());
//! }
//!
//! let acquirer = engine.create_acquirer(0usize)?;
//! acquirer.start()?;
//! let payload = acquirer.fetch(Duration::from_secs(1))?;
//! if let Some(image) = payload.image() {
//!     println!("frame {}: {}x{}", payload.frame_id(), image.width, image.height);
//! }
//! payload.release();
//! acquirer.stop()?;
//! engine.reset();
//! # Ok(())
//! # }
//! ```

pub mod acquirer;
pub mod acquisition;
pub mod binding;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod logging;
pub mod payload;
pub mod queue;
pub mod statistics;

pub use acquirer::{AcquirerId, AcquirerState, ImageAcquirer};
pub use acquisition::WorkerState;
pub use binding::{BindingId, InterfaceHandle, ProducerBinding};
pub use config::{AcquirerConfig, EngineConfig};
pub use diagnostics::{DiagnosticEvent, DiagnosticKind};
pub use discovery::{DeviceInfo, DeviceInfoCache};
pub use engine::Engine;
pub use events::{AcquirerEvent, CallbackId};
pub use payload::Payload;
pub use queue::{DeliveryPolicy, DeliveryQueue};
pub use statistics::AcquisitionStatistics;

pub use harvest_core::{
    Component, ComponentKind, DeviceQuery, DeviceSelector, HandleKind, HarvestError,
    HarvestResult, PayloadType, PixelFormat, TeardownReport,
};
pub use harvest_transport::{AccessMode, AccessStatus, Producer, ProducerInfo};

/// The simulated producer, for tests and demos.
pub mod sim {
    pub use harvest_transport::sim::*;
}
