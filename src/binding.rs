//! Producer bindings.
//!
//! A [`ProducerBinding`] owns one loaded transport module together with the
//! [`HandleRegistry`] that tracks every handle opened through it. It is
//! either fully loaded (system module open, ready to enumerate) or fully
//! unloaded; a failed load leaves nothing behind.
//!
//! Unloading closes every handle still open under the binding in reverse
//! open order (streams and buffers before devices, devices before
//! interfaces, interfaces before the system module) and only then closes
//! the module itself.

use crate::discovery::DeviceInfo;
use harvest_core::{
    HandleKind, HandleRecord, HandleRegistry, HarvestError, HarvestResult, RawHandle,
    TeardownReport,
};
use harvest_transport::{AccessMode, CtiProducer, Producer, ProducerInfo};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_BINDING_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a binding within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

/// An open interface module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    pub id: String,
    pub handle: RawHandle,
}

#[derive(Debug, Default)]
struct BindingState {
    system: Option<RawHandle>,
    interfaces: Vec<InterfaceHandle>,
    loaded: bool,
}

/// One loaded transport module.
pub struct ProducerBinding {
    id: BindingId,
    producer: Arc<dyn Producer>,
    registry: Arc<HandleRegistry>,
    discovery_timeout: Duration,
    state: Mutex<BindingState>,
}

impl ProducerBinding {
    /// Load a `.cti` module and open its system module.
    pub fn load(path: impl AsRef<Path>, discovery_timeout: Duration) -> HarvestResult<Arc<Self>> {
        let producer = CtiProducer::load(path.as_ref())?;
        Self::from_producer(Arc::new(producer), discovery_timeout)
    }

    /// Bind an already initialised producer and open its system module.
    ///
    /// On failure the producer is closed again.
    pub fn from_producer(
        producer: Arc<dyn Producer>,
        discovery_timeout: Duration,
    ) -> HarvestResult<Arc<Self>> {
        let registry = Arc::new(HandleRegistry::new());
        let system = match registry.open(HandleKind::System, None, "system", || producer.open_system()) {
            Ok(system) => system,
            Err(e) => {
                if let Err(close) = producer.close() {
                    warn!(error = %close, "Closing producer after failed system open failed");
                }
                return Err(e);
            }
        };

        let binding = Arc::new(Self {
            id: BindingId(NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed)),
            producer,
            registry,
            discovery_timeout,
            state: Mutex::new(BindingState {
                system: Some(system),
                interfaces: Vec::new(),
                loaded: true,
            }),
        });
        info!(
            binding = %binding.id,
            producer = %binding.info().display_name,
            vendor = %binding.info().vendor,
            path = ?binding.info().path,
            "Producer loaded"
        );
        Ok(binding)
    }

    #[must_use]
    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Identity read from the module at load.
    #[must_use]
    pub fn info(&self) -> &ProducerInfo {
        self.producer.info()
    }

    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.producer.info().path.as_ref()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    #[must_use]
    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Interfaces opened so far.
    #[must_use]
    pub fn interfaces(&self) -> Vec<InterfaceHandle> {
        self.state.lock().interfaces.clone()
    }

    fn system(&self, operation: &'static str) -> HarvestResult<RawHandle> {
        let state = self.state.lock();
        match (state.loaded, state.system) {
            (true, Some(system)) => Ok(system),
            _ => Err(HarvestError::state(operation, "Unloaded")),
        }
    }

    /// Refresh the interface list and open every interface not yet open.
    ///
    /// Interfaces stay open until the binding unloads.
    pub fn enumerate_interfaces(&self) -> HarvestResult<Vec<InterfaceHandle>> {
        let system = self.system("enumerate_interfaces")?;
        let ids = self.producer.interface_ids(system, self.discovery_timeout)?;

        let mut state = self.state.lock();
        for id in ids {
            if state.interfaces.iter().any(|i| i.id == id) {
                continue;
            }
            let handle = self.registry.open(HandleKind::Interface, Some(system), id.as_str(), || {
                self.producer.open_interface(system, &id)
            })?;
            debug!(binding = %self.id, interface = %id, %handle, "Interface opened");
            state.interfaces.push(InterfaceHandle { id, handle });
        }
        Ok(state.interfaces.clone())
    }

    /// Refresh and describe the devices visible on one interface.
    pub fn enumerate_devices(
        self: &Arc<Self>,
        interface: &InterfaceHandle,
        generation: u64,
    ) -> HarvestResult<Vec<DeviceInfo>> {
        if !self.is_loaded() {
            return Err(HarvestError::state("enumerate_devices", "Unloaded"));
        }
        let ids = self.producer.device_ids(interface.handle, self.discovery_timeout)?;
        ids.iter()
            .map(|id| {
                let descriptor = self.producer.device_descriptor(interface.handle, id)?;
                Ok(DeviceInfo::new(descriptor, self, interface, generation))
            })
            .collect()
    }

    /// Open a device on one of this binding's interfaces.
    pub fn open_device(
        &self,
        interface: RawHandle,
        device_id: &str,
        access: AccessMode,
    ) -> HarvestResult<RawHandle> {
        if !self.is_loaded() {
            return Err(HarvestError::state("open_device", "Unloaded"));
        }
        self.registry.open(HandleKind::Device, Some(interface), device_id, || {
            self.producer.open_device(interface, device_id, access)
        })
    }

    /// Open the first data stream of an open device.
    pub fn open_stream(&self, device: RawHandle) -> HarvestResult<RawHandle> {
        self.registry.open(HandleKind::DataStream, Some(device), "stream 0", || {
            self.producer.open_stream(device)
        })
    }

    /// Close any handle opened under this binding with the matching native call.
    pub fn close_handle(&self, handle: RawHandle) -> HarvestResult<()> {
        self.registry.close(handle, |record| self.close_native(record))
    }

    fn close_native(&self, record: &HandleRecord) -> harvest_transport::NativeResult<()> {
        let handle = record.handle;
        let parent = record.parent.unwrap_or(RawHandle::new(0));
        match record.kind {
            HandleKind::System => self.producer.close_system(handle),
            HandleKind::Interface => self.producer.close_interface(handle),
            HandleKind::Device => self.producer.close_device(handle),
            HandleKind::DataStream => self.producer.close_stream(handle),
            HandleKind::Buffer => self.producer.revoke_buffer(parent, handle),
            HandleKind::Event => self.producer.unregister_new_buffer_event(parent, handle),
        }
    }

    /// Close every handle in reverse open order, then the module. Idempotent.
    pub fn unload(&self) -> TeardownReport {
        let mut report = TeardownReport::new();
        {
            let mut state = self.state.lock();
            if !state.loaded {
                return report;
            }
            state.loaded = false;
            state.interfaces.clear();
            state.system = None;
        }

        let open = self.registry.open_in_reverse_order();
        if open.iter().any(|r| !matches!(r.kind, HandleKind::System | HandleKind::Interface)) {
            warn!(binding = %self.id, handles = open.len(), "Unloading producer with device handles still open");
        }
        for record in open {
            report.record("close handle", self.close_handle(record.handle));
        }
        report.record("GCCloseLib", self.producer.close());

        let (opened, closed) = self.registry.totals();
        info!(
            binding = %self.id,
            opened,
            closed,
            failures = report.failures().len(),
            "Producer unloaded"
        );
        report
    }
}

impl Drop for ProducerBinding {
    fn drop(&mut self) {
        if self.is_loaded() {
            let report = self.unload();
            if !report.is_clean() {
                warn!(binding = %self.id, failures = report.failures().len(), "Producer dropped with teardown failures");
            }
        }
    }
}

impl fmt::Debug for ProducerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBinding")
            .field("id", &self.id)
            .field("producer", &self.info().id)
            .field("loaded", &self.is_loaded())
            .field("open_handles", &self.registry.len())
            .finish()
    }
}
