//! Device discovery.
//!
//! The [`DeviceInfoCache`] holds one snapshot of every device visible
//! through the loaded producers. Each refresh replaces the snapshot
//! wholesale and bumps its generation; a [`DeviceInfo`] remembers the
//! generation it came from, and selecting a device by a `DeviceInfo` from an
//! older snapshot fails instead of silently picking whatever now sits at
//! that position.

use crate::binding::{BindingId, InterfaceHandle, ProducerBinding};
use harvest_core::{DeviceQuery, DeviceSelector, HarvestError, HarvestResult, RawHandle};
use harvest_transport::{AccessStatus, DeviceDescriptor};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Immutable description of one discoverable device.
///
/// The reference to the owning producer is weak: a `DeviceInfo` never keeps
/// a producer loaded.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    descriptor: DeviceDescriptor,
    interface_id: String,
    interface: RawHandle,
    producer_id: BindingId,
    producer: Weak<ProducerBinding>,
    generation: u64,
}

impl DeviceInfo {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        binding: &Arc<ProducerBinding>,
        interface: &InterfaceHandle,
        generation: u64,
    ) -> Self {
        Self {
            descriptor,
            interface_id: interface.id.clone(),
            interface: interface.handle,
            producer_id: binding.id(),
            producer: Arc::downgrade(binding),
            generation,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.descriptor.vendor
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.descriptor.model
    }

    #[must_use]
    pub fn serial_number(&self) -> &str {
        &self.descriptor.serial_number
    }

    #[must_use]
    pub fn user_defined_name(&self) -> &str {
        &self.descriptor.user_defined_name
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.descriptor.display_name
    }

    #[must_use]
    pub fn tl_type(&self) -> &str {
        &self.descriptor.tl_type
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    #[must_use]
    pub fn access_status(&self) -> AccessStatus {
        self.descriptor.access_status
    }

    #[must_use]
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub(crate) fn interface_handle(&self) -> RawHandle {
        self.interface
    }

    #[must_use]
    pub fn producer_id(&self) -> BindingId {
        self.producer_id
    }

    /// The snapshot this entry belongs to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The owning producer, if it is still loaded.
    pub fn producer(&self) -> HarvestResult<Arc<ProducerBinding>> {
        self.producer
            .upgrade()
            .filter(|binding| binding.is_loaded())
            .ok_or_else(|| HarvestError::DeviceNotFound {
                selector: format!("'{}' (producer {} unloaded)", self.id(), self.producer_id),
            })
    }

    fn matches(&self, query: &DeviceQuery) -> bool {
        let field = |wanted: &Option<String>, actual: &str| wanted.as_deref().map_or(true, |w| w == actual);
        field(&query.id, self.id())
            && field(&query.vendor, self.vendor())
            && field(&query.model, self.model())
            && field(&query.serial_number, self.serial_number())
            && field(&query.user_defined_name, self.user_defined_name())
            && field(&query.tl_type, self.tl_type())
    }
}

impl From<&DeviceInfo> for DeviceSelector {
    fn from(info: &DeviceInfo) -> Self {
        DeviceSelector::Snapshot {
            id: info.id().to_string(),
            generation: info.generation(),
        }
    }
}

impl From<DeviceInfo> for DeviceSelector {
    fn from(info: DeviceInfo) -> Self {
        DeviceSelector::from(&info)
    }
}

#[derive(Debug)]
struct Snapshot {
    devices: Vec<DeviceInfo>,
    generation: u64,
    stale: bool,
}

/// Snapshot of discoverable devices across all loaded producers.
#[derive(Debug)]
pub struct DeviceInfoCache {
    snapshot: Mutex<Snapshot>,
}

impl Default for DeviceInfoCache {
    fn default() -> Self {
        Self {
            snapshot: Mutex::new(Snapshot {
                devices: Vec::new(),
                generation: 0,
                stale: true,
            }),
        }
    }
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerate every binding and replace the snapshot.
    ///
    /// A producer or interface that fails to enumerate is logged and left
    /// out; the others are still listed.
    pub fn refresh(&self, bindings: &[Arc<ProducerBinding>]) -> Vec<DeviceInfo> {
        let mut snapshot = self.snapshot.lock();
        let generation = snapshot.generation + 1;
        let mut devices = Vec::new();

        for binding in bindings {
            let interfaces = match binding.enumerate_interfaces() {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    warn!(binding = %binding.id(), error = %e, "Interface enumeration failed");
                    continue;
                }
            };
            for interface in &interfaces {
                match binding.enumerate_devices(interface, generation) {
                    Ok(found) => devices.extend(found),
                    Err(e) => {
                        warn!(binding = %binding.id(), interface = %interface.id, error = %e, "Device enumeration failed");
                    }
                }
            }
        }

        info!(generation, devices = devices.len(), producers = bindings.len(), "Device list updated");
        snapshot.devices = devices;
        snapshot.generation = generation;
        snapshot.stale = false;
        snapshot.devices.clone()
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.snapshot.lock().devices.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.snapshot.lock().generation
    }

    /// The producer set changed since the last refresh.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.snapshot.lock().stale
    }

    pub fn mark_stale(&self) {
        self.snapshot.lock().stale = true;
    }

    /// Drop the snapshot. Every `DeviceInfo` handed out so far becomes
    /// unusable as a selector.
    ///
    /// The generation keeps counting up across invalidations, including an
    /// engine reset. Starting over at zero would let a `DeviceInfo` from
    /// before the reset match a later snapshot with the same number.
    pub fn invalidate(&self) {
        let mut snapshot = self.snapshot.lock();
        snapshot.devices.clear();
        snapshot.generation += 1;
        snapshot.stale = true;
        debug!(generation = snapshot.generation, "Device list invalidated");
    }

    /// Pick one device of the current snapshot.
    pub fn resolve(&self, selector: &DeviceSelector) -> HarvestResult<DeviceInfo> {
        let snapshot = self.snapshot.lock();
        let devices = &snapshot.devices;
        let not_found = || HarvestError::DeviceNotFound {
            selector: selector.to_string(),
        };

        match selector {
            DeviceSelector::Index(index) => devices.get(*index).cloned().ok_or_else(not_found),
            DeviceSelector::Id(id) => unique(selector, devices, |d| d.id() == id)?.ok_or_else(not_found),
            DeviceSelector::Serial(serial) => {
                unique(selector, devices, |d| d.serial_number() == serial)?.ok_or_else(not_found)
            }
            DeviceSelector::Any(name) => {
                if let Some(found) = unique(selector, devices, |d| d.id() == name)? {
                    return Ok(found);
                }
                if let Some(found) = unique(selector, devices, |d| d.serial_number() == name)? {
                    return Ok(found);
                }
                unique(selector, devices, |d| {
                    !d.user_defined_name().is_empty() && d.user_defined_name() == name
                })?
                .ok_or_else(not_found)
            }
            DeviceSelector::Query(query) => {
                unique(selector, devices, |d| d.matches(query))?.ok_or_else(not_found)
            }
            DeviceSelector::Snapshot { id, generation } => {
                if *generation != snapshot.generation {
                    return Err(HarvestError::DeviceNotFound {
                        selector: format!(
                            "{} (current snapshot is {})",
                            selector, snapshot.generation
                        ),
                    });
                }
                unique(selector, devices, |d| d.id() == id)?.ok_or_else(not_found)
            }
        }
    }
}

/// The single device matching `predicate`, `None` if there is none.
fn unique(
    selector: &DeviceSelector,
    devices: &[DeviceInfo],
    predicate: impl Fn(&DeviceInfo) -> bool,
) -> HarvestResult<Option<DeviceInfo>> {
    let mut matching = devices.iter().filter(|d| predicate(d));
    let first = matching.next();
    let extra = matching.count();
    if extra > 0 {
        return Err(HarvestError::AmbiguousSelector {
            selector: selector.to_string(),
            matches: extra + 1,
        });
    }
    Ok(first.cloned())
}
