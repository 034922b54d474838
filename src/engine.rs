//! Engine root.
//!
//! An [`Engine`] is an explicit, instantiable registry of loaded producers
//! and live acquirers. Several engines can coexist in one process (tests
//! create one each); nothing here is global.
//!
//! `reset()` returns the engine to the state of a freshly constructed one:
//! every live acquirer is destroyed first, then every producer is unloaded
//! in reverse load order, then the device snapshot is dropped.

use crate::acquirer::{AcquirerSet, ImageAcquirer};
use crate::binding::ProducerBinding;
use crate::config::{AcquirerConfig, EngineConfig};
use crate::discovery::{DeviceInfo, DeviceInfoCache};
use harvest_core::{DeviceSelector, HarvestError, HarvestResult, TeardownReport};
use harvest_transport::Producer;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Loaded producers, the device snapshot and the live acquirers.
///
/// Dropping the engine resets it.
pub struct Engine {
    config: EngineConfig,
    bindings: Mutex<Vec<Arc<ProducerBinding>>>,
    cache: DeviceInfoCache,
    acquirers: Arc<AcquirerSet>,
}

impl Engine {
    /// Create an engine with a validated configuration.
    pub fn new(config: EngineConfig) -> HarvestResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            bindings: Mutex::new(Vec::new()),
            cache: DeviceInfoCache::new(),
            acquirers: Arc::new(AcquirerSet::default()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load a producer module.
    ///
    /// A path that is already loaded returns the existing binding.
    pub fn add_producer(&self, path: impl AsRef<Path>) -> HarvestResult<Arc<ProducerBinding>> {
        let path = path.as_ref();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.iter().find(|b| {
            b.path()
                .is_some_and(|p| p.canonicalize().unwrap_or_else(|_| p.clone()) == canonical)
        }) {
            info!(path = %canonical.display(), binding = %existing.id(), "Producer already loaded");
            return Ok(existing.clone());
        }

        let binding = ProducerBinding::load(&canonical, self.config.discovery_timeout)?;
        bindings.push(binding.clone());
        self.cache.mark_stale();
        Ok(binding)
    }

    /// Bind a producer that is already initialised, e.g. a simulated one.
    pub fn add_producer_instance(
        &self,
        producer: Arc<dyn Producer>,
    ) -> HarvestResult<Arc<ProducerBinding>> {
        let binding = ProducerBinding::from_producer(producer, self.config.discovery_timeout)?;
        self.bindings.lock().push(binding.clone());
        self.cache.mark_stale();
        Ok(binding)
    }

    /// Destroy the producer's acquirers, then unload it.
    pub fn remove_producer(&self, binding: &Arc<ProducerBinding>) -> HarvestResult<TeardownReport> {
        let removed = {
            let mut bindings = self.bindings.lock();
            let Some(position) = bindings.iter().position(|b| b.id() == binding.id()) else {
                return Err(HarvestError::state("remove_producer", "not loaded by this engine"));
            };
            bindings.remove(position)
        };

        let mut report = TeardownReport::new();
        for acquirer in self.acquirers.snapshot() {
            if acquirer.producer().id() == removed.id() {
                report.merge(acquirer.destroy());
            }
        }
        report.merge(removed.unload());
        self.cache.invalidate();
        Ok(report)
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<ProducerBinding>> {
        self.bindings.lock().clone()
    }

    /// Re-enumerate every producer now.
    pub fn update_device_info_list(&self) -> Vec<DeviceInfo> {
        let bindings = self.producers();
        self.cache.refresh(&bindings)
    }

    /// Current device snapshot, refreshed first if the producer set changed.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        if self.cache.is_stale() {
            return self.update_device_info_list();
        }
        self.cache.devices()
    }

    /// Generation of the current device snapshot. Only ever increases.
    #[must_use]
    pub fn device_generation(&self) -> u64 {
        self.cache.generation()
    }

    /// Create an acquirer with the engine's default acquirer settings.
    pub fn create_acquirer(
        &self,
        selector: impl Into<DeviceSelector>,
    ) -> HarvestResult<Arc<ImageAcquirer>> {
        self.create_acquirer_with(selector, self.config.acquirer.clone())
    }

    /// Create an acquirer for the device `selector` resolves to.
    ///
    /// On failure nothing is added to the engine.
    pub fn create_acquirer_with(
        &self,
        selector: impl Into<DeviceSelector>,
        config: AcquirerConfig,
    ) -> HarvestResult<Arc<ImageAcquirer>> {
        let selector = selector.into();
        if self.cache.is_stale() {
            self.update_device_info_list();
        }
        let device = self.cache.resolve(&selector)?;
        let binding = device.producer()?;
        let open_on_create = config.open_on_create;

        let acquirer = Arc::new(ImageAcquirer::new(
            device,
            binding,
            config,
            Arc::downgrade(&self.acquirers),
        )?);
        if open_on_create {
            acquirer.open()?;
        }
        self.acquirers.insert(&acquirer);
        info!(acquirer = %acquirer.id(), device = %acquirer.device_info().id(), %selector, "Acquirer created");
        Ok(acquirer)
    }

    /// Live acquirers, oldest first.
    #[must_use]
    pub fn acquirers(&self) -> Vec<Arc<ImageAcquirer>> {
        self.acquirers.snapshot()
    }

    #[must_use]
    pub fn acquirer_count(&self) -> usize {
        self.acquirers.len()
    }

    /// Destroy every acquirer, unload every producer and drop the device
    /// snapshot. Idempotent.
    ///
    /// The snapshot generation is not rewound, so a `DeviceInfo` obtained
    /// before the reset never selects a device afterwards.
    pub fn reset(&self) -> TeardownReport {
        let mut report = TeardownReport::new();

        let acquirers = self.acquirers.snapshot();
        for acquirer in &acquirers {
            report.merge(acquirer.destroy());
        }

        let bindings: Vec<Arc<ProducerBinding>> = std::mem::take(&mut *self.bindings.lock());
        for binding in bindings.iter().rev() {
            report.merge(binding.unload());
        }
        self.cache.invalidate();

        if report.is_clean() {
            info!(acquirers = acquirers.len(), producers = bindings.len(), "Engine reset");
        } else {
            warn!(
                acquirers = acquirers.len(),
                producers = bindings.len(),
                failures = report.failures().len(),
                "Engine reset with teardown failures"
            );
        }
        report
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            bindings: Mutex::new(Vec::new()),
            cache: DeviceInfoCache::new(),
            acquirers: Arc::new(AcquirerSet::default()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let report = self.reset();
        if !report.is_clean() {
            warn!(failures = report.failures().len(), "Engine dropped with teardown failures");
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("producers", &self.bindings.lock().len())
            .field("acquirers", &self.acquirers.len())
            .field("device_generation", &self.cache.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_transport::{SimConfig, SimProducer};
    use std::io::Write;

    #[test]
    fn test_add_producer_rejects_missing_and_invalid_files() {
        let engine = Engine::default();
        assert!(matches!(
            engine.add_producer("/nonexistent/producer.cti"),
            Err(HarvestError::ProducerLoad { .. })
        ));

        let mut file = tempfile::Builder::new().suffix(".cti").tempfile().unwrap();
        file.write_all(b"not a shared library").unwrap();
        assert!(matches!(
            engine.add_producer(file.path()),
            Err(HarvestError::ProducerLoad { .. })
        ));
        assert!(engine.producers().is_empty());
    }

    #[test]
    fn test_list_devices_refreshes_lazily() {
        let engine = Engine::default();
        assert!(engine.list_devices().is_empty());

        let sim = Arc::new(SimProducer::new(SimConfig::single_device("SIM-0")));
        engine.add_producer_instance(sim).unwrap();
        let devices = engine.list_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "SIM-0");
    }

    #[test]
    fn test_remove_producer_destroys_its_acquirers() {
        let engine = Engine::default();
        let sim = Arc::new(SimProducer::new(SimConfig::single_device("SIM-0")));
        let binding = engine.add_producer_instance(sim.clone()).unwrap();
        let acquirer = engine.create_acquirer("SIM-0").unwrap();
        assert_eq!(engine.acquirer_count(), 1);

        let report = engine.remove_producer(&binding).unwrap();
        assert!(report.is_clean(), "{:?}", report.failures());
        assert_eq!(acquirer.state(), crate::AcquirerState::Destroyed);
        assert_eq!(engine.acquirer_count(), 0);
        assert!(sim.is_closed());
        assert!(engine.list_devices().is_empty());
        assert!(engine.remove_producer(&binding).is_err());
    }

    #[test]
    fn test_device_info_from_before_reset_is_rejected() {
        let engine = Engine::default();
        let sim = SimConfig::single_device("SIM-0");
        engine.add_producer_instance(Arc::new(SimProducer::new(sim.clone()))).unwrap();
        let before = engine.list_devices().remove(0);
        let generation = engine.device_generation();

        assert!(engine.reset().is_clean());
        engine.add_producer_instance(Arc::new(SimProducer::new(sim))).unwrap();
        let after = engine.list_devices().remove(0);
        assert_eq!(after.id(), before.id());
        assert!(engine.device_generation() > generation + 1);

        assert!(matches!(
            engine.create_acquirer(&before),
            Err(HarvestError::DeviceNotFound { .. })
        ));
        assert!(engine.create_acquirer(&after).is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            log_level: "chatty".into(),
            ..Default::default()
        };
        assert!(matches!(Engine::new(config), Err(HarvestError::Configuration(_))));
    }
}
