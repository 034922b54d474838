//! Engine configuration using Figment
//!
//! Configuration is layered:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `HARVEST_`; nested keys are
//!    separated by a double underscore, e.g. `HARVEST_ACQUIRER__NUM_BUFFERS=8`
//!
//! # Example
//! ```no_run
//! use harvest::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("harvest.toml")?;
//! config.validate()?;
//! println!("buffers per acquirer: {}", config.acquirer.num_buffers);
//! # Ok::<(), harvest::HarvestError>(())
//! ```
//!
//! ```toml
//! log_level = "debug"
//! discovery_timeout = "1s"
//!
//! [acquirer]
//! num_buffers = 8
//! queue_depth = 2
//! policy = "drop_oldest"
//! wait_timeout = "50ms"
//! access = "exclusive"
//! ```

use crate::queue::DeliveryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use harvest_core::{HarvestError, HarvestResult};
use harvest_transport::AccessMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Timeout handed to interface and device list updates
    #[serde(with = "humantime_serde")]
    pub discovery_timeout: Duration,
    /// Defaults for every acquirer created by the engine
    pub acquirer: AcquirerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            discovery_timeout: Duration::from_millis(500),
            acquirer: AcquirerConfig::default(),
        }
    }
}

/// Per-acquirer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquirerConfig {
    /// Buffers announced to the stream; raised to the stream's minimum
    pub num_buffers: usize,
    /// Payloads that may wait in the delivery queue
    pub queue_depth: usize,
    /// What the acquisition thread does when the queue is full
    pub policy: DeliveryPolicy,
    /// Upper bound of one native wait, and so of `stop()` latency
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Buffer size when the stream does not report a payload size
    pub payload_size_hint: Option<usize>,
    /// Device access requested at open
    pub access: AccessMode,
    /// Open the device as part of `create_acquirer`
    pub open_on_create: bool,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            num_buffers: 3,
            queue_depth: 1,
            policy: DeliveryPolicy::Block,
            wait_timeout: Duration::from_millis(100),
            payload_size_hint: None,
            access: AccessMode::Exclusive,
            open_on_create: true,
        }
    }
}

impl AcquirerConfig {
    /// Reject values the acquisition thread cannot work with.
    pub fn validate(&self) -> HarvestResult<()> {
        if self.num_buffers == 0 {
            return Err(HarvestError::Configuration("num_buffers must be > 0".into()));
        }
        if self.queue_depth == 0 {
            return Err(HarvestError::Configuration("queue_depth must be > 0".into()));
        }
        if self.wait_timeout.is_zero() {
            return Err(HarvestError::Configuration("wait_timeout must be > 0".into()));
        }
        if self.payload_size_hint == Some(0) {
            return Err(HarvestError::Configuration("payload_size_hint must be > 0".into()));
        }
        Ok(())
    }

    /// Queue depth after applying the policy (`newest_only` keeps one).
    #[must_use]
    pub fn effective_queue_depth(&self) -> usize {
        match self.policy {
            DeliveryPolicy::NewestOnly => 1,
            _ => self.queue_depth,
        }
    }
}

impl EngineConfig {
    /// Defaults merged with `HARVEST_` environment variables.
    pub fn load() -> HarvestResult<Self> {
        Self::extract(Self::defaults().merge(env()))
    }

    /// Defaults, then `path`, then `HARVEST_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HarvestResult<Self> {
        Self::extract(Self::defaults().merge(Toml::file(path.as_ref())).merge(env()))
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
    }

    fn extract(figment: Figment) -> HarvestResult<Self> {
        figment
            .extract()
            .map_err(|e| HarvestError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HarvestResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(HarvestError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        if self.discovery_timeout.is_zero() {
            return Err(HarvestError::Configuration("discovery_timeout must be > 0".into()));
        }
        self.acquirer.validate()
    }
}

fn env() -> Env {
    Env::prefixed("HARVEST_").split("__")
}
