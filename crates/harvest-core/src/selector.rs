//! Device selectors.
//!
//! A selector names a device in the engine's current device snapshot.
//! Positional indices are only meaningful against the snapshot they were read
//! from; the engine does not keep indices stable across refreshes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Field-wise device query. Every `Some` field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQuery {
    pub id: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub user_defined_name: Option<String>,
    pub tl_type: Option<String>,
}

impl DeviceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn user_defined_name(mut self, name: impl Into<String>) -> Self {
        self.user_defined_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.vendor.is_none()
            && self.model.is_none()
            && self.serial_number.is_none()
            && self.user_defined_name.is_none()
            && self.tl_type.is_none()
    }
}

/// How a caller picks a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Position in the current snapshot.
    Index(usize),
    /// Exact device identifier.
    Id(String),
    /// Exact serial number.
    Serial(String),
    /// Identifier, serial number or user-defined name, in that order.
    Any(String),
    /// Every populated field must match.
    Query(DeviceQuery),
    /// A device previously returned by `list_devices()`; `generation` is the
    /// snapshot it came from and must still be current.
    Snapshot { id: String, generation: u64 },
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Index(i) => write!(f, "index {}", i),
            DeviceSelector::Id(id) => write!(f, "id '{}'", id),
            DeviceSelector::Serial(s) => write!(f, "serial '{}'", s),
            DeviceSelector::Any(s) => write!(f, "'{}'", s),
            DeviceSelector::Query(q) => write!(f, "{:?}", q),
            DeviceSelector::Snapshot { id, generation } => {
                write!(f, "'{}' from snapshot {}", id, generation)
            }
        }
    }
}

impl From<usize> for DeviceSelector {
    fn from(index: usize) -> Self {
        DeviceSelector::Index(index)
    }
}

impl From<&str> for DeviceSelector {
    fn from(value: &str) -> Self {
        DeviceSelector::Any(value.to_string())
    }
}

impl From<String> for DeviceSelector {
    fn from(value: String) -> Self {
        DeviceSelector::Any(value)
    }
}

impl From<DeviceQuery> for DeviceSelector {
    fn from(query: DeviceQuery) -> Self {
        DeviceSelector::Query(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(DeviceSelector::from(2), DeviceSelector::Index(2));
        assert_eq!(
            DeviceSelector::from("SIM-0"),
            DeviceSelector::Any("SIM-0".into())
        );
        let q = DeviceQuery::new().serial_number("SN1");
        assert!(!q.is_empty());
        assert!(matches!(DeviceSelector::from(q), DeviceSelector::Query(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceSelector::Index(0).to_string(), "index 0");
        assert_eq!(DeviceSelector::Serial("X".into()).to_string(), "serial 'X'");
    }
}
