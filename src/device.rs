use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Selects one device out of the host's enumerated device list, either by
/// name (e.g. "mlx4_0") or by position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Index into the enumerated device list.
    Index(usize),
    /// Device name as reported by the driver.
    Name(String),
}

impl Default for DeviceSelector {
    fn default() -> Self {
        DeviceSelector::Index(0)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Index(index) => write!(f, "index {index}"),
            DeviceSelector::Name(name) => write!(f, "\"{name}\""),
        }
    }
}

impl From<&str> for DeviceSelector {
    fn from(name: &str) -> Self {
        DeviceSelector::Name(name.to_string())
    }
}

impl From<String> for DeviceSelector {
    fn from(name: String) -> Self {
        DeviceSelector::Name(name)
    }
}

impl From<usize> for DeviceSelector {
    fn from(index: usize) -> Self {
        DeviceSelector::Index(index)
    }
}

/// One entry of the host's device enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
}

/// State of a physical device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
    Unknown,
}

impl PortState {
    /// Whether the port can carry traffic.
    pub fn is_active(self) -> bool {
        matches!(self, PortState::Active | PortState::ActiveDefer)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Nop => write!(f, "NOP"),
            PortState::Down => write!(f, "DOWN"),
            PortState::Init => write!(f, "INIT"),
            PortState::Armed => write!(f, "ARMED"),
            PortState::Active => write!(f, "ACTIVE"),
            PortState::ActiveDefer => write!(f, "ACTIVE_DEFER"),
            PortState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Snapshot of the host's RDMA device inventory.
pub struct DeviceList {
    devices: Vec<DeviceInfo>,
}

impl DeviceList {
    /// Enumerate the devices currently visible on this host.
    ///
    /// Every device found is logged as a diagnostic side channel, whether
    /// or not it ends up selected. An enumeration that cannot be obtained
    /// at all is reported the same way as an empty one.
    pub fn available() -> Result<Self> {
        let devices = crate::backend::list_devices().map_err(|_| Error::NoDevicesPresent)?;
        debug!(count = devices.len(), "enumerated RDMA devices");
        for dev in &devices {
            debug!(index = dev.index, name = %dev.name, "found RDMA device");
        }
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter()
    }

    /// Pick the device matching `selector`.
    ///
    /// # Errors
    ///
    /// `NoDevicesPresent` when the enumeration is empty, `DeviceNotFound`
    /// when no entry matches the selector.
    pub fn resolve(&self, selector: &DeviceSelector) -> Result<&DeviceInfo> {
        if self.devices.is_empty() {
            return Err(Error::NoDevicesPresent);
        }
        let found = match selector {
            DeviceSelector::Index(index) => self.devices.get(*index),
            DeviceSelector::Name(name) => self.devices.iter().find(|dev| dev.name == *name),
        };
        found.ok_or_else(|| Error::DeviceNotFound {
            selector: selector.to_string(),
            available: self.devices.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_list() -> DeviceList {
        DeviceList {
            devices: vec![
                DeviceInfo {
                    index: 0,
                    name: "mlx4_0".to_string(),
                },
                DeviceInfo {
                    index: 1,
                    name: "mlx4_1".to_string(),
                },
            ],
        }
    }

    #[test]
    fn resolve_by_index() {
        let list = sample_list();
        let dev = list.resolve(&DeviceSelector::Index(1)).unwrap();
        assert_eq!(dev.name, "mlx4_1");
    }

    #[test]
    fn resolve_by_name() {
        let list = sample_list();
        let dev = list.resolve(&"mlx4_0".into()).unwrap();
        assert_eq!(dev.index, 0);
    }

    #[test]
    fn empty_enumeration_is_no_devices_present() {
        let list = DeviceList { devices: vec![] };
        assert!(matches!(
            list.resolve(&DeviceSelector::default()),
            Err(Error::NoDevicesPresent)
        ));
    }

    #[test]
    fn unmatched_name_reports_available_count() {
        let list = sample_list();
        match list.resolve(&"mlx5_0".into()) {
            Err(Error::DeviceNotFound {
                selector,
                available,
            }) => {
                assert!(selector.contains("mlx5_0"));
                assert_eq!(available, 2);
            }
            other => panic!("expected DeviceNotFound, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let list = sample_list();
        assert!(matches!(
            list.resolve(&DeviceSelector::Index(7)),
            Err(Error::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn port_state_activity() {
        assert!(PortState::Active.is_active());
        assert!(PortState::ActiveDefer.is_active());
        assert!(!PortState::Down.is_active());
        assert_eq!(PortState::ActiveDefer.to_string(), "ACTIVE_DEFER");
    }
}
