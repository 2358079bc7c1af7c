//! # Device Records
//!
//! A device is an immutable description of one usable network resource,
//! produced at `init` time when a transport claims a configuration profile
//! (or contributes its built-in default) and destroyed at `finalize`.
//! Applications pick a device, or let the registry pick for them, when
//! creating an endpoint.

use crate::config::DeviceProfile;

/// PCI location of the underlying hardware, when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub dev: u32,
    pub func: u32,
}

/// Immutable device description.
#[derive(Debug, Clone)]
pub struct Device {
    /// Configuration section name, or the transport's own name for a
    /// built-in default device.
    pub name: String,
    /// Transport that owns this device.
    pub transport: String,
    /// Ordering priority, 0..=100, higher first.
    pub priority: u8,
    /// Whether the device is usable right now.
    pub up: bool,
    /// Marked `default = 1` in the configuration.
    pub is_default: bool,
    /// Opaque transport parameters, verbatim from the configuration.
    pub params: Vec<(String, String)>,
    /// Largest message accepted by `send` on this device's endpoints.
    pub max_send_size: u32,
    /// Nominal link rate in bits per second; 0 when unknown.
    pub rate: u64,
    /// PCI location; `None` when the transport cannot tell.
    pub pci: Option<PciAddress>,
}

impl Device {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn from_profile(profile: &DeviceProfile, max_send_size: u32, up: bool) -> Device {
        Device {
            name: profile.name.clone(),
            transport: profile.transport.clone(),
            priority: profile.priority,
            up,
            is_default: profile.is_default,
            params: profile.params.clone(),
            max_send_size,
            rate: 0,
            pci: None,
        }
    }
}

/// Order devices by descending priority, stable within equal priority.
pub(crate) fn order_devices(devices: &mut [Device]) {
    devices.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Device used by `create_endpoint(None, ..)`: the one marked default, else
/// the highest-priority device that is up.
pub(crate) fn pick_default(devices: &[Device]) -> Option<&Device> {
    devices
        .iter()
        .find(|d| d.is_default && d.up)
        .or_else(|| devices.iter().find(|d| d.up))
}
