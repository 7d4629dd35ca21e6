//! Device registry: connected devices and their display names, in registration order.

use tracing::debug;

use crate::ids::DeviceId;
use crate::protocol::DeviceInfo;

/// A connected device. Lives exactly as long as its relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Empty until the device registers a name.
    pub display_name: String,
}

impl Device {
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.display_name.clone(),
        }
    }
}

/// Process-lifetime roster. Rebuilt entirely from live connections; nothing is persisted.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device for a newly opened connection. Re-registering a live id is a no-op.
    pub fn register(&mut self, id: DeviceId) -> &Device {
        let pos = match self.position(&id) {
            Some(pos) => pos,
            None => {
                self.devices.push(Device {
                    id,
                    display_name: String::new(),
                });
                debug!(device = %id, "device registered");
                self.devices.len() - 1
            }
        };
        &self.devices[pos]
    }

    /// Set a device's display name. Returns false if the device is not registered.
    pub fn rename(&mut self, id: DeviceId, name: &str) -> bool {
        match self.devices.iter_mut().find(|d| d.id == id) {
            Some(device) => {
                if device.display_name != name {
                    debug!(device = %id, name, "device renamed");
                    device.display_name = name.to_string();
                }
                true
            }
            None => false,
        }
    }

    /// Remove a device. Returns the removed entry, if any.
    pub fn unregister(&mut self, id: DeviceId) -> Option<Device> {
        let pos = self.position(&id)?;
        debug!(device = %id, "device unregistered");
        Some(self.devices.remove(pos))
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == *id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.position(id).is_some()
    }

    pub fn display_name(&self, id: &DeviceId) -> Option<&str> {
        self.get(id).map(|d| d.display_name.as_str())
    }

    /// Devices in registration order, excluding `viewer` if given.
    pub fn list(&self, viewer: Option<DeviceId>) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| Some(d.id) != viewer)
            .cloned()
            .collect()
    }

    /// Full roster as broadcast on the wire.
    pub fn roster(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(Device::info).collect()
    }

    /// Every registered id, for broadcasting.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().map(|d| d.id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn position(&self, id: &DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| d.id == *id)
    }
}
