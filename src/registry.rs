//! Device registry: a `device_id -> Device` map owned by the scanner.
//!
//! Many readers, one writer, per spec §5 — backed by `parking_lot::RwLock`
//! the same way the reference codebase's own discovery-adjacent code guards
//! its device tables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;

/// Thread-safe registry of all devices discovered this process.
#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, Device>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a device, keyed by `device_id`. The latest entry
    /// always wins.
    pub fn upsert(&self, device: Device) {
        self.devices.write().insert(device.device_id.clone(), device);
    }

    /// Snapshot of every device ever discovered this process.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    /// Subset of `devices()` that are power-capable.
    pub fn power_devices(&self) -> Vec<Device> {
        self.devices
            .read()
            .values()
            .filter(|d| d.is_power_capable())
            .cloned()
            .collect()
    }

    /// Current device for `device_id`, resolved fresh on every call so
    /// renames become visible immediately.
    pub fn device_by_id(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
