//! DeviceRegistry - canonical set of known devices
//!
//! One entry per serial, kept in first-seen order. Entries are never removed:
//! a device that disconnects is marked offline and keeps its detail cache.
//!
//! Structural changes (insert) take the registry-wide lock. Field changes go
//! through the per-device [`DeviceHandle`] and do not block the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use devmgr_core::prelude::*;
use devmgr_core::Device;

/// Shared, individually locked device entry
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    serial: Arc<str>,
    device: Arc<RwLock<Device>>,
}

impl DeviceHandle {
    fn new(device: Device) -> Self {
        Self {
            serial: Arc::from(device.serial()),
            device: Arc::new(RwLock::new(device)),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> Device {
        match self.device.read() {
            Ok(device) => device.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mutate in place and return the resulting state
    pub fn update(&self, f: impl FnOnce(&mut Device)) -> Device {
        let mut device = match self.device.write() {
            Ok(device) => device,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut device);
        device.clone()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    index: HashMap<String, usize>,
    entries: Vec<DeviceHandle>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Existing entry for `serial`, or a freshly inserted one.
    ///
    /// The flag is `true` when the entry was created by this call.
    pub fn upsert(&self, serial: &str) -> (DeviceHandle, bool) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(serial) {
            return (inner.entries[pos].clone(), false);
        }

        trace!("Registry: adding {}", serial);
        let handle = DeviceHandle::new(Device::new(serial));
        let pos = inner.entries.len();
        inner.entries.push(handle.clone());
        inner.index.insert(serial.to_string(), pos);
        (handle, true)
    }

    pub fn find(&self, serial: &str) -> Option<DeviceHandle> {
        let inner = self.lock();
        inner.index.get(serial).map(|&pos| inner.entries[pos].clone())
    }

    /// Snapshot of one device
    pub fn get(&self, serial: &str) -> Option<Device> {
        self.find(serial).map(|handle| handle.snapshot())
    }

    /// Apply `f` to the device and return its new state
    pub fn update(&self, serial: &str, f: impl FnOnce(&mut Device)) -> Option<Device> {
        self.find(serial).map(|handle| handle.update(f))
    }

    /// Mark a device offline. The entry is retained.
    pub fn mark_offline(&self, serial: &str) -> Option<Device> {
        self.update(serial, |device| {
            device.is_online = false;
            device.touch();
        })
    }

    pub fn mark_online(&self, serial: &str) -> Option<Device> {
        self.update(serial, |device| {
            device.is_online = true;
            device.touch();
        })
    }

    /// Clear `has_fetched_details` so the next discovery pass fetches again
    pub fn reset_details(&self, serial: &str) -> bool {
        self.update(serial, |device| device.has_fetched_details = false)
            .is_some()
    }

    /// Copy-on-read view of every device, in first-seen order
    pub fn all(&self) -> Vec<Device> {
        let handles = self.lock().entries.clone();
        handles.iter().map(DeviceHandle::snapshot).collect()
    }

    pub fn serials(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|h| h.serial().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
