//! Authoritative map of known devices keyed by device path.

use crate::device::{Device, DeviceSummary, EnforcementState};
use chrono::Utc;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `device.path()`, returning the old one.
    pub fn upsert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.path().to_string(), device)
    }

    pub fn get(&self, path: &str) -> Option<&Device> {
        self.devices.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Device> {
        self.devices.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.devices.contains_key(path)
    }

    /// Removed devices are deleted outright.
    pub fn remove(&mut self, path: &str) -> Option<Device> {
        self.devices.remove(path)
    }

    /// Change the state of a known device, returning the previous state.
    pub fn set_state(&mut self, path: &str, state: EnforcementState) -> Option<EnforcementState> {
        self.devices.get_mut(path).map(|device| {
            let previous = device.state;
            device.state = state;
            device.last_seen = Utc::now();
            previous
        })
    }

    pub fn state_of(&self, path: &str) -> Option<EnforcementState> {
        self.devices.get(path).map(|device| device.state)
    }

    /// Summaries ordered by path.
    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.devices.values().map(Device::summary).collect()
    }

    /// Paths whose parent disk is `disk`.
    pub fn children_of(&self, disk: &str) -> Vec<String> {
        self.devices
            .values()
            .filter(|device| device.props.parent.as_deref() == Some(disk))
            .map(|device| device.path().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
