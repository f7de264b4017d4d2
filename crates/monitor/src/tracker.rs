//! Known-device snapshot and diffing
//!
//! The tracker owns the set of devices the monitor has already reported.
//! Reconciling a fresh listing against it yields one event per device that
//! appeared or disappeared, and updates the snapshot so the same transition
//! is never reported twice.

use common::{DeviceChangeEvent, DeviceRecord};
use std::collections::{BTreeMap, btree_map::Entry};

/// Snapshot of currently known devices, keyed by [`DeviceRecord::key`]
#[derive(Debug, Clone)]
pub struct DeviceTracker<D> {
    devices: BTreeMap<String, D>,
}

impl<D> Default for DeviceTracker<D> {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }
}

/// Index a listing by key, keeping the first record for each key
fn index_by_key<D: DeviceRecord>(devices: Vec<D>) -> BTreeMap<String, D> {
    let mut indexed = BTreeMap::new();
    for device in devices {
        if let Entry::Vacant(slot) = indexed.entry(device.key()) {
            slot.insert(device);
        }
    }
    indexed
}

impl<D: DeviceRecord> DeviceTracker<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot without reporting anything
    pub fn baseline(&mut self, devices: Vec<D>) {
        self.devices = index_by_key(devices);
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&D> {
        self.devices.get(key)
    }

    /// Known devices in key order
    pub fn devices(&self) -> Vec<D> {
        self.devices.values().cloned().collect()
    }

    /// Diff `observed` against the snapshot and adopt it
    ///
    /// Detach events (carrying the previously known record) come first, then
    /// attach events (carrying the observed record), each in key order.
    /// Devices present on both sides keep their snapshot record.
    pub fn reconcile(&mut self, observed: Vec<D>) -> Vec<DeviceChangeEvent<D>> {
        let mut observed = index_by_key(observed);
        let mut events = Vec::new();

        let gone: Vec<String> = self
            .devices
            .keys()
            .filter(|key| !observed.contains_key(*key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(device) = self.devices.remove(&key) {
                events.push(DeviceChangeEvent::detach(device));
            }
        }

        observed.retain(|key, _| !self.devices.contains_key(key));
        for (key, device) in observed {
            events.push(DeviceChangeEvent::attach(device.clone()));
            self.devices.insert(key, device);
        }

        events
    }
}
