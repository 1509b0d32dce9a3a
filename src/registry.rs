//! Per-device observation store fed by the scanner.
//!
//! One [`Observation`] per [`DeviceKey`]. Devices that stay silent longer than
//! the configured timeout are forgotten, so a tag that comes back is treated
//! as new again.

use crate::device::DeviceKey;
use crate::measurement::Measurement;
use crate::observation::Observation;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceKey, Arc<Observation>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a packet, returning the device's observation and whether this
    /// is the first packet seen from it.
    pub fn observe(&mut self, measurement: &Measurement) -> (Arc<Observation>, bool) {
        match self.devices.get(&measurement.key()) {
            Some(observation) => {
                observation.update(measurement);
                (Arc::clone(observation), false)
            }
            None => {
                let observation = Arc::new(Observation::new(measurement));
                self.devices
                    .insert(measurement.key(), Arc::clone(&observation));
                (observation, true)
            }
        }
    }

    /// Drop every device whose last packet is older than `timeout` at `now`.
    ///
    /// Returns the keys that were removed.
    pub fn expire(&mut self, now: SystemTime, timeout: Duration) -> Vec<DeviceKey> {
        let mut expired = Vec::new();
        self.devices.retain(|key, observation| {
            // A capture time in the future (clock step) counts as fresh
            let silent_for = now
                .duration_since(observation.captured_at())
                .unwrap_or_default();
            let keep = silent_for <= timeout;
            if !keep {
                expired.push(*key);
            }
            keep
        });
        expired.sort_unstable();
        expired
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
