//! Live per-device observation and its immutable record snapshot.
//!
//! An [`Observation`] is owned by the device registry and updated as packets
//! arrive. The dispatcher only borrows it for one dispatch, takes a
//! [`Record`] snapshot and reads-and-clears the movement latch.

use crate::device::{DeviceKey, MacAddress, Protocol};
use crate::measurement::{FieldValue, Measurement};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Immutable snapshot of an observation, as delivered to sinks.
///
/// Serializes to a flat JSON object: `address`, `protocol`, then one entry
/// per field in name order. NaN values serialize as `null`, integer fields
/// as JSON integers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub address: MacAddress,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub fields: BTreeMap<&'static str, FieldValue>,
}

#[derive(Debug)]
struct Readings {
    captured_at: SystemTime,
    fields: BTreeMap<&'static str, FieldValue>,
    movement_counter: Option<u32>,
}

/// Current state of one physical device.
#[derive(Debug)]
pub struct Observation {
    key: DeviceKey,
    readings: Mutex<Readings>,
    movement_detected: AtomicBool,
}

impl Observation {
    /// Create an observation from the first packet seen for a device.
    pub fn new(measurement: &Measurement) -> Self {
        Self {
            key: measurement.key(),
            readings: Mutex::new(Readings {
                captured_at: measurement.received_at,
                fields: measurement.fields().into_iter().collect(),
                movement_counter: measurement.movement_counter,
            }),
            movement_detected: AtomicBool::new(false),
        }
    }

    fn readings(&self) -> MutexGuard<'_, Readings> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// When the last packet from this device was received.
    pub fn captured_at(&self) -> SystemTime {
        self.readings().captured_at
    }

    /// Apply a newer packet from the same device.
    ///
    /// Latches the movement flag when the tag's movement counter differs from
    /// the previous packet's.
    pub fn update(&self, measurement: &Measurement) {
        debug_assert_eq!(measurement.key(), self.key);

        let mut readings = self.readings();
        readings.captured_at = measurement.received_at;
        readings.fields = measurement.fields().into_iter().collect();

        if let (Some(previous), Some(current)) =
            (readings.movement_counter, measurement.movement_counter)
            && previous != current
        {
            self.movement_detected.store(true, Ordering::SeqCst);
        }
        if measurement.movement_counter.is_some() {
            readings.movement_counter = measurement.movement_counter;
        }
    }

    /// Snapshot of the current field values plus identity.
    ///
    /// `captured_at` is never part of the record.
    pub fn as_record(&self) -> Record {
        Record {
            address: self.key.address,
            protocol: self.key.protocol,
            fields: self.readings().fields.clone(),
        }
    }

    pub fn is_movement_detected(&self) -> bool {
        self.movement_detected.load(Ordering::SeqCst)
    }

    /// Latch the movement flag.
    pub fn mark_movement(&self) {
        self.movement_detected.store(true, Ordering::SeqCst);
    }

    pub fn clear_movement(&self) {
        self.movement_detected.store(false, Ordering::SeqCst);
    }

    /// Atomically read and clear the movement flag.
    pub fn take_movement(&self) -> bool {
        self.movement_detected.swap(false, Ordering::SeqCst)
    }
}
