//! Decoded RuuviTag advertisement.

use crate::device::{DeviceKey, MacAddress, Protocol};
use serde::{Serialize, Serializer};
use std::time::SystemTime;

/// Value of one measurement field.
///
/// Counters and TX power are integers, everything else is a float. A value
/// the tag did not deliver is `Float(NaN)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl FieldValue {
    pub const NAN: FieldValue = FieldValue::Float(f64::NAN);

    pub fn is_nan(&self) -> bool {
        matches!(self, FieldValue::Float(value) if value.is_nan())
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Float(value) => value,
            FieldValue::Integer(value) => value as f64,
        }
    }
}

impl PartialEq<f64> for FieldValue {
    fn eq(&self, other: &f64) -> bool {
        self.as_f64() == *other
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            // serde_json writes non-finite floats as null
            FieldValue::Float(value) => serializer.serialize_f64(value),
            FieldValue::Integer(value) => serializer.serialize_i64(value),
        }
    }
}

/// One decoded advertisement from a RuuviTag sensor.
///
/// Values are in the units the decoder reports:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in Pascals
/// - Battery voltage in Volts
/// - TX power in dBm
/// - Acceleration in g
/// - PM2.5 in ug/m3, CO2 in ppm, luminosity in lux
///
/// `None` means the tag flagged the value as unavailable in this packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub mac: MacAddress,
    pub protocol: Protocol,
    /// When the host received the packet
    pub received_at: SystemTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub battery: Option<f64>,
    pub tx_power: Option<i8>,
    pub movement_counter: Option<u32>,
    pub measurement_sequence: Option<u32>,
    pub acceleration: Option<(f64, f64, f64)>,
    pub pm2_5: Option<f64>,
    pub co2: Option<f64>,
    pub voc_index: Option<f64>,
    pub nox_index: Option<f64>,
    pub luminosity: Option<f64>,
}

impl Measurement {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            address: self.mac,
            protocol: self.protocol,
        }
    }

    /// Named field values for this packet's data format.
    ///
    /// Every field the format defines is present; values the tag did not
    /// deliver are NaN.
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        fn float(value: Option<f64>) -> FieldValue {
            value.map_or(FieldValue::NAN, FieldValue::Float)
        }

        fn integer<T: Into<i64>>(value: Option<T>) -> FieldValue {
            value.map_or(FieldValue::NAN, |v| FieldValue::Integer(v.into()))
        }

        let mut fields = vec![
            ("temperature", float(self.temperature)),
            ("humidity", float(self.humidity)),
            ("pressure", float(self.pressure)),
            ("measurement_sequence", integer(self.measurement_sequence)),
        ];

        match self.protocol {
            Protocol::DataFormat5 => {
                let (x, y, z) = match self.acceleration {
                    Some((x, y, z)) => (Some(x), Some(y), Some(z)),
                    None => (None, None, None),
                };
                fields.extend([
                    ("battery", float(self.battery)),
                    ("tx_power", integer(self.tx_power)),
                    ("movement_counter", integer(self.movement_counter)),
                    ("acceleration_x", float(x)),
                    ("acceleration_y", float(y)),
                    ("acceleration_z", float(z)),
                ]);
            }
            Protocol::DataFormat6 => {
                fields.extend([
                    ("pm2_5", float(self.pm2_5)),
                    ("co2", float(self.co2)),
                    ("voc_index", float(self.voc_index)),
                    ("nox_index", float(self.nox_index)),
                    ("luminosity", float(self.luminosity)),
                ]);
            }
        }

        fields
    }
}
