//! BLE scanning and RuuviTag decoding.
//!
//! Scanning goes through the BlueZ daemon (`bluer` feature); decoding of the
//! manufacturer data is delegated to `ruuvi-decoders`. Both are external
//! collaborators of the fan-out pipeline: this module only turns their output
//! into [`Measurement`] values on a channel.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::device::{MacAddress, Protocol};
use crate::measurement::Measurement;
use ruuvi_decoders::{v5, v6};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error types for decoding RuuviTag data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Data format without a decoder (formats other than 5 and 6)
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Invalid or corrupted data that cannot be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Decoder library returned an error
    #[error("Decoder error: {0}")]
    DecoderError(String),
}

/// Convenience alias for decoded measurements or decode errors.
pub type MeasurementResult = Result<Measurement, DecodeError>;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Scanning support was not compiled in
    #[error("Bluetooth scanning not available (built without the 'bluer' feature)")]
    NotAvailable,
}

/// Ruuvi Innovations manufacturer ID.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

/// Channel buffer size for measurement results.
pub const MEASUREMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Decode manufacturer data from a RuuviTag into a Measurement.
///
/// # Arguments
/// * `mac` - The MAC address of the device
/// * `data` - The manufacturer-specific data bytes (without the company ID prefix)
///
/// # Unit Conversions
/// - Battery voltage: millivolts → Volts
/// - Acceleration: milli-g → g
/// - Pressure (format 6): hPa → Pa
pub fn decode_ruuvi_data(mac: MacAddress, data: &[u8]) -> MeasurementResult {
    match data.first() {
        None => Err(DecodeError::InvalidData("Empty data".into())),
        Some(5) => decode_v5(mac, data),
        Some(6) => decode_v6(mac, data),
        Some(format) => Err(DecodeError::UnsupportedFormat(format!(
            "RuuviTag data format {format} (only 5 and 6 supported)"
        ))),
    }
}

/// A measurement with only identity set, for the decoders to fill in.
fn empty_measurement(mac: MacAddress, protocol: Protocol) -> Measurement {
    Measurement {
        mac,
        protocol,
        received_at: SystemTime::now(),
        temperature: None,
        humidity: None,
        pressure: None,
        battery: None,
        tx_power: None,
        movement_counter: None,
        measurement_sequence: None,
        acceleration: None,
        pm2_5: None,
        co2: None,
        voc_index: None,
        nox_index: None,
        luminosity: None,
    }
}

fn decode_v5(mac: MacAddress, data: &[u8]) -> MeasurementResult {
    let tag = v5::decode(data).map_err(|e| {
        DecodeError::DecoderError(format!("Failed to decode RuuviTag data: {e:?}"))
    })?;

    let acceleration = match (tag.acceleration_x, tag.acceleration_y, tag.acceleration_z) {
        (Some(x), Some(y), Some(z)) => Some((
            f64::from(x) / 1000.0,
            f64::from(y) / 1000.0,
            f64::from(z) / 1000.0,
        )),
        _ => None,
    };

    Ok(Measurement {
        temperature: tag.temperature,
        humidity: tag.humidity,
        pressure: tag.pressure,
        battery: tag.battery_voltage.map(|mv| f64::from(mv) / 1000.0),
        tx_power: tag.tx_power,
        movement_counter: tag.movement_counter.map(u32::from),
        measurement_sequence: tag.measurement_sequence.map(u32::from),
        acceleration,
        ..empty_measurement(mac, Protocol::DataFormat5)
    })
}

fn decode_v6(mac: MacAddress, data: &[u8]) -> MeasurementResult {
    let tag = v6::decode(data).map_err(|e| {
        DecodeError::DecoderError(format!("Failed to decode RuuviTag data: {e:?}"))
    })?;

    Ok(Measurement {
        temperature: tag.temperature,
        humidity: tag.humidity,
        pressure: tag.pressure.map(|hpa| hpa * 100.0),
        measurement_sequence: tag.measurement_sequence.map(u32::from),
        pm2_5: tag.pm2_5,
        co2: tag.co2.map(f64::from),
        voc_index: tag.voc_index.map(f64::from),
        nox_index: tag.nox_index.map(f64::from),
        luminosity: tag.luminosity,
        ..empty_measurement(mac, Protocol::DataFormat6)
    })
}

/// Start scanning for RuuviTags.
///
/// # Arguments
/// * `verbose` - If true, decode errors are sent as Err values; otherwise they're silently dropped.
///
/// # Returns
/// A receiver for measurements (or decode errors if verbose).
pub async fn start_scan(verbose: bool) -> Result<mpsc::Receiver<MeasurementResult>, ScanError> {
    #[cfg(feature = "bluer")]
    return bluer::start_scan(verbose).await;

    #[cfg(not(feature = "bluer"))]
    {
        let _ = verbose;
        Err(ScanError::NotAvailable)
    }
}
