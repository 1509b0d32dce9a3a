//! BlueZ D-Bus scanning backend.
//!
//! Uses the `bluer` crate to talk to the BlueZ daemon; `bluetoothd` must be
//! running.

use super::{
    DecodeError, MEASUREMENT_CHANNEL_BUFFER_SIZE, MeasurementResult, RUUVI_MANUFACTURER_ID,
    ScanError, decode_ruuvi_data,
};
use crate::device::MacAddress;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Manufacturer ID as it appears in the advertisement (little-endian).
const RUUVI_MANUFACTURER_ID_BYTES: [u8; 2] = RUUVI_MANUFACTURER_ID.to_le_bytes();

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Start a passive scan for RuuviTag advertisements.
///
/// The Bluetooth session lives in a spawned task that feeds the returned
/// channel. The task ends when the receiver is dropped.
pub async fn start_scan(verbose: bool) -> Result<mpsc::Receiver<MeasurementResult>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    info!(adapter = adapter.name(), "Bluetooth adapter powered");

    let (tx, rx) = mpsc::channel(MEASUREMENT_CHANNEL_BUFFER_SIZE);

    let pattern = Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: RUUVI_MANUFACTURER_ID_BYTES.to_vec(),
    };

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![pattern]),
            ..Default::default()
        })
        .await?;

    tokio::spawn(async move {
        // Bluetooth state must outlive the monitor stream
        let _session = session;
        let _monitor_manager = monitor_manager;

        while let Some(event) = monitor_handle.next().await {
            let MonitorEvent::DeviceFound(device_id) = event else {
                continue;
            };

            match read_device(&adapter, device_id.device).await {
                Ok(Some(result)) if result.is_ok() || verbose => {
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) if verbose => {
                    let err = DecodeError::InvalidData(e.to_string());
                    if tx.send(Err(err)).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "Failed to read device"),
            }
        }
        debug!("Bluetooth monitor stream ended");
    });

    Ok(rx)
}

/// Read and decode a discovered device's RuuviTag manufacturer data.
///
/// Returns `None` for devices without Ruuvi data.
async fn read_device(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<MeasurementResult>, ScanError> {
    let device = adapter.device(address)?;
    let mac: MacAddress = address.into();

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };

    Ok(manufacturer_data
        .get(&RUUVI_MANUFACTURER_ID)
        .map(|data| decode_ruuvi_data(mac, data)))
}
