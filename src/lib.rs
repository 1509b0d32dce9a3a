//! `ruuvitag-fanout` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! signal handling and process exit codes. The pipeline lives here:
//! [`crate::app`] runs the daemon loop, [`crate::dispatcher`] fans each
//! observation out to the [`crate::sink`] implementations.

pub mod app;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod measurement;
pub mod observation;
pub mod registry;
pub mod scanner;
pub mod sink;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use config::{BrokerEndpoint, Config, ConfigError};
pub use device::{DeviceKey, MacAddress, Protocol};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use measurement::{FieldValue, Measurement};
pub use observation::{Observation, Record};
pub use registry::DeviceRegistry;
pub use scanner::{DecodeError, MeasurementResult, ScanError, decode_ruuvi_data};
pub use sink::influxdb::{HttpInflux, StorageSink};
pub use sink::mqtt::{MessagingSink, MqttPublisher};
pub use sink::{Sink, SinkError, WriteMeta};
