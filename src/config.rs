//! Process configuration.
//!
//! [`crate::app::Options`] is parsed from the command line and environment,
//! then validated once into an immutable [`Config`] that is handed to the
//! sink constructors.

use crate::app::Options;
use std::time::Duration;
use thiserror::Error;

/// InfluxDB database that holds all measurements.
pub const DATABASE_NAME: &str = "homeautomation";

/// InfluxDB measurement every point is written under.
pub const MEASUREMENT_NAME: &str = "device";

/// InfluxDB is reached over HTTPS on the standard port.
pub const STORAGE_PORT: u16 = 443;

/// Device type segment of the MQTT topic.
pub const DEVICE_TYPE: &str = "ruuvitag";

pub const MQTT_PORT: u16 = 1883;

/// Brokers every record is published to, in order.
pub const BROKERS: [(&str, &str); 2] = [
    ("local", "mqtt-server"),
    ("scaleway", "iot.fr-par.scw.cloud"),
];

/// Errors detected while building the configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("InfluxDB host not defined (set INFLUX_HOST or --influx-host)")]
    MissingStorageHost,
}

/// Connection settings for the InfluxDB sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub measurement: String,
}

/// One MQTT broker to publish to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Short label used in logs
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

/// Settings for the MQTT sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagingConfig {
    pub client_id: String,
    pub device_type: String,
    pub brokers: Vec<BrokerEndpoint>,
    /// Deadline for one publish to one broker
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
    /// Deadline for one sink write within a dispatch
    pub write_timeout: Duration,
    /// Devices silent for longer than this are forgotten
    pub device_timeout: Duration,
    pub verbose: bool,
}

impl Config {
    /// Validate parsed options into a configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingStorageHost`] when no InfluxDB host is set.
    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let host = options
            .influx_host
            .clone()
            .filter(|host| !host.trim().is_empty())
            .ok_or(ConfigError::MissingStorageHost)?;

        let client_id = options
            .device_id
            .clone()
            .unwrap_or_else(|| format!("ruuvitag-fanout-{}", std::process::id()));

        Ok(Self {
            storage: StorageConfig {
                host,
                port: STORAGE_PORT,
                username: options.influx_user.clone(),
                password: options.influx_pass.clone(),
                database: DATABASE_NAME.to_string(),
                measurement: MEASUREMENT_NAME.to_string(),
            },
            messaging: MessagingConfig {
                client_id,
                device_type: DEVICE_TYPE.to_string(),
                brokers: BROKERS
                    .iter()
                    .map(|(name, host)| BrokerEndpoint::new(*name, *host, MQTT_PORT))
                    .collect(),
                publish_timeout: options.publish_timeout,
            },
            write_timeout: options.write_timeout,
            device_timeout: options.device_timeout,
            verbose: options.verbose,
        })
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use ruuvitag_fanout::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be checked before "m" and "s"
    let (number, unit_millis, unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000, "seconds")
    } else {
        (src, 1_000, "duration")
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {number}"))?;

    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {src}"))
}
