//! Core application runner for `ruuvitag-fanout`.
//!
//! This module is decoupled from process exit codes and signal handling so
//! the daemon loop can be tested deterministically with an injected scanner
//! and injected sinks.

use crate::config::{ConfigError, parse_duration};
use crate::dispatcher::Dispatcher;
use crate::registry::DeviceRegistry;
use crate::scanner::{MeasurementResult, ScanError};
use crate::sink::SinkError;
use clap::Parser;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Command line and environment options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// InfluxDB host, reached over HTTPS on port 443
    #[arg(long, env = "INFLUX_HOST")]
    pub influx_host: Option<String>,

    /// InfluxDB user name
    #[arg(long, env = "INFLUX_USER")]
    pub influx_user: Option<String>,

    /// InfluxDB password
    #[arg(long, env = "INFLUX_PASS", hide_env_values = true)]
    pub influx_pass: Option<String>,

    /// Client identifier used when connecting to MQTT brokers
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    /// Deadline for one sink write.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, env = "WRITE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub write_timeout: Duration,

    /// Deadline for publishing to one MQTT broker
    #[arg(long, env = "PUBLISH_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub publish_timeout: Duration,

    /// Forget devices that have been silent for this long
    #[arg(long, env = "DEVICE_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub device_timeout: Duration,

    /// Verbose output: debug logging and undecodable packets
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors that stop the daemon.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("storage bootstrap failed: {0}")]
    Bootstrap(#[from] SinkError),
    #[error("failed to build InfluxDB client: {0}")]
    Client(#[from] crate::sink::influxdb::InfluxError),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        verbose: bool,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<MeasurementResult>, ScanError>> + Send + '_>,
    >;
}

/// Real scanner implementation backed by BlueZ.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        verbose: bool,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<MeasurementResult>, ScanError>> + Send + '_>,
    > {
        Box::pin(crate::scanner::start_scan(verbose))
    }
}

/// Settings of the daemon loop itself.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub device_timeout: Duration,
    pub verbose: bool,
}

/// Counters reported when the loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: u64,
    pub decode_errors: u64,
    pub expired_devices: u64,
}

/// Bootstrap the sinks, then dispatch every scanned measurement until
/// `shutdown` resolves or the scanner stream ends.
///
/// - Sink bootstrap runs before scanning starts; its failure aborts the run.
/// - Decode errors are logged only when `settings.verbose` is true.
/// - Devices silent for longer than `settings.device_timeout` are forgotten.
///
/// A dispatch in progress when `shutdown` resolves is finished first; it is
/// bounded by the dispatcher's write timeout.
pub async fn run(
    settings: LoopSettings,
    scanner: &dyn Scanner,
    dispatcher: &Dispatcher,
    shutdown: impl Future<Output = ()>,
) -> Result<RunSummary, RunError> {
    dispatcher.ensure_ready().await?;
    info!(sinks = ?dispatcher.sink_names(), "Sinks ready");

    let mut measurements = scanner.start_scan(settings.verbose).await?;
    info!("Scanning for RuuviTags");

    let mut registry = DeviceRegistry::new();
    let mut summary = RunSummary::default();

    let mut expiry = interval(expiry_period(settings.device_timeout));
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = expiry.tick() => {
                for key in registry.expire(SystemTime::now(), settings.device_timeout) {
                    info!(device = %key, "Device lost");
                    summary.expired_devices += 1;
                }
            }
            result = measurements.recv() => match result {
                Some(Ok(measurement)) => {
                    let (observation, is_new) = registry.observe(&measurement);
                    if is_new {
                        info!(device = %observation.key(), "New device");
                    }
                    dispatcher.handle(&observation, is_new).await;
                    summary.dispatched += 1;
                }
                Some(Err(error)) => {
                    summary.decode_errors += 1;
                    if settings.verbose {
                        debug!(error = %error, "Undecodable packet");
                    }
                }
                None => {
                    info!("Scanner stream ended");
                    break;
                }
            },
        }
    }

    info!(
        dispatched = summary.dispatched,
        devices = registry.len(),
        "Stopped"
    );
    Ok(summary)
}

/// How often to look for silent devices.
fn expiry_period(device_timeout: Duration) -> Duration {
    (device_timeout / 4).max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Protocol;
    use crate::scanner::DecodeError;
    use crate::sink::influxdb::StorageSink;
    use crate::test_utils::{
        FakeInflux, FakeScanner, RecordingSink, TEST_MAC, base_measurement, storage_config,
    };
    use std::future::pending;
    use tokio_test::assert_ok;

    fn settings() -> LoopSettings {
        LoopSettings {
            device_timeout: Duration::from_secs(300),
            verbose: false,
        }
    }

    fn v5(movement_counter: u32) -> MeasurementResult {
        let mut m = base_measurement(TEST_MAC, Protocol::DataFormat5);
        m.temperature = Some(21.5);
        m.movement_counter = Some(movement_counter);
        Ok(m)
    }

    #[tokio::test]
    async fn run_dispatches_every_measurement() {
        let scanner = FakeScanner::new(vec![v5(1), v5(1)]);
        let sink = RecordingSink::new("recording");
        let dispatcher = Dispatcher::new(Duration::from_secs(1)).with_sink(sink.clone());

        let summary = assert_ok!(run(settings(), &scanner, &dispatcher, pending()).await);

        assert_eq!(summary.dispatched, 2);
        assert_eq!(sink.ready_calls(), 1);
        let writes = sink.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0.fields["temperature"], 21.5);
    }

    #[tokio::test]
    async fn run_reports_movement_once() {
        let scanner = FakeScanner::new(vec![v5(1), v5(2), v5(2)]);
        let sink = RecordingSink::new("recording");
        let dispatcher = Dispatcher::new(Duration::from_secs(1)).with_sink(sink.clone());

        assert_ok!(run(settings(), &scanner, &dispatcher, pending()).await);

        let flags: Vec<bool> = sink
            .writes()
            .iter()
            .map(|(_, meta)| meta.movement_detected)
            .collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[tokio::test]
    async fn run_counts_decode_errors() {
        let scanner = FakeScanner::new(vec![
            Err(DecodeError::InvalidData("bad packet".to_string())),
            v5(1),
        ]);
        let sink = RecordingSink::new("recording");
        let dispatcher = Dispatcher::new(Duration::from_secs(1)).with_sink(sink.clone());

        let summary = assert_ok!(
            run(
                LoopSettings {
                    verbose: true,
                    ..settings()
                },
                &scanner,
                &dispatcher,
                pending()
            )
            .await
        );

        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.dispatched, 1);
    }

    #[tokio::test]
    async fn run_survives_failing_sink() {
        let scanner = FakeScanner::new(vec![v5(1), v5(2)]);
        let healthy = RecordingSink::new("healthy");
        let dispatcher = Dispatcher::new(Duration::from_secs(1))
            .with_sink(RecordingSink::failing("failing"))
            .with_sink(healthy.clone());

        let summary = assert_ok!(run(settings(), &scanner, &dispatcher, pending()).await);

        assert_eq!(summary.dispatched, 2);
        assert_eq!(healthy.writes().len(), 2);
    }

    #[tokio::test]
    async fn run_aborts_when_storage_unavailable() {
        let scanner = FakeScanner::new(vec![v5(1)]);
        let dispatcher = Dispatcher::new(Duration::from_secs(1))
            .with_sink(StorageSink::new(&storage_config(), FakeInflux::unreachable()));

        let result = run(settings(), &scanner, &dispatcher, pending()).await;

        assert!(matches!(result, Err(RunError::Bootstrap(_))));
        assert!(!scanner.started());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let scanner = FakeScanner::endless();
        let dispatcher =
            Dispatcher::new(Duration::from_secs(1)).with_sink(RecordingSink::new("recording"));

        let summary = assert_ok!(run(settings(), &scanner, &dispatcher, async {}).await);

        assert_eq!(summary.dispatched, 0);
        assert!(scanner.started());
    }

    #[test]
    fn expiry_period_is_bounded() {
        assert_eq!(
            expiry_period(Duration::from_secs(300)),
            Duration::from_secs(75)
        );
        assert_eq!(
            expiry_period(Duration::from_millis(100)),
            Duration::from_secs(1)
        );
    }
}
