use crate::app::Scanner;
use crate::config::{BrokerEndpoint, MessagingConfig, StorageConfig};
use crate::device::{MacAddress, Protocol};
use crate::measurement::Measurement;
use crate::observation::Record;
use crate::scanner::{MeasurementResult, ScanError};
use crate::sink::influxdb::{ApiFuture, InfluxApi, InfluxError};
use crate::sink::mqtt::{Message, PublishFuture, Publisher};
use crate::sink::{Sink, SinkError, SinkFuture, WriteMeta};
use std::collections::HashSet;
use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build a `Measurement` received now with all optional fields set to `None`.
///
/// Tests can override just the fields they care about.
pub fn base_measurement(mac: MacAddress, protocol: Protocol) -> Measurement {
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

pub fn storage_config() -> StorageConfig {
    StorageConfig {
        host: "influx.test".to_string(),
        port: 443,
        username: Some("logger".to_string()),
        password: Some("secret".to_string()),
        database: "homeautomation".to_string(),
        measurement: "device".to_string(),
    }
}

pub fn messaging_config() -> MessagingConfig {
    MessagingConfig {
        client_id: "test-client".to_string(),
        device_type: "ruuvitag".to_string(),
        brokers: vec![
            BrokerEndpoint::new("local", "mqtt-server", 1883),
            BrokerEndpoint::new("scaleway", "iot.fr-par.scw.cloud", 1883),
        ],
        publish_timeout: Duration::from_secs(5),
    }
}

#[derive(Debug, Default)]
struct FakeInfluxState {
    reachable: bool,
    fail_writes: bool,
    databases: Vec<String>,
    created: Vec<String>,
    list_calls: usize,
    writes: Vec<(String, String)>,
}

/// In-memory InfluxDB API recording every call.
#[derive(Debug, Clone, Default)]
pub struct FakeInflux {
    state: Arc<Mutex<FakeInfluxState>>,
}

impl FakeInflux {
    pub fn with_databases(names: &[&str]) -> Self {
        let state = FakeInfluxState {
            reachable: true,
            databases: names.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self) {
        self.state.lock().unwrap().fail_writes = true;
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    fn refused() -> InfluxError {
        InfluxError::Status {
            status: 503,
            body: "connection refused".to_string(),
        }
    }
}

impl InfluxApi for FakeInflux {
    fn list_databases(&self) -> ApiFuture<'_, Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        let result = if state.reachable {
            Ok(state.databases.clone())
        } else {
            Err(Self::refused())
        };
        Box::pin(async move { result })
    }

    fn create_database<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()> {
        let mut state = self.state.lock().unwrap();
        let result = if state.reachable {
            state.databases.push(name.to_string());
            state.created.push(name.to_string());
            Ok(())
        } else {
            Err(Self::refused())
        };
        Box::pin(async move { result })
    }

    fn write_lines<'a>(&'a self, database: &'a str, lines: String) -> ApiFuture<'a, ()> {
        let mut state = self.state.lock().unwrap();
        let result = if state.reachable && !state.fail_writes {
            state.writes.push((database.to_string(), lines));
            Ok(())
        } else {
            Err(InfluxError::Status {
                status: 400,
                body: "write rejected".to_string(),
            })
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct FakePublisherState {
    failing: HashSet<String>,
    hanging: HashSet<String>,
    published: Vec<(String, String, Message)>,
}

/// MQTT publisher recording `(broker, client_id, message)` per publish.
#[derive(Debug, Clone, Default)]
pub struct FakePublisher {
    state: Arc<Mutex<FakePublisherState>>,
}

impl FakePublisher {
    pub fn fail_broker(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    pub fn hang_broker(&self, name: &str) {
        self.state.lock().unwrap().hanging.insert(name.to_string());
    }

    pub fn published(&self) -> Vec<(String, String, Message)> {
        self.state.lock().unwrap().published.clone()
    }
}

impl Publisher for FakePublisher {
    fn publish<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
        client_id: &'a str,
        message: &'a Message,
    ) -> PublishFuture<'a> {
        let mut state = self.state.lock().unwrap();
        if state.hanging.contains(&endpoint.name) {
            return Box::pin(pending());
        }
        let result = if state.failing.contains(&endpoint.name) {
            Err(rumqttc::ConnectionError::RequestsDone.into())
        } else {
            state.published.push((
                endpoint.name.clone(),
                client_id.to_string(),
                message.clone(),
            ));
            Ok(())
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Record,
    Fail,
    Hang,
}

/// Sink recording every record and meta it receives.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    name: String,
    behavior: Behavior,
    ready_calls: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<(Record, WriteMeta)>>>,
}

impl RecordingSink {
    fn with_behavior(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            ready_calls: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn new(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Record)
    }

    /// A sink whose writes always fail.
    pub fn failing(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Fail)
    }

    /// A sink whose setup and writes never complete.
    pub fn hanging(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Hang)
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(Record, WriteMeta)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_ready(&self) -> SinkFuture<'_> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Hang => Box::pin(pending()),
            _ => Box::pin(async { Ok(()) }),
        }
    }

    fn write<'a>(&'a self, record: &'a Record, meta: &'a WriteMeta) -> SinkFuture<'a> {
        match self.behavior {
            Behavior::Record => {
                self.writes.lock().unwrap().push((record.clone(), *meta));
                Box::pin(async { Ok(()) })
            }
            Behavior::Fail => {
                let err = SinkError::write_failure(self.name.as_str(), "forced failure");
                Box::pin(async move { Err(err) })
            }
            Behavior::Hang => Box::pin(pending()),
        }
    }
}

/// Scanner yielding a fixed list of results.
#[derive(Debug)]
pub struct FakeScanner {
    results: Mutex<Vec<MeasurementResult>>,
    endless: bool,
    started: AtomicBool,
    // Keeps an endless scanner's channel open
    sender: Mutex<Option<mpsc::Sender<MeasurementResult>>>,
}

impl FakeScanner {
    /// The channel closes after the last result.
    pub fn new(results: Vec<MeasurementResult>) -> Self {
        Self {
            results: Mutex::new(results),
            endless: false,
            started: AtomicBool::new(false),
            sender: Mutex::new(None),
        }
    }

    /// A scanner that never yields and never closes.
    pub fn endless() -> Self {
        Self {
            endless: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Scanner for FakeScanner {
    fn start_scan(
        &self,
        _verbose: bool,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<MeasurementResult>, ScanError>> + Send + '_>,
    > {
        self.started.store(true, Ordering::SeqCst);
        let results = std::mem::take(&mut *self.results.lock().unwrap());
        let (tx, rx) = mpsc::channel::<MeasurementResult>(results.len().max(1));
        if self.endless {
            *self.sender.lock().unwrap() = Some(tx);
        } else {
            tokio::spawn(async move {
                for r in results {
                    let _ = tx.send(r).await;
                }
                // drop tx to close channel
            });
        }
        Box::pin(async move { Ok(rx) })
    }
}
