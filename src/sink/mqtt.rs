//! MQTT messaging sink.
//!
//! Every record is serialized to JSON once and published to each configured
//! broker independently. A broker that is down or slow only loses its own
//! copy of the message.

use super::{Sink, SinkError, SinkFuture, WriteMeta};
use crate::config::{BrokerEndpoint, MessagingConfig};
use crate::device::MacAddress;
use crate::observation::Record;
use futures::future::join_all;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Topic a device's records are published on.
///
/// # Example
/// ```
/// use ruuvitag_fanout::MacAddress;
/// use ruuvitag_fanout::sink::mqtt::topic;
///
/// let address: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
/// assert_eq!(topic("ruuvitag", &address), "sensor/ruuvitag/AA:BB:CC:DD:EE:FF/value");
/// ```
pub fn topic(device_type: &str, address: &MacAddress) -> String {
    format!("sensor/{device_type}/{address}/value")
}

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Errors from a single publish.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

/// Boxed future returned by [`Publisher::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

/// Transport used to deliver one message to one broker.
pub trait Publisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
        client_id: &'a str,
        message: &'a Message,
    ) -> PublishFuture<'a>;
}

/// Connection-per-publish MQTT transport.
///
/// Connects, publishes at QoS 0 and disconnects. The connection lives inside
/// the returned future, so dropping it on error or timeout closes the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttPublisher;

/// Capacity of the client's request queue; only publish and disconnect are queued.
const REQUEST_CAPACITY: usize = 4;

async fn publish_once(
    endpoint: &BrokerEndpoint,
    client_id: &str,
    message: &Message,
) -> Result<(), PublishError> {
    let mut options = MqttOptions::new(client_id, endpoint.host.as_str(), endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    client
        .publish(
            message.topic.as_str(),
            QoS::AtMostOnce,
            false,
            message.payload.clone(),
        )
        .await?;
    client.disconnect().await?;

    // Drive the connection until the disconnect has been sent
    loop {
        if let Event::Outgoing(Outgoing::Disconnect) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

impl Publisher for MqttPublisher {
    fn publish<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
        client_id: &'a str,
        message: &'a Message,
    ) -> PublishFuture<'a> {
        Box::pin(publish_once(endpoint, client_id, message))
    }
}

/// Sink publishing records to a list of MQTT brokers.
pub struct MessagingSink<P = MqttPublisher> {
    publisher: P,
    client_id: String,
    device_type: String,
    brokers: Vec<BrokerEndpoint>,
    publish_timeout: Duration,
}

impl<P: Publisher> MessagingSink<P> {
    pub const NAME: &'static str = "mqtt";

    pub fn new(config: &MessagingConfig, publisher: P) -> Self {
        Self {
            publisher,
            client_id: config.client_id.clone(),
            device_type: config.device_type.clone(),
            brokers: config.brokers.clone(),
            publish_timeout: config.publish_timeout,
        }
    }

    /// Build the message for a record. NaN fields are kept (as JSON `null`).
    pub fn message(&self, record: &Record) -> Result<Message, serde_json::Error> {
        Ok(Message {
            topic: topic(&self.device_type, &record.address),
            payload: serde_json::to_vec(record)?,
        })
    }

    async fn publish_to(&self, endpoint: &BrokerEndpoint, message: &Message) -> Result<(), String> {
        match tokio::time::timeout(
            self.publish_timeout,
            self.publisher.publish(endpoint, &self.client_id, message),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(broker = %endpoint.name, topic = %message.topic, "Published");
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.publish_timeout)),
        }
    }

    async fn publish_all(&self, record: &Record) -> Result<(), SinkError> {
        let message = self
            .message(record)
            .map_err(|e| SinkError::write_failure(Self::NAME, e))?;

        let results = join_all(
            self.brokers
                .iter()
                .map(|endpoint| self.publish_to(endpoint, &message)),
        )
        .await;

        let failures: Vec<String> = self
            .brokers
            .iter()
            .zip(results)
            .filter_map(|(endpoint, result)| {
                let error = result.err()?;
                warn!(
                    broker = %endpoint.name,
                    host = %endpoint.host,
                    topic = %message.topic,
                    error = %error,
                    "Publish failed, message dropped"
                );
                Some(format!("{}: {}", endpoint.name, error))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::write_failure(
                Self::NAME,
                format!(
                    "{} of {} brokers failed ({})",
                    failures.len(),
                    self.brokers.len(),
                    failures.join("; ")
                ),
            ))
        }
    }
}

impl<P: Publisher> Sink for MessagingSink<P> {
    fn name(&self) -> &str {
        Self::NAME
    }

    /// Connections are opened per publish, nothing to prepare.
    fn ensure_ready(&self) -> SinkFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn write<'a>(&'a self, record: &'a Record, _meta: &'a WriteMeta) -> SinkFuture<'a> {
        Box::pin(self.publish_all(record))
    }
}
