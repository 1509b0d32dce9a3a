//! Fan-out of observations to every configured sink.

use crate::observation::Observation;
use crate::sink::{Sink, SinkError, WriteMeta};
use futures::future::join_all;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Result of delivering one record to one sink.
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink: String,
    pub result: Result<(), SinkError>,
}

/// What happened during one [`Dispatcher::handle`] call.
#[derive(Debug)]
pub struct DispatchReport {
    /// Movement flag value consumed by this dispatch
    pub movement_detected: bool,
    /// One entry per sink, in configuration order
    pub outcomes: Vec<SinkOutcome>,
}

impl DispatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }
}

/// Routes observations to all sinks, isolating failures per sink.
///
/// Stateless between calls: all mutable state lives in the observations and
/// in the sinks' connection objects.
pub struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
    write_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher with no sinks; every sink write is bounded by
    /// `write_timeout`.
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            write_timeout,
        }
    }

    /// Append a sink. Sinks are bootstrapped in the order they are added.
    pub fn with_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Run every sink's setup in order.
    ///
    /// # Errors
    /// Returns the first sink that could not be made ready. A setup that
    /// exceeds the write timeout counts as unavailable.
    #[instrument(name = "dispatcher_ensure_ready", skip(self), fields(sinks = self.sinks.len()))]
    pub async fn ensure_ready(&self) -> Result<(), SinkError> {
        for sink in &self.sinks {
            timeout(self.write_timeout, sink.ensure_ready())
                .await
                .map_err(|_| {
                    SinkError::unavailable(
                        sink.name(),
                        format!("setup timed out after {:?}", self.write_timeout),
                    )
                })??;
            debug!(sink = sink.name(), "Sink ready");
        }
        Ok(())
    }

    /// Deliver the observation's current state to every sink.
    ///
    /// The record is snapshotted once and the movement flag is consumed once,
    /// before any sink runs, so a failing sink never leaves the flag set.
    /// Sink failures are logged and reported, never returned as errors.
    ///
    /// `is_new` marks the first packet from a device; it does not change
    /// delivery.
    #[instrument(
        name = "dispatch",
        skip(self, observation),
        fields(device = %observation.key())
    )]
    pub async fn handle(&self, observation: &Observation, is_new: bool) -> DispatchReport {
        let record = observation.as_record();
        let meta = WriteMeta {
            movement_detected: observation.take_movement(),
            written_at: SystemTime::now(),
        };

        if is_new {
            debug!("First dispatch for device");
        }

        let (record, meta) = (&record, &meta);
        let results = join_all(self.sinks.iter().map(|sink| async move {
            match timeout(self.write_timeout, sink.write(record, meta)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout {
                    sink: sink.name().to_string(),
                    after: self.write_timeout,
                }),
            }
        }))
        .await;

        let outcomes: Vec<SinkOutcome> = self
            .sinks
            .iter()
            .zip(results)
            .map(|(sink, result)| {
                if let Err(error) = &result {
                    warn!(sink = sink.name(), error = %error, "Write failed, record dropped");
                }
                SinkOutcome {
                    sink: sink.name().to_string(),
                    result,
                }
            })
            .collect();

        debug!(
            movement_detected = meta.movement_detected,
            delivered = outcomes.iter().filter(|o| o.result.is_ok()).count(),
            "Dispatched"
        );

        DispatchReport {
            movement_detected: meta.movement_detected,
            outcomes,
        }
    }
}
