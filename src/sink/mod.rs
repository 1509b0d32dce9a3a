//! Output sinks for observation records.
//!
//! This module provides the [`Sink`] trait shared by every destination and
//! its implementations: InfluxDB storage ([`influxdb`]) and MQTT publishing
//! ([`mqtt`]). Each sink normalizes the shared [`Record`] for its own wire
//! format.

pub mod influxdb;
pub mod mqtt;

use crate::observation::Record;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Boxed future returned by sink operations.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Side-channel data delivered with every record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteMeta {
    /// Movement latched since the previous dispatch of this device
    pub movement_detected: bool,
    /// Wall-clock time of the dispatch (not the packet receive time)
    pub written_at: SystemTime,
}

/// Errors returned by sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Prerequisite resources could not be confirmed at startup
    #[error("sink '{sink}' unavailable: {message}")]
    Unavailable { sink: String, message: String },
    /// A single write failed and the record was dropped
    #[error("write to sink '{sink}' failed: {message}")]
    WriteFailure { sink: String, message: String },
    /// A write did not complete before its deadline
    #[error("write to sink '{sink}' timed out after {after:?}")]
    Timeout { sink: String, after: Duration },
}

impl SinkError {
    pub fn unavailable(sink: impl Into<String>, message: impl ToString) -> Self {
        Self::Unavailable {
            sink: sink.into(),
            message: message.to_string(),
        }
    }

    pub fn write_failure(sink: impl Into<String>, message: impl ToString) -> Self {
        Self::WriteFailure {
            sink: sink.into(),
            message: message.to_string(),
        }
    }
}

/// A destination for observation records.
///
/// Implementations must tolerate concurrent calls from one dispatch running
/// every sink at once, hence `&self` receivers.
pub trait Sink: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Make sure the destination's prerequisites exist.
    ///
    /// Called once at startup; must be safe to call repeatedly.
    fn ensure_ready(&self) -> SinkFuture<'_>;

    /// Deliver one record.
    fn write<'a>(&'a self, record: &'a Record, meta: &'a WriteMeta) -> SinkFuture<'a>;
}
