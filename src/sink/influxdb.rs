//! InfluxDB storage sink.
//!
//! Records are written as one line-protocol point each: the device identity
//! and movement latch become tags, every non-NaN field becomes a field.
//! Integer fields carry the `i` suffix.
//! The HTTP transport sits behind [`InfluxApi`] so the sink logic can be
//! tested without a server.

use super::{Sink, SinkError, SinkFuture, WriteMeta};
use crate::config::StorageConfig;
use crate::measurement::FieldValue;
use crate::observation::Record;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

/// Data point in InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

/// Escape commas and spaces (and `=` outside measurement names).
fn escape(value: &str, escape_equals: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (escape_equals && c == '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in &data_point.tag_set {
        write!(fmt, ",{}={}", escape(key, true), escape(value, true))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in &data_point.field_set {
        if !first {
            write!(fmt, ",")?;
        }
        first = false;
        match value {
            FieldValue::Float(value) => write!(fmt, "{}={}", escape(key, true), value)?,
            FieldValue::Integer(value) => write!(fmt, "{}={}i", escape(key, true), value)?,
        }
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Pre-epoch times are left to the server clock
    if let Some(elapsed) = data_point
        .timestamp
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
    {
        write!(fmt, " {}", elapsed.as_nanos())?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape(&self.measurement, false))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// Build the point stored for one dispatched record.
///
/// NaN fields are dropped: line protocol cannot represent them and the server
/// would reject the whole write.
pub fn data_point(measurement: &str, record: &Record, meta: &WriteMeta) -> DataPoint {
    let tag_set = BTreeMap::from([
        ("address".to_string(), record.address.to_string()),
        ("protocol".to_string(), record.protocol.to_string()),
        (
            "movement_detected".to_string(),
            meta.movement_detected.to_string(),
        ),
    ]);

    let field_set = record
        .fields
        .iter()
        .filter(|(name, value)| {
            if value.is_nan() {
                trace!(field = %name, address = %record.address, "Dropping NaN field");
                false
            } else {
                true
            }
        })
        .map(|(name, value)| (name.to_string(), *value))
        .collect();

    DataPoint {
        measurement: measurement.to_string(),
        tag_set,
        field_set,
        timestamp: Some(meta.written_at),
    }
}

/// Errors from the InfluxDB HTTP API.
#[derive(Error, Debug)]
pub enum InfluxError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("query error: {0}")]
    Query(String),
}

/// Boxed future returned by [`InfluxApi`] operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, InfluxError>> + Send + 'a>>;

/// The subset of the InfluxDB 1.x API the sink needs.
pub trait InfluxApi: Send + Sync {
    fn list_databases(&self) -> ApiFuture<'_, Vec<String>>;

    fn create_database<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()>;

    /// Write newline-separated line-protocol points to `database`.
    fn write_lines<'a>(&'a self, database: &'a str, lines: String) -> ApiFuture<'a, ()>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    fn into_result(self) -> Result<Vec<StatementResult>, InfluxError> {
        let statement_error = self.results.iter().find_map(|r| r.error.clone());
        match self.error.or(statement_error) {
            Some(error) => Err(InfluxError::Query(error)),
            None => Ok(self.results),
        }
    }
}

/// Database names from a `SHOW DATABASES` response.
fn database_names(results: &[StatementResult]) -> Vec<String> {
    results
        .iter()
        .flat_map(|result| &result.series)
        .flat_map(|series| {
            let column = series.columns.iter().position(|c| c == "name").unwrap_or(0);
            series
                .values
                .iter()
                .filter_map(move |row| row.get(column)?.as_str().map(str::to_string))
        })
        .collect()
}

async fn check_status(response: Response) -> Result<Response, InfluxError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(InfluxError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

const SHOW_DATABASES: &str = "SHOW DATABASES";

/// `CREATE DATABASE` statement for `name` as a quoted identifier.
pub fn create_statement(name: &str) -> String {
    let quoted = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("CREATE DATABASE \"{quoted}\"")
}

/// InfluxDB 1.x HTTP client over certificate-verified HTTPS.
///
/// Holds one connection pool for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct HttpInflux {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpInflux {
    /// Build a client for `config`, bounding every request by `timeout`.
    pub fn new(config: &StorageConfig, timeout: Duration) -> Result<Self, InfluxError> {
        let client = reqwest::Client::builder()
            .https_only(true)
            .timeout(timeout)
            .build()?;
        let base_url = format!("https://{}:{}", config.host, config.port);
        Ok(Self::with_client(client, base_url, config))
    }

    /// Talk to `base_url` (scheme, host and port) through an existing client.
    ///
    /// Credentials still come from `config`; its host and port are ignored.
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    fn query_request(&self, method: Method, statement: &str) -> RequestBuilder {
        self.request(method, "/query").query(&[("q", statement)])
    }

    fn write_request(&self, database: &str, lines: String) -> RequestBuilder {
        self.request(Method::POST, "/write")
            .query(&[("db", database), ("precision", "ns")])
            .body(lines)
    }

    async fn query(
        &self,
        method: Method,
        statement: &str,
    ) -> Result<Vec<StatementResult>, InfluxError> {
        let response = self.query_request(method, statement).send().await?;
        let response: QueryResponse = check_status(response).await?.json().await?;
        response.into_result()
    }

    async fn show_databases(&self) -> Result<Vec<String>, InfluxError> {
        let results = self.query(Method::GET, SHOW_DATABASES).await?;
        Ok(database_names(&results))
    }

    async fn create(&self, name: &str) -> Result<(), InfluxError> {
        self.query(Method::POST, &create_statement(name)).await?;
        Ok(())
    }

    async fn write(&self, database: &str, lines: String) -> Result<(), InfluxError> {
        let response = self.write_request(database, lines).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

impl InfluxApi for HttpInflux {
    fn list_databases(&self) -> ApiFuture<'_, Vec<String>> {
        Box::pin(self.show_databases())
    }

    fn create_database<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(self.create(name))
    }

    fn write_lines<'a>(&'a self, database: &'a str, lines: String) -> ApiFuture<'a, ()> {
        Box::pin(self.write(database, lines))
    }
}

/// Sink storing records in an InfluxDB database.
pub struct StorageSink<C = HttpInflux> {
    client: C,
    database: String,
    measurement: String,
}

impl<C: InfluxApi> StorageSink<C> {
    pub const NAME: &'static str = "influxdb";

    pub fn new(config: &StorageConfig, client: C) -> Self {
        Self {
            client,
            database: config.database.clone(),
            measurement: config.measurement.clone(),
        }
    }

    /// Create the target database unless it already exists.
    #[instrument(name = "storage_ensure_ready", skip(self), fields(database = %self.database))]
    async fn ensure_database(&self) -> Result<(), SinkError> {
        let databases = self
            .client
            .list_databases()
            .await
            .map_err(|e| SinkError::unavailable(Self::NAME, e))?;

        if databases.iter().any(|name| *name == self.database) {
            debug!("Database exists");
            return Ok(());
        }

        self.client
            .create_database(&self.database)
            .await
            .map_err(|e| SinkError::unavailable(Self::NAME, e))?;
        info!("Created database");
        Ok(())
    }

    async fn write_point(&self, record: &Record, meta: &WriteMeta) -> Result<(), SinkError> {
        let point = data_point(&self.measurement, record, meta);
        if point.field_set.is_empty() {
            trace!(address = %record.address, "No storable fields, skipping point");
            return Ok(());
        }

        self.client
            .write_lines(&self.database, point.to_string())
            .await
            .map_err(|e| SinkError::write_failure(Self::NAME, e))
    }
}

impl<C: InfluxApi> Sink for StorageSink<C> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn ensure_ready(&self) -> SinkFuture<'_> {
        Box::pin(self.ensure_database())
    }

    fn write<'a>(&'a self, record: &'a Record, meta: &'a WriteMeta) -> SinkFuture<'a> {
        Box::pin(self.write_point(record, meta))
    }
}
