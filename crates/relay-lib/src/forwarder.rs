//! Forwarding decoded samples to the time-series sink
//!
//! The [`Forwarder`] turns one scrape's samples into a [`WriteBatch`] bound
//! to the database and retention policy chosen at construction and hands
//! it to a [`PointSink`] in a single write call. There is no buffering
//! across batches and no retry.
//!
//! [`InfluxWriter`] is the InfluxDB 1.x sink: it posts line protocol to the
//! `/write` endpoint.

use crate::models::{MetricFamily, Point, SinkTarget, WriteBatch};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Default InfluxDB HTTP API port
pub const DEFAULT_INFLUXDB_PORT: u16 = 8086;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("invalid sink URL {url:?}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("write to database {database} failed")]
    Request {
        database: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("write to database {database} returned HTTP status {status}: {body}")]
    Status {
        database: String,
        status: u16,
        body: String,
    },
}

/// Trait for sink implementations
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Write a whole batch; either every point is accepted or the call fails
    async fn write(&self, batch: &WriteBatch) -> Result<(), ForwardError>;
}

/// Packages samples into batches for a fixed sink target
pub struct Forwarder {
    sink: Arc<dyn PointSink>,
    target: SinkTarget,
}

impl Forwarder {
    pub fn new(sink: Arc<dyn PointSink>, target: SinkTarget) -> Self {
        Self { sink, target }
    }

    pub fn target(&self) -> &SinkTarget {
        &self.target
    }

    /// Build the batch for one scrape
    ///
    /// Samples with a non-finite value are left out, the sink cannot store them.
    pub fn batch(&self, families: &[MetricFamily]) -> WriteBatch {
        let points = families
            .iter()
            .flat_map(|family| family.samples.iter())
            .filter(|sample| sample.value.is_finite())
            .map(Point::from_sample)
            .collect();

        WriteBatch {
            target: self.target.clone(),
            points,
        }
    }

    /// Write one scrape's samples; returns the number of points written
    pub async fn send(&self, families: &[MetricFamily]) -> Result<usize, ForwardError> {
        let batch = self.batch(families);
        if batch.is_empty() {
            debug!(database = %self.target.database, "Nothing to forward");
            return Ok(0);
        }

        self.sink.write(&batch).await?;
        Ok(batch.len())
    }
}

/// Connection settings for [`InfluxWriter`]
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL of the InfluxDB HTTP API
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Option<Duration>,
}

impl InfluxConfig {
    /// Base URL of an InfluxDB running as a cluster service
    pub fn service_url(name: &str, namespace: &str, port: u16) -> String {
        format!("http://{}.{}:{}", name, namespace, port)
    }
}

/// InfluxDB 1.x HTTP write client
pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxWriter {
    pub fn new(config: InfluxConfig) -> Result<Self, ForwardError> {
        let mut write_url = Url::parse(&config.url).map_err(|source| ForwardError::Url {
            url: config.url.clone(),
            source,
        })?;
        let path = format!("{}/write", write_url.path().trim_end_matches('/'));
        write_url.set_path(&path);

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(ForwardError::Client)?;

        Ok(Self {
            client,
            write_url,
            username: config.username,
            password: config.password,
        })
    }

    /// URL of the write endpoint for a target
    pub fn write_url(&self, target: &SinkTarget) -> Url {
        let mut url = self.write_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("db", &target.database);
            if let Some(rp) = &target.retention_policy {
                query.append_pair("rp", rp);
            }
            query.append_pair("precision", "ms");
        }
        url
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write(&self, batch: &WriteBatch) -> Result<(), ForwardError> {
        let database = &batch.target.database;
        let body = to_line_protocol(&batch.points);

        let mut request = self
            .client
            .post(self.write_url(&batch.target))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|source| ForwardError::Request {
                database: database.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Status {
                database: database.clone(),
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        debug!(database = %database, points = batch.len(), "Wrote batch");
        Ok(())
    }
}

/// Serialize points as InfluxDB line protocol, one point per line
pub fn to_line_protocol(points: &[Point]) -> String {
    let mut out = String::new();

    for point in points {
        escape_into(&mut out, &point.measurement, &[',', ' ']);

        // Line protocol has no representation for empty tag values
        for (key, value) in point.tags.iter().filter(|(_, v)| !v.is_empty()) {
            out.push(',');
            escape_into(&mut out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(&mut out, value, &[',', '=', ' ']);
        }

        for (i, (key, value)) in point.fields.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            escape_into(&mut out, key, &[',', '=', ' ']);
            let _ = write!(out, "={}", value);
        }

        if let Some(ts) = point.timestamp_ms {
            let _ = write!(out, " {}", ts);
        }

        out.push('\n');
    }

    out
}

/// Backslashes are always doubled so a trailing one cannot escape the
/// separator after it
fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}
