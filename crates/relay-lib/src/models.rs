//! Core data models for the metrics relay

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A port exposed by a discovered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: Option<String>,
    pub protocol: Option<String>,
    /// Port the service listens on
    pub port: u16,
    /// Cluster-assigned node port, for NodePort and LoadBalancer services
    pub node_port: Option<u16>,
}

/// Service discovered through the watch stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

impl ServiceDescriptor {
    /// `namespace/name`, used in logs and error messages
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Typed notification produced by the service watcher
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ServiceDescriptor),
    Modified(ServiceDescriptor),
    Deleted(ServiceDescriptor),
    /// The control plane reported an error, or a raw notification could not be read
    Error(String),
}

impl WatchEvent {
    /// Short name used as a metric label and log field
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Error(_) => "error",
        }
    }

    pub fn service(&self) -> Option<&ServiceDescriptor> {
        match self {
            WatchEvent::Added(svc) | WatchEvent::Modified(svc) | WatchEvent::Deleted(svc) => {
                Some(svc)
            }
            WatchEvent::Error(_) => None,
        }
    }

    /// Returns the descriptor when the event should be scraped
    pub fn admitted(&self) -> Option<&ServiceDescriptor> {
        match self {
            WatchEvent::Added(svc) | WatchEvent::Modified(svc) => Some(svc),
            WatchEvent::Deleted(_) | WatchEvent::Error(_) => None,
        }
    }
}

/// Which port of a service is used to build scrape targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScrapePort {
    /// The service port
    #[default]
    Service,
    /// The cluster-assigned node port
    Node,
}

/// A single URL to scrape, derived from one service port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub service: String,
    pub url: String,
}

impl ScrapeTarget {
    pub const SCHEME: &'static str = "http";
    pub const PATH: &'static str = "/metrics";

    /// Build the target for `address:port`
    pub fn new(service: impl Into<String>, address: &str, port: u16) -> Self {
        // IPv6 literals need brackets inside a URL authority
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };

        Self {
            service: service.into(),
            url: format!("{}://{}:{}{}", Self::SCHEME, host, port, Self::PATH),
        }
    }
}

impl fmt::Display for ScrapeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Metric type as declared by a `# TYPE` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
        }
    }
}

/// One sample line of an exposition payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Full sample name, e.g. `http_request_duration_seconds_bucket`
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: Option<i64>,
}

/// A named group of samples sharing help text and type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub samples: Vec<MetricSample>,
}

/// Database and retention policy every batch is written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkTarget {
    pub database: String,
    pub retention_policy: Option<String>,
}

impl SinkTarget {
    pub fn new(database: impl Into<String>, retention_policy: Option<String>) -> Self {
        Self {
            database: database.into(),
            // An empty policy means the database default
            retention_policy: retention_policy.filter(|rp| !rp.is_empty()),
        }
    }
}

/// Sink-native point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ms: Option<i64>,
}

impl Point {
    pub const VALUE_FIELD: &'static str = "value";

    pub fn from_sample(sample: &MetricSample) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(Self::VALUE_FIELD.to_string(), sample.value);

        Self {
            measurement: sample.name.clone(),
            tags: sample.labels.clone(),
            fields,
            timestamp_ms: sample.timestamp_ms,
        }
    }
}

/// Points from one scrape, bound to a single sink target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub target: SinkTarget,
    pub points: Vec<Point>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
