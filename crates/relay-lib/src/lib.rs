//! Metrics relay library
//!
//! This crate provides the core functionality for:
//! - Discovering metrics services through the cluster API
//! - Scraping and decoding the Prometheus exposition format
//! - Forwarding samples to InfluxDB
//! - Signal-driven shutdown, health checks and observability

pub mod cluster;
pub mod exposition;
pub mod forwarder;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod relay;
pub mod scrape;
pub mod selector;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::{LifecycleHandle, LifecycleManager, TerminationSignal};
pub use models::*;
pub use observability::{RelayMetrics, StructuredLogger};
pub use relay::{FailurePolicy, Relay, RelayBuilder, RelayConfig, RelayError, RelayOutcome};
pub use selector::LabelSelector;
