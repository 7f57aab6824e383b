//! Relay loop
//!
//! Consumes service watch events one at a time and, for every admitted
//! service, scrapes each of its ports in order, decodes the payload and
//! forwards the samples. Processing is strictly serial.
//!
//! Under the default [`FailurePolicy::Abort`] the first failure ends the
//! loop and is returned to the caller. [`FailurePolicy::Continue`] logs
//! the failure and moves on to the next event.


use crate::cluster::{ServiceWatcher, WatchError, WatchEvents};
use crate::exposition::{self, DecodeError};
use crate::forwarder::{ForwardError, Forwarder};
use crate::health::{components, HealthRegistry};
use crate::models::{ScrapePort, ScrapeTarget, ServiceDescriptor, WatchEvent};
use crate::observability::{RelayMetrics, StructuredLogger};
use crate::scrape::{ScrapeError, Scraper};
use crate::selector::LabelSelector;
use anyhow::Result;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the loop does when processing an event fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the loop and return the error
    #[default]
    Abort,
    /// Log the error and continue with the next event
    Continue,
}

/// Configuration for the relay loop
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host of every scrape target
    pub node_address: String,
    pub scrape_port: ScrapePort,
    pub failure_policy: FailurePolicy,
    /// Open a new watch when the control plane closes the current one
    pub resubscribe: bool,
}

impl RelayConfig {
    pub fn new(node_address: impl Into<String>) -> Self {
        Self {
            node_address: node_address.into(),
            scrape_port: ScrapePort::default(),
            failure_policy: FailurePolicy::default(),
            resubscribe: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("service {service} exposes no ports to scrape")]
    NoPorts { service: String },

    #[error("failed to scrape service {service}")]
    Scrape {
        service: String,
        #[source]
        source: ScrapeError,
    },

    #[error("failed to decode payload from {url}")]
    Decode {
        url: String,
        #[source]
        source: DecodeError,
    },

    #[error("failed to forward samples from {url}")]
    Forward {
        url: String,
        #[source]
        source: ForwardError,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl RelayError {
    /// Health component responsible for the failure
    pub fn component(&self) -> &'static str {
        match self {
            RelayError::NoPorts { .. } | RelayError::Watch(_) => components::WATCHER,
            RelayError::Scrape { .. } | RelayError::Decode { .. } => components::SCRAPER,
            RelayError::Forward { .. } => components::FORWARDER,
        }
    }
}

/// Why the loop returned without an error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The watch stream ended
    #[default]
    StreamClosed,
    /// Shutdown was requested
    Cancelled,
}

/// Counters describing a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub outcome: RelayOutcome,
    /// Added/Modified events whose ports were all forwarded
    pub processed: u64,
    /// Deleted and Error events
    pub ignored: u64,
    /// Events that failed under [`FailurePolicy::Continue`]
    pub failed: u64,
    pub subscriptions: u64,
}

impl RelaySummary {
    fn absorb(&mut self, other: RelaySummary) {
        self.outcome = other.outcome;
        self.processed += other.processed;
        self.ignored += other.ignored;
        self.failed += other.failed;
        self.subscriptions += other.subscriptions;
    }
}

/// Same rendering as `{:#}` on an `anyhow::Error`, for errors that are
/// still needed afterwards
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    anyhow::Chain::new(err)
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// The discovery-scrape-forward loop
pub struct Relay {
    scraper: Arc<dyn Scraper>,
    forwarder: Forwarder,
    config: RelayConfig,
    shutdown: CancellationToken,
    health: Option<HealthRegistry>,
    metrics: RelayMetrics,
    logger: StructuredLogger,
}

impl Relay {
    pub fn new(
        scraper: Arc<dyn Scraper>,
        forwarder: Forwarder,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scraper,
            forwarder,
            config,
            shutdown,
            health: None,
            metrics: RelayMetrics::new(),
            logger: StructuredLogger::new(""),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Watch services and relay them until the subscription ends, shutdown
    /// is requested or an event fails
    ///
    /// With `resubscribe` set, a closed stream is followed by a new
    /// subscription.
    pub async fn run_watch(
        &self,
        watcher: &ServiceWatcher,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<RelaySummary, RelayError> {
        let mut total = RelaySummary::default();

        loop {
            let events = match watcher.watch(namespace, selector).await {
                Ok(events) => events,
                Err(WatchError::Stopped) => {
                    total.outcome = RelayOutcome::Cancelled;
                    return Ok(total);
                }
                Err(e) => {
                    if let Some(health) = &self.health {
                        health
                            .set_unhealthy(components::WATCHER, error_chain(&e))
                            .await;
                    }
                    return Err(e.into());
                }
            };
            total.subscriptions += 1;

            self.set_watching(true).await;
            let run = self.run(events).await;
            self.set_watching(false).await;
            total.absorb(run?);

            match total.outcome {
                RelayOutcome::StreamClosed if self.config.resubscribe => {
                    info!(
                        subscriptions = total.subscriptions,
                        "Watch stream closed, resubscribing"
                    );
                }
                _ => return Ok(total),
            }
        }
    }

    /// Process events until the sequence ends or shutdown is requested
    pub async fn run(&self, mut events: WatchEvents) -> Result<RelaySummary, RelayError> {
        info!(
            node_address = %self.config.node_address,
            policy = ?self.config.failure_policy,
            "Starting relay loop"
        );

        let mut summary = RelaySummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down relay loop");
                    summary.outcome = RelayOutcome::Cancelled;
                    break;
                }
                next = events.recv() => next,
            };

            let Some(event) = next else {
                info!(processed = summary.processed, "Watch stream ended");
                summary.outcome = RelayOutcome::StreamClosed;
                break;
            };

            self.metrics.inc_watch_event(event.kind());

            let Some(service) = event.admitted() else {
                match &event {
                    WatchEvent::Error(message) => {
                        warn!(error = %message, "Watch reported an error")
                    }
                    _ => debug!(kind = event.kind(), "Ignoring event"),
                }
                summary.ignored += 1;
                continue;
            };

            match self.process(event.kind(), service).await {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    self.record_failure(&e).await;
                    match self.config.failure_policy {
                        FailurePolicy::Abort => return Err(e),
                        FailurePolicy::Continue => {
                            summary.failed += 1;
                            self.metrics.inc_event_failures();
                            self.logger
                                .log_event_failure(&service.qualified_name(), &error_chain(&e));
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Scrape targets for a service, in port order
    pub fn targets(&self, service: &ServiceDescriptor) -> Result<Vec<ScrapeTarget>, RelayError> {
        let name = service.qualified_name();

        let targets: Vec<ScrapeTarget> = service
            .ports
            .iter()
            .filter_map(|p| match self.config.scrape_port {
                ScrapePort::Service => Some(p.port),
                ScrapePort::Node => {
                    if p.node_port.is_none() {
                        warn!(service = %name, port = p.port, "Port has no node port, skipping");
                    }
                    p.node_port
                }
            })
            .map(|port| ScrapeTarget::new(name.clone(), &self.config.node_address, port))
            .collect();

        if targets.is_empty() {
            return Err(RelayError::NoPorts { service: name });
        }
        Ok(targets)
    }

    async fn process(&self, kind: &str, service: &ServiceDescriptor) -> Result<(), RelayError> {
        let targets = self.targets(service)?;
        self.logger
            .log_service(kind, &service.qualified_name(), targets.len());

        for target in &targets {
            self.relay_target(target).await?;
        }

        self.metrics.inc_services_processed();
        self.mark_healthy().await;
        Ok(())
    }

    async fn relay_target(&self, target: &ScrapeTarget) -> Result<(), RelayError> {
        let start = Instant::now();
        let scraped = self.scraper.scrape(target).await;
        self.metrics
            .observe_scrape(scraped.is_ok(), start.elapsed().as_secs_f64());

        let response = scraped.map_err(|source| RelayError::Scrape {
            service: target.service.clone(),
            source,
        })?;

        let families = exposition::decode(&response.body, response.content_type.as_deref())
            .map_err(|source| RelayError::Decode {
                url: target.url.clone(),
                source,
            })?;
        debug!(
            url = %target.url,
            families = families.len(),
            samples = exposition::sample_count(&families),
            "Decoded payload"
        );

        let start = Instant::now();
        let sent = self.forwarder.send(&families).await;
        self.metrics
            .observe_forward_latency(start.elapsed().as_secs_f64());

        let points = sent.map_err(|source| {
            self.metrics.inc_forward_errors();
            RelayError::Forward {
                url: target.url.clone(),
                source,
            }
        })?;

        self.metrics.add_points_forwarded(points);
        self.logger.log_forwarded(
            &target.service,
            &target.url,
            points,
            &self.forwarder.target().database,
        );
        Ok(())
    }

    async fn set_watching(&self, watching: bool) {
        if let Some(health) = &self.health {
            health.set_watching(watching).await;
        }
    }

    async fn mark_healthy(&self) {
        if let Some(health) = &self.health {
            health.set_healthy(components::SCRAPER).await;
            health.set_healthy(components::FORWARDER).await;
        }
    }

    async fn record_failure(&self, error: &RelayError) {
        let Some(health) = &self.health else {
            return;
        };

        let message = error_chain(error);
        match self.config.failure_policy {
            FailurePolicy::Abort => health.set_unhealthy(error.component(), message).await,
            FailurePolicy::Continue => health.set_degraded(error.component(), message).await,
        }
    }
}

/// Builder for creating the relay loop
pub struct RelayBuilder {
    scraper: Option<Arc<dyn Scraper>>,
    forwarder: Option<Forwarder>,
    config: Option<RelayConfig>,
    shutdown: CancellationToken,
    health: Option<HealthRegistry>,
    namespace: String,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            scraper: None,
            forwarder: None,
            config: None,
            shutdown: CancellationToken::new(),
            health: None,
            namespace: String::new(),
        }
    }

    pub fn scraper(mut self, scraper: Arc<dyn Scraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    pub fn forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Token whose cancellation ends the loop
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Watched namespace, used to tag structured log events
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn build(self) -> Result<Relay> {
        let scraper = self
            .scraper
            .ok_or_else(|| anyhow::anyhow!("Scraper is required"))?;
        let forwarder = self
            .forwarder
            .ok_or_else(|| anyhow::anyhow!("Forwarder is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Relay config is required"))?;
        if config.node_address.is_empty() {
            anyhow::bail!("Node address must not be empty");
        }

        let mut relay = Relay::new(scraper, forwarder, config, self.shutdown);
        relay.health = self.health;
        relay.logger = StructuredLogger::new(self.namespace);
        Ok(relay)
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
