//! Metrics relay
//!
//! Watches cluster services matching a label selector, scrapes their
//! `/metrics` endpoints on a node address and forwards the samples to
//! InfluxDB.

use anyhow::{Context, Result};
use clap::Parser;
use relay_lib::{
    cluster::{self, namespace_or_default, AddressResolver, KubeCluster, ServiceWatcher},
    forwarder::{Forwarder, InfluxWriter},
    health::HealthRegistry,
    lifecycle::{LifecycleManager, TerminationSignal, SHUTDOWN_GRACE},
    observability::{RelayMetrics, StructuredLogger},
    relay::{RelayBuilder, RelayOutcome},
    scrape::HttpScraper,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{LogFormat, RelayArgs};

const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args = RelayArgs::parse();
    init_tracing(&args);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Metrics relay failed");
            1
        }
    };

    std::process::exit(code);
}

/// Initialize tracing; `RUST_LOG` takes precedence over `--log-level`
fn init_tracing(args: &RelayArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));
    let registry = tracing_subscriber::registry().with(filter);

    match args.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

/// Bootstrap and run the relay; returns the process exit status
async fn run(args: RelayArgs) -> Result<i32> {
    let shutdown = CancellationToken::new();
    let lifecycle = LifecycleManager::new(shutdown.clone())
        .install()
        .context("Failed to install signal handlers")?;

    let namespace = namespace_or_default(&args.metrics_services_namespace).to_string();
    let service_selector = args.service_selector()?;
    let node_selector = args.node_selector()?;

    // Initialize health registry and metrics
    let health = HealthRegistry::new();
    health.register_all().await;
    let metrics = RelayMetrics::new();

    // Start health and metrics server
    let state = Arc::new(api::AppState::new(health.clone(), metrics.clone()));
    let api_port = args.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, state).await {
            error!(error = %format!("{:#}", e), "API server stopped");
        }
    });

    let kubeconfig = args.kubeconfig_path();
    let client = cluster::connect(kubeconfig.as_deref()).await?;
    let cluster = Arc::new(KubeCluster::new(client));

    let node_address = match &args.node_address {
        Some(address) => {
            info!(address = %address, "Using configured node address");
            address.clone()
        }
        None => AddressResolver::new(cluster.clone(), node_selector)
            .resolve()
            .await
            .context("Failed to resolve node address")?,
    };
    metrics.set_node_address(&node_address);

    let writer =
        InfluxWriter::new(args.influx_config()).context("Failed to create InfluxDB writer")?;
    let forwarder = Forwarder::new(Arc::new(writer), args.sink_target());
    let scraper = HttpScraper::new(args.scrape_timeout()).context("Failed to create scraper")?;

    let logger = StructuredLogger::new(namespace.clone());
    logger.log_startup(RELAY_VERSION, &service_selector.to_query(), &node_address);

    let relay = RelayBuilder::new()
        .scraper(Arc::new(scraper))
        .forwarder(forwarder)
        .config(args.relay_config(node_address))
        .shutdown(shutdown.clone())
        .health(health)
        .namespace(namespace.clone())
        .build()?;
    let watcher = ServiceWatcher::new(cluster, shutdown);

    let stopped = lifecycle
        .drive(
            relay.run_watch(&watcher, &namespace, &service_selector),
            SHUTDOWN_GRACE,
        )
        .await
        .context("Relay stopped")?;

    let Some(summary) = stopped else {
        logger.log_shutdown(lifecycle.received().map_or("cancelled", TerminationSignal::name));
        return Ok(lifecycle.exit_code());
    };

    let reason = match (summary.outcome, lifecycle.received()) {
        (_, Some(signal)) => signal.name(),
        (RelayOutcome::Cancelled, None) => "cancelled",
        (RelayOutcome::StreamClosed, None) => "watch stream closed",
    };
    info!(
        processed = summary.processed,
        failed = summary.failed,
        subscriptions = summary.subscriptions,
        "Relay finished"
    );
    logger.log_shutdown(reason);

    Ok(lifecycle.exit_code())
}
