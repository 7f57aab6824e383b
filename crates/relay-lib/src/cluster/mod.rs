//! Cluster control-plane access
//!
//! This module connects to the Kubernetes API and provides the two
//! read paths the relay needs: listing nodes to find a scrape address,
//! and watching services that expose metrics.

mod resolver;
mod watcher;

pub use resolver::{internal_address, AddressResolver, ResolveError, INTERNAL_IP};
pub use watcher::{
    describe_service, namespace_or_default, normalize, ServiceWatcher, WatchError, WatchEvents,
    DEFAULT_NAMESPACE,
};

use crate::selector::LabelSelector;
use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{ListParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::{debug, info};

pub use async_trait::async_trait;

/// Raw service notifications as delivered by the control plane
pub type RawServiceStream =
    Pin<Box<dyn Stream<Item = kube::Result<kube::api::WatchEvent<Service>>> + Send>>;

/// Source of the cluster's node inventory
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// List nodes matching the selector, in the order the control plane returns them
    async fn list_nodes(&self, selector: &LabelSelector) -> kube::Result<Vec<Node>>;
}

/// Source of service watch subscriptions
#[async_trait]
pub trait ServiceSource: Send + Sync {
    /// Open a watch on services in `namespace` matching the selector
    async fn watch_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> kube::Result<RawServiceStream>;
}

/// Create a client, preferring in-cluster configuration over a kubeconfig file
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster configuration");
            config
        }
        Err(in_cluster) => {
            let path = kubeconfig.ok_or_else(|| {
                anyhow!(
                    "Not running inside a cluster ({}) and no kubeconfig given",
                    in_cluster
                )
            })?;
            debug!(error = %in_cluster, "In-cluster configuration unavailable");
            info!(path = %path.display(), "Using kubeconfig");

            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("Invalid kubeconfig {}", path.display()))?
        }
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Kubernetes API backed node and service sources
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeSource for KubeCluster {
    async fn list_nodes(&self, selector: &LabelSelector) -> kube::Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());

        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }

        Ok(nodes.list(&params).await?.items)
    }
}

#[async_trait]
impl ServiceSource for KubeCluster {
    async fn watch_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> kube::Result<RawServiceStream> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        let mut params = WatchParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }

        // Resource version "0" replays existing services as Added events
        let stream = services.watch(&params, "0").await?;
        Ok(Box::pin(stream))
    }
}
