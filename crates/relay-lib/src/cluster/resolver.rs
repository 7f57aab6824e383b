//! Node address resolution
//!
//! Scrape targets are built against a single node address resolved once
//! at startup: the internal address of the first node the control plane
//! lists.

use super::NodeSource;
use crate::selector::LabelSelector;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Node address type reachable from inside the cluster
pub const INTERNAL_IP: &str = "InternalIP";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to list nodes")]
    List(#[source] kube::Error),

    #[error("no nodes were found")]
    NoNodes,

    #[error("node {node} has no InternalIP address")]
    NoInternalAddress { node: String },
}

/// Resolves the address used as the host of every scrape target
pub struct AddressResolver {
    nodes: Arc<dyn NodeSource>,
    selector: LabelSelector,
}

impl AddressResolver {
    pub fn new(nodes: Arc<dyn NodeSource>, selector: LabelSelector) -> Self {
        Self { nodes, selector }
    }

    /// List nodes and return the internal address of the first one
    pub async fn resolve(&self) -> Result<String, ResolveError> {
        let nodes = self
            .nodes
            .list_nodes(&self.selector)
            .await
            .map_err(ResolveError::List)?;
        debug!(count = nodes.len(), selector = %self.selector, "Listed nodes");

        let address = internal_address(&nodes)?;
        info!(address = %address, "Resolved node address");
        Ok(address)
    }
}

/// Pick the first node and return its first internal address
///
/// A node with several `InternalIP` entries, such as a dual-stack node,
/// yields the first one listed rather than the last, so the primary
/// address family wins.
pub fn internal_address(nodes: &[Node]) -> Result<String, ResolveError> {
    let node = nodes.first().ok_or(ResolveError::NoNodes)?;

    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a.type_ == INTERNAL_IP && !a.address.is_empty())
        })
        .map(|a| a.address.clone())
        .ok_or_else(|| ResolveError::NoInternalAddress {
            node: node.metadata.name.clone().unwrap_or_default(),
        })
}
