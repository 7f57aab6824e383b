//! Service discovery through the control plane's watch API
//!
//! A subscription is scoped to one namespace and an exact-match label
//! selector. Raw notifications are normalized into [`WatchEvent`]s and
//! pumped into a channel by a background task. The subscription is not
//! restarted when the control plane closes it: the event sequence simply
//! ends and the consumer decides what to do next.

use super::{RawServiceStream, ServiceSource};
use crate::models::{ServiceDescriptor, ServicePort, WatchEvent};
use crate::selector::LabelSelector;
use k8s_openapi::api::core::v1::Service;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Events buffered between the pump task and the consumer
const EVENT_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch services in namespace {namespace} with selector {selector:?}")]
    Subscribe {
        namespace: String,
        selector: String,
        #[source]
        source: kube::Error,
    },

    #[error("service watcher has been stopped")]
    Stopped,
}

/// Returns the default namespace if `namespace` is empty
pub fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Watches services matching a label selector
pub struct ServiceWatcher {
    source: Arc<dyn ServiceSource>,
    shutdown: CancellationToken,
}

impl ServiceWatcher {
    /// Create a watcher that ends its subscriptions when `shutdown` is cancelled
    pub fn new(source: Arc<dyn ServiceSource>, shutdown: CancellationToken) -> Self {
        Self { source, shutdown }
    }

    /// Subscribe to services in `namespace` matching `selector`
    pub async fn watch(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchEvents, WatchError> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::Stopped);
        }

        let namespace = namespace_or_default(namespace);
        let raw = self
            .source
            .watch_services(namespace, selector)
            .await
            .map_err(|source| WatchError::Subscribe {
                namespace: namespace.to_string(),
                selector: selector.to_query(),
                source,
            })?;

        info!(namespace = %namespace, selector = %selector, "Watching services");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(pump(raw, tx, self.shutdown.clone()));

        Ok(WatchEvents {
            rx,
            task: Some(task),
        })
    }

    /// Stop every subscription. Safe to call more than once.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping service watcher");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Typed event sequence of one subscription
///
/// The sequence ends when the control plane closes the stream or the
/// watcher is stopped. Dropping it ends the subscription.
pub struct WatchEvents {
    rx: mpsc::Receiver<WatchEvent>,
    task: Option<JoinHandle<()>>,
}

impl WatchEvents {
    /// Wrap an existing channel, e.g. one fed by a test
    pub fn from_receiver(rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx, task: None }
    }

    /// Wait for the next event; `None` once the sequence has ended
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Drop for WatchEvents {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Move raw notifications into the channel until the stream ends,
/// the watcher is stopped or the consumer goes away
async fn pump(
    mut raw: RawServiceStream,
    tx: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
) {
    let mut delivered = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(delivered, "Watch stopped");
                return;
            }
            next = raw.next() => next,
        };

        let Some(item) = next else {
            info!(delivered, "Watch stream closed");
            return;
        };

        let Some(event) = normalize(item) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(delivered, "Watch stopped");
                return;
            }
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!(delivered, "Event consumer went away");
                    return;
                }
                delivered += 1;
            }
        }
    }
}

/// Convert a raw notification; bookmarks yield `None`
pub fn normalize(item: kube::Result<kube::api::WatchEvent<Service>>) -> Option<WatchEvent> {
    use kube::api::WatchEvent as Raw;

    let event = match item {
        Ok(Raw::Added(svc)) => {
            describe_service(&svc).map_or_else(WatchEvent::Error, WatchEvent::Added)
        }
        Ok(Raw::Modified(svc)) => {
            describe_service(&svc).map_or_else(WatchEvent::Error, WatchEvent::Modified)
        }
        Ok(Raw::Deleted(svc)) => {
            describe_service(&svc).map_or_else(WatchEvent::Error, WatchEvent::Deleted)
        }
        Ok(Raw::Bookmark(bookmark)) => {
            debug!(resource_version = %bookmark.metadata.resource_version, "Watch bookmark");
            return None;
        }
        Ok(Raw::Error(status)) => WatchEvent::Error(format!(
            "{} ({}): {}",
            status.reason, status.code, status.message
        )),
        Err(e) => {
            warn!(error = %e, "Failed to read watch notification");
            WatchEvent::Error(e.to_string())
        }
    };

    Some(event)
}

/// Extract the descriptor the relay needs from a service object
pub fn describe_service(svc: &Service) -> Result<ServiceDescriptor, String> {
    let name = svc
        .metadata
        .name
        .clone()
        .ok_or_else(|| "service without a name".to_string())?;
    let namespace = svc
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    let mut ports = Vec::new();
    for p in svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten()
    {
        let port = u16::try_from(p.port)
            .map_err(|_| format!("service {}/{} has invalid port {}", namespace, name, p.port))?;

        ports.push(ServicePort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            port,
            node_port: p.node_port.and_then(|np| u16::try_from(np).ok()),
        });
    }

    Ok(ServiceDescriptor {
        name,
        namespace,
        labels: svc.metadata.labels.clone().unwrap_or_default(),
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ServicePort as K8sServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::WatchEvent as Raw;
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn service(name: &str, ports: &[(i32, Option<i32>)]) -> Service {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "node-exporter".to_string());

        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("monitoring".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, node_port)| K8sServicePort {
                            name: Some("metrics".to_string()),
                            protocol: Some("TCP".to_string()),
                            port: *port,
                            node_port: *node_port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_error(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: reason.to_string(),
            code,
        }
    }

    /// Service source replaying a fixed list of raw notifications
    struct ScriptedSource {
        events: Mutex<Option<Vec<kube::Result<Raw<Service>>>>>,
        endless: bool,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedSource {
        fn new(events: Vec<kube::Result<Raw<Service>>>, endless: bool) -> Self {
            Self {
                events: Mutex::new(Some(events)),
                endless,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ServiceSource for ScriptedSource {
        async fn watch_services(
            &self,
            namespace: &str,
            selector: &LabelSelector,
        ) -> kube::Result<RawServiceStream> {
            self.requests
                .lock()
                .unwrap()
                .push((namespace.to_string(), selector.to_query()));

            let events = self.events.lock().unwrap().take().unwrap_or_default();
            let stream = tokio_stream::iter(events);
            if self.endless {
                Ok(Box::pin(stream.chain(tokio_stream::pending())))
            } else {
                Ok(Box::pin(stream))
            }
        }
    }

    /// Service source whose subscriptions are always rejected
    struct RejectingSource;

    #[async_trait]
    impl ServiceSource for RejectingSource {
        async fn watch_services(
            &self,
            _namespace: &str,
            _selector: &LabelSelector,
        ) -> kube::Result<RawServiceStream> {
            Err(kube::Error::Api(api_error(403, "Forbidden")))
        }
    }

    #[test]
    fn test_describe_service() {
        let descriptor =
            describe_service(&service("ne-1", &[(9100, None), (9101, Some(30901))])).unwrap();

        assert_eq!(descriptor.name, "ne-1");
        assert_eq!(descriptor.namespace, "monitoring");
        assert_eq!(descriptor.labels["app"], "node-exporter");
        assert_eq!(descriptor.ports.len(), 2);
        assert_eq!(descriptor.ports[0].port, 9100);
        assert_eq!(descriptor.ports[0].node_port, None);
        assert_eq!(descriptor.ports[1].node_port, Some(30901));
        assert_eq!(descriptor.ports[1].name.as_deref(), Some("metrics"));
    }

    #[test]
    fn test_describe_service_without_ports() {
        let mut svc = service("headless", &[]);
        svc.spec = None;

        let descriptor = describe_service(&svc).unwrap();
        assert!(descriptor.ports.is_empty());
    }

    #[test]
    fn test_describe_service_without_name() {
        let mut svc = service("x", &[(9100, None)]);
        svc.metadata.name = None;
        assert!(describe_service(&svc).is_err());
    }

    #[test]
    fn test_normalize_event_kinds() {
        let added = normalize(Ok(Raw::Added(service("ne-1", &[(9100, None)])))).unwrap();
        assert_eq!(added.kind(), "added");

        let modified = normalize(Ok(Raw::Modified(service("ne-1", &[(9100, None)])))).unwrap();
        assert_eq!(modified.kind(), "modified");

        let deleted = normalize(Ok(Raw::Deleted(service("ne-1", &[(9100, None)])))).unwrap();
        assert_eq!(deleted.kind(), "deleted");

        match normalize(Ok(Raw::Error(api_error(410, "Expired")))) {
            Some(WatchEvent::Error(message)) => assert!(message.contains("Expired (410)")),
            other => panic!("unexpected event: {:?}", other),
        }

        let transport = normalize(Err(kube::Error::Api(api_error(500, "InternalError"))));
        assert!(matches!(transport, Some(WatchEvent::Error(_))));
    }

    #[test]
    fn test_namespace_or_default() {
        assert_eq!(namespace_or_default(""), "default");
        assert_eq!(namespace_or_default("monitoring"), "monitoring");
    }

    #[tokio::test]
    async fn test_watch_delivers_events_in_order_then_ends() {
        let source = Arc::new(ScriptedSource::new(
            vec![
                Ok(Raw::Added(service("a", &[(9100, None)]))),
                Ok(Raw::Modified(service("b", &[(9100, None)]))),
                Ok(Raw::Deleted(service("c", &[(9100, None)]))),
            ],
            false,
        ));
        let watcher = ServiceWatcher::new(source.clone(), CancellationToken::new());
        let selector: LabelSelector = "app:node-exporter".parse().unwrap();

        let mut events = watcher.watch("", &selector).await.unwrap();

        let names: Vec<String> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.service().unwrap().name.clone())
        .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(events.recv().await.is_none());

        assert_eq!(
            *source.requests.lock().unwrap(),
            vec![("default".to_string(), "app=node-exporter".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stop_ends_sequence() {
        let source = Arc::new(ScriptedSource::new(
            vec![Ok(Raw::Added(service("a", &[(9100, None)])))],
            true,
        ));
        let watcher = ServiceWatcher::new(source, CancellationToken::new());
        let mut events = watcher
            .watch("monitoring", &LabelSelector::new())
            .await
            .unwrap();

        assert!(events.recv().await.is_some());

        watcher.stop();
        watcher.stop();
        assert!(watcher.is_stopped());

        let next = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("sequence should end after stop");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_watch_after_stop_is_rejected() {
        let source = Arc::new(ScriptedSource::new(vec![], false));
        let watcher = ServiceWatcher::new(source, CancellationToken::new());
        watcher.stop();

        let result = watcher.watch("monitoring", &LabelSelector::new()).await;
        assert!(matches!(result, Err(WatchError::Stopped)));
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let watcher = ServiceWatcher::new(Arc::new(RejectingSource), CancellationToken::new());
        let selector: LabelSelector = "app:node-exporter".parse().unwrap();

        match watcher.watch("monitoring", &selector).await {
            Err(WatchError::Subscribe {
                namespace,
                selector,
                ..
            }) => {
                assert_eq!(namespace, "monitoring");
                assert_eq!(selector, "app=node-exporter");
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("subscription should fail"),
        }
    }
}
