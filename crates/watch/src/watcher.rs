//! The per-cluster endpoints watcher: owns the topic registry and republishes
//! affected topics as cluster events arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::{DiscoveryError, ServiceId, ServiceMeta};

use crate::state::{ClusterEvent, ClusterState};
use crate::topic::{EndpointTopic, TopicKey};

/// Service lifecycle notifications forwarded to the federation layer.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Applied(ServiceMeta),
    Deleted(ServiceId),
}

/// Watches one cluster and multiplexes its endpoint state onto topics.
///
/// Topics are created lazily on first request and receive an initial
/// snapshot immediately, so a subscriber never has to poll for the current
/// state. Lock order is always topics before state.
pub struct EndpointsWatcher {
    cluster: String,
    state: RwLock<ClusterState>,
    topics: Mutex<FxHashMap<TopicKey, Arc<EndpointTopic>>>,
    service_events: Option<mpsc::Sender<ServiceEvent>>,
    closed: AtomicBool,
}

impl EndpointsWatcher {
    pub fn new(cluster: impl Into<String>, enable_endpoint_slices: bool) -> Self {
        let cluster = cluster.into();
        if !enable_endpoint_slices {
            warn!(
                cluster = %cluster,
                "legacy endpoints API is not supported; continuing with EndpointSlices"
            );
        }
        Self {
            cluster,
            state: RwLock::new(ClusterState::default()),
            topics: Mutex::new(FxHashMap::default()),
            service_events: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Forwards Service lifecycle events to `tx` (federation coordination).
    pub fn with_service_events(mut self, tx: mpsc::Sender<ServiceEvent>) -> Self {
        self.service_events = Some(tx);
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Returns the shared topic for `(service, port, instance)`, creating it
    /// with an initial snapshot on first use.
    pub async fn topic(
        &self,
        id: &ServiceId,
        port: u16,
        instance: Option<&str>,
    ) -> Result<Arc<EndpointTopic>, DiscoveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::TopicClosed);
        }
        {
            let state = self.state.read().await;
            if let Some(svc) = state.service(id) {
                if svc.external_name {
                    return Err(DiscoveryError::InvalidService(
                        id.clone(),
                        "ExternalName services have no endpoints".to_string(),
                    ));
                }
                if svc.port(port).is_none() {
                    return Err(DiscoveryError::InvalidService(
                        id.clone(),
                        format!("port {port} is not exposed"),
                    ));
                }
            }
        }

        let key = TopicKey {
            service: id.clone(),
            port,
            instance: instance.map(ToString::to_string),
        };
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get(&key) {
            return Ok(topic.clone());
        }
        let topic = EndpointTopic::new(key.clone());
        let initial = self
            .state
            .read()
            .await
            .build(&key.service, key.port, key.instance.as_deref());
        topic.publish_state(initial);
        debug!(cluster = %self.cluster, topic = %key, "topic created");
        topics.insert(key, topic.clone());
        Ok(topic)
    }

    /// Convenience wrapper pairing [`EndpointsWatcher::topic`] with
    /// [`EndpointTopic::subscribe`]. Dropping the receiver unsubscribes.
    pub async fn subscribe(
        &self,
        id: &ServiceId,
        port: u16,
        instance: Option<&str>,
    ) -> Result<(Arc<EndpointTopic>, tokio::sync::watch::Receiver<u64>), DiscoveryError> {
        let topic = self.topic(id, port, instance).await?;
        let rx = topic.subscribe()?;
        Ok((topic, rx))
    }

    pub async fn service(&self, id: &ServiceId) -> Option<ServiceMeta> {
        self.state.read().await.service(id).cloned()
    }

    pub async fn node_zone(&self, node: &str) -> Option<String> {
        self.state.read().await.node_zone(node)
    }

    /// Ingests one cluster event and republishes every affected topic.
    pub async fn handle_event(&self, event: ClusterEvent) {
        if let Some(tx) = &self.service_events {
            let forwarded = match &event {
                ClusterEvent::ServiceApplied(meta) => Some(ServiceEvent::Applied(meta.clone())),
                ClusterEvent::ServiceDeleted(id) => Some(ServiceEvent::Deleted(id.clone())),
                _ => None,
            };
            if let Some(ev) = forwarded {
                if tx.send(ev).await.is_err() {
                    debug!(cluster = %self.cluster, "service event receiver gone");
                }
            }
        }

        let affected = self.state.write().await.apply(event);
        for id in affected {
            self.republish(&id).await;
        }
    }

    async fn republish(&self, id: &ServiceId) {
        let topics: Vec<Arc<EndpointTopic>> = {
            let topics = self.topics.lock().await;
            topics
                .values()
                .filter(|t| t.key().service == *id)
                .cloned()
                .collect()
        };
        if topics.is_empty() {
            return;
        }
        let state = self.state.read().await;
        for topic in topics {
            let key = topic.key();
            topic.publish_state(state.build(&key.service, key.port, key.instance.as_deref()));
        }
    }

    /// Consumes events until cancellation or channel close, then closes all
    /// topics.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ClusterEvent>, cancel: CancellationToken) {
        info!(cluster = %self.cluster, "endpoints watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        self.close().await;
        info!(cluster = %self.cluster, "endpoints watcher stopped");
    }

    /// Idempotent: closes every topic and rejects new ones.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut topics = self.topics.lock().await;
        for topic in topics.values() {
            topic.close();
        }
        topics.clear();
    }
}
