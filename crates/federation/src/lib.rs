//! Federated services: one subscriber, many member views.
//!
//! A federated service unions a local service and/or services in remote
//! clusters, declared through annotations on the authority's Service. The
//! registry keeps one record per federated service and reshapes every
//! subscriber's view set as those annotations change.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::labels::{LOCAL_DISCOVERY_ANNOTATION, REMOTE_DISCOVERY_ANNOTATION};
use trellis_core::{DiscoveryError, ServiceId, ServiceMeta};
use trellis_stream::{EndpointView, StreamDispatcher, ViewConfig};
use trellis_watch::{ClusterStore, EndpointsWatcher, ServiceEvent};

/// One `svc@cluster` member of a federated service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub service: String,
    pub cluster: String,
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service, self.cluster)
    }
}

/// Parses the remote-discovery annotation value. Malformed entries are
/// logged and skipped; the rest of the list stays usable.
pub fn parse_remote_targets(raw: &str) -> Vec<RemoteTarget> {
    let mut targets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('@') {
            Some((service, cluster)) if !service.is_empty() && !cluster.is_empty() => {
                let target = RemoteTarget {
                    service: service.to_string(),
                    cluster: cluster.to_string(),
                };
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            _ => warn!(entry, "ignoring malformed remote-discovery entry"),
        }
    }
    targets
}

/// Whether a service's annotations put it on the federated path.
pub fn is_federated(svc: &ServiceMeta) -> bool {
    svc.annotations.contains_key(LOCAL_DISCOVERY_ANNOTATION)
        || svc.annotations.contains_key(REMOTE_DISCOVERY_ANNOTATION)
}

fn annotation_sets(svc: &ServiceMeta) -> (Option<String>, Vec<RemoteTarget>) {
    let local = svc
        .annotations
        .get(LOCAL_DISCOVERY_ANNOTATION)
        .filter(|v| !v.is_empty())
        .cloned();
    let remote = svc
        .annotations
        .get(REMOTE_DISCOVERY_ANNOTATION)
        .map(|raw| parse_remote_targets(raw))
        .unwrap_or_default();
    (local, remote)
}

/// One stream subscribed to a federated service: its dispatcher plus the
/// member views currently open on its behalf.
pub struct FederatedSubscriber {
    service: ServiceId,
    port: u16,
    instance: Option<String>,
    cfg: ViewConfig,
    dispatcher: Arc<StreamDispatcher>,
    cancel: CancellationToken,
    local_views: Mutex<FxHashMap<String, Arc<EndpointView>>>,
    remote_views: Mutex<FxHashMap<RemoteTarget, Arc<EndpointView>>>,
}

impl FederatedSubscriber {
    pub async fn view_count(&self) -> usize {
        self.local_views.lock().await.len() + self.remote_views.lock().await.len()
    }
}

struct FederatedService {
    local_discovery: Option<String>,
    remote_discovery: Vec<RemoteTarget>,
    subscribers: Vec<Arc<FederatedSubscriber>>,
}

/// Registry of federated services, fed by Service events from the local
/// watcher.
pub struct FederatedServiceRegistry {
    local: Arc<EndpointsWatcher>,
    clusters: Arc<ClusterStore>,
    services: Mutex<FxHashMap<ServiceId, FederatedService>>,
}

impl FederatedServiceRegistry {
    pub fn new(local: Arc<EndpointsWatcher>, clusters: Arc<ClusterStore>) -> Arc<Self> {
        Arc::new(Self {
            local,
            clusters,
            services: Mutex::new(FxHashMap::default()),
        })
    }

    /// Attaches one stream to a federated service, opening views for the
    /// current membership.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        svc: &ServiceMeta,
        port: u16,
        instance: Option<String>,
        cfg: ViewConfig,
        dispatcher: Arc<StreamDispatcher>,
        cancel: CancellationToken,
    ) -> Result<Arc<FederatedSubscriber>, DiscoveryError> {
        let (local, remote) = annotation_sets(svc);
        let subscriber = Arc::new(FederatedSubscriber {
            service: svc.id.clone(),
            port,
            instance,
            cfg,
            dispatcher,
            cancel,
            local_views: Mutex::new(FxHashMap::default()),
            remote_views: Mutex::new(FxHashMap::default()),
        });

        if let Some(name) = &local {
            self.open_local(&subscriber, name).await;
        }
        for target in &remote {
            self.open_remote(&subscriber, target).await;
        }

        let mut services = self.services.lock().await;
        let record = services
            .entry(svc.id.clone())
            .or_insert_with(|| FederatedService {
                local_discovery: None,
                remote_discovery: Vec::new(),
                subscribers: Vec::new(),
            });
        record.local_discovery = local;
        record.remote_discovery = remote;
        record.subscribers.push(subscriber.clone());
        info!(service = %svc.id, subscribers = record.subscribers.len(), "federated subscriber attached");
        Ok(subscriber)
    }

    /// Tears down every view belonging to the subscriber, then forgets it.
    pub async fn unsubscribe(&self, id: &ServiceId, subscriber: &Arc<FederatedSubscriber>) {
        {
            let mut services = self.services.lock().await;
            if let Some(record) = services.get_mut(id) {
                record
                    .subscribers
                    .retain(|s| !Arc::ptr_eq(s, subscriber));
                if record.subscribers.is_empty() {
                    services.remove(id);
                }
            }
        }
        let local: Vec<Arc<EndpointView>> =
            subscriber.local_views.lock().await.drain().map(|(_, v)| v).collect();
        for view in local {
            view.close().await;
        }
        let remote: Vec<Arc<EndpointView>> =
            subscriber.remote_views.lock().await.drain().map(|(_, v)| v).collect();
        for view in remote {
            view.close().await;
        }
        debug!(service = %id, "federated subscriber detached");
    }

    /// Reacts to a Service change: updates the membership record and
    /// reshapes every subscriber's views accordingly.
    pub async fn apply_service(&self, svc: &ServiceMeta) {
        let (new_local, new_remote) = annotation_sets(svc);
        let (old_local, old_remote, subscribers) = {
            let mut services = self.services.lock().await;
            let Some(record) = services.get_mut(&svc.id) else {
                return;
            };
            let old_local = record.local_discovery.clone();
            let old_remote = record.remote_discovery.clone();
            record.local_discovery = new_local.clone();
            record.remote_discovery = new_remote.clone();
            (old_local, old_remote, record.subscribers.clone())
        };

        if old_local == new_local && old_remote == new_remote {
            return;
        }
        info!(
            service = %svc.id,
            local = ?new_local,
            remote = %new_remote.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            "federated membership changed"
        );

        for subscriber in &subscribers {
            if old_local != new_local {
                if let Some(previous) = &old_local {
                    self.close_local(subscriber, previous).await;
                }
                if let Some(next) = &new_local {
                    self.open_local(subscriber, next).await;
                }
            }
            for target in old_remote.iter().filter(|t| !new_remote.contains(t)) {
                self.close_remote(subscriber, target).await;
            }
            for target in new_remote.iter().filter(|t| !old_remote.contains(t)) {
                self.open_remote(subscriber, target).await;
            }
        }
    }

    /// A deleted Service loses all members; subscribers stay attached and
    /// see their endpoints retracted.
    pub async fn remove_service(&self, id: &ServiceId) {
        let stripped = ServiceMeta {
            id: id.clone(),
            external_name: false,
            ports: Vec::new(),
            preferred_family: None,
            annotations: Default::default(),
            labels: Default::default(),
        };
        self.apply_service(&stripped).await;
    }

    /// Consumes Service events until cancellation.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ServiceEvent>, cancel: CancellationToken) {
        info!("federated service registry started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(ServiceEvent::Applied(svc)) => self.apply_service(&svc).await,
                    Some(ServiceEvent::Deleted(id)) => self.remove_service(&id).await,
                    None => break,
                },
            }
        }
        info!("federated service registry stopped");
    }

    async fn open_local(&self, subscriber: &Arc<FederatedSubscriber>, name: &str) {
        let id = ServiceId::new(subscriber.service.namespace.clone(), name);
        let topic = match self
            .local
            .topic(&id, subscriber.port, subscriber.instance.as_deref())
            .await
        {
            Ok(topic) => topic,
            Err(error) => {
                warn!(service = %id, %error, "failed to open local discovery topic");
                return;
            }
        };
        match subscriber
            .dispatcher
            .new_endpoint_view(&subscriber.cancel, topic, subscriber.cfg.clone())
            .await
        {
            Ok(view) => {
                subscriber
                    .local_views
                    .lock()
                    .await
                    .insert(name.to_string(), view);
                debug!(service = %id, "local discovery view opened");
            }
            Err(error) => warn!(service = %id, %error, "failed to open local discovery view"),
        }
    }

    async fn close_local(&self, subscriber: &Arc<FederatedSubscriber>, name: &str) {
        let view = subscriber.local_views.lock().await.remove(name);
        if let Some(view) = view {
            view.no_endpoints(false).await;
            view.close().await;
            debug!(service = %name, "local discovery view closed");
        }
    }

    async fn open_remote(&self, subscriber: &Arc<FederatedSubscriber>, target: &RemoteTarget) {
        let Some((watcher, cluster_cfg)) = self.clusters.get(&target.cluster).await else {
            warn!(target = %target, "remote cluster not found; skipping member");
            return;
        };
        let id = ServiceId::new(subscriber.service.namespace.clone(), target.service.clone());
        let topic = match watcher
            .topic(&id, subscriber.port, subscriber.instance.as_deref())
            .await
        {
            Ok(topic) => topic,
            Err(error) => {
                warn!(target = %target, %error, "failed to open remote discovery topic");
                return;
            }
        };

        // Remote members authenticate against their own cluster and their
        // zone hints are meaningless here.
        let mut cfg = subscriber.cfg.clone();
        cfg.identity_trust_domain = cluster_cfg.trust_domain.clone();
        cfg.enable_endpoint_filtering = false;
        cfg.service_fqdn = format!(
            "{}.{}.svc.{}",
            target.service, id.namespace, cluster_cfg.cluster_domain
        );

        match subscriber
            .dispatcher
            .new_endpoint_view(&subscriber.cancel, topic, cfg)
            .await
        {
            Ok(view) => {
                subscriber
                    .remote_views
                    .lock()
                    .await
                    .insert(target.clone(), view);
                debug!(target = %target, "remote discovery view opened");
            }
            Err(error) => warn!(target = %target, %error, "failed to open remote discovery view"),
        }
    }

    async fn close_remote(&self, subscriber: &Arc<FederatedSubscriber>, target: &RemoteTarget) {
        let view = subscriber.remote_views.lock().await.remove(target);
        if let Some(view) = view {
            view.no_endpoints(false).await;
            view.close().await;
            debug!(target = %target, "remote discovery view closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_targets_parse_and_dedup() {
        let targets = parse_remote_targets("bb@east, bb@north,bb@east,,junk,@x,y@");
        assert_eq!(
            targets,
            vec![
                RemoteTarget { service: "bb".into(), cluster: "east".into() },
                RemoteTarget { service: "bb".into(), cluster: "north".into() },
            ]
        );
    }

    #[test]
    fn federated_detection_by_annotation() {
        let mut svc = ServiceMeta {
            id: ServiceId::new("test", "bb-federated"),
            external_name: false,
            ports: Vec::new(),
            preferred_family: None,
            annotations: Default::default(),
            labels: Default::default(),
        };
        assert!(!is_federated(&svc));
        svc.annotations
            .insert(REMOTE_DISCOVERY_ANNOTATION.to_string(), "bb@east".to_string());
        assert!(is_federated(&svc));
    }
}
