//! The `Get` entry point: resolves an authority to one or more topics,
//! attaches views to a per-stream dispatcher and drives the stream until the
//! client goes away or the stream is reset.

#![forbid(unsafe_code)]

pub mod authority;
pub mod context;
pub mod telemetry;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_core::labels::{REMOTE_DISCOVERY_LABEL, REMOTE_SERVICE_LABEL};
use trellis_core::{Config, DiscoveryError, ServiceId, ServiceMeta};
use trellis_federation::{FederatedServiceRegistry, FederatedSubscriber};
use trellis_proto::destination::GetDestination;
use trellis_stream::{StreamDispatcher, UpdateSink, ViewConfig};
use trellis_watch::{ClusterEvent, ClusterStore, EndpointsWatcher};

pub use authority::{parse_authority, Authority};
pub use context::ContextToken;

/// Handles the ingest side of a spawned core.
pub struct CoreHandles {
    /// Feed of local-cluster events (from kube watchers or a test harness).
    pub cluster_events: mpsc::Sender<ClusterEvent>,
    pub shutdown: CancellationToken,
}

/// The streaming endpoint-discovery service.
pub struct DestinationServer {
    config: Arc<Config>,
    local: Arc<EndpointsWatcher>,
    clusters: Arc<ClusterStore>,
    federated: Arc<FederatedServiceRegistry>,
    shutdown: CancellationToken,
}

impl DestinationServer {
    pub fn new(
        config: Config,
        local: Arc<EndpointsWatcher>,
        clusters: Arc<ClusterStore>,
        federated: Arc<FederatedServiceRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            local,
            clusters,
            federated,
            shutdown,
        }
    }

    /// Wires a complete core for the local cluster: the watcher ingest loop
    /// and the federation registry, both bound to a fresh shutdown token.
    pub fn spawn(config: Config) -> (Arc<Self>, CoreHandles) {
        let shutdown = CancellationToken::new();
        let queue_cap = std::env::var("TRELLIS_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(1024);

        let (service_tx, service_rx) = mpsc::channel(queue_cap);
        let local = Arc::new(
            EndpointsWatcher::new("local", config.enable_endpoint_slices)
                .with_service_events(service_tx),
        );
        let (event_tx, event_rx) = mpsc::channel(queue_cap);
        tokio::spawn(local.clone().run(event_rx, shutdown.child_token()));

        let clusters = Arc::new(ClusterStore::new());
        let federated = FederatedServiceRegistry::new(local.clone(), clusters.clone());
        tokio::spawn(federated.clone().run(service_rx, shutdown.child_token()));

        let server = Arc::new(Self {
            config: Arc::new(config),
            local,
            clusters,
            federated,
            shutdown: shutdown.clone(),
        });
        (
            server,
            CoreHandles {
                cluster_events: event_tx,
                shutdown,
            },
        )
    }

    pub fn watcher(&self) -> Arc<EndpointsWatcher> {
        self.local.clone()
    }

    pub fn cluster_store(&self) -> Arc<ClusterStore> {
        self.clusters.clone()
    }

    /// Serves one `Get` stream on `sink` until server shutdown, client
    /// cancellation or a stream reset.
    ///
    /// Errors before the stream is established surface with their status
    /// code; a downstream send failure is logged and ends the stream
    /// cleanly, since the client is gone anyway.
    pub async fn get<S: UpdateSink + 'static>(
        &self,
        request: GetDestination,
        sink: S,
        client: CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let authority = parse_authority(&request.path, &self.config.cluster_domain)?;
        let token = ContextToken::parse(&request.context_token);
        let id = ServiceId::new(authority.namespace.clone(), authority.name.clone());
        let svc = self
            .local
            .service(&id)
            .await
            .ok_or_else(|| DiscoveryError::ServiceNotFound(id.clone()))?;
        if svc.external_name {
            return Err(DiscoveryError::InvalidAuthority(format!(
                "{id} is an ExternalName service"
            )));
        }

        let mut cfg = ViewConfig::from_config(&self.config);
        if !token.node_name.is_empty() {
            cfg.node_zone = self.local.node_zone(&token.node_name).await;
            cfg.node_name = Some(token.node_name.clone());
        }
        cfg.service_fqdn = format!(
            "{}.{}.svc.{}",
            authority.name, authority.namespace, self.config.cluster_domain
        );

        // Reset cancels the stream token; everything below observes it.
        let stream_cancel = client.child_token();
        let reset_target = stream_cancel.clone();
        let dispatcher = StreamDispatcher::new(self.config.stream_send_timeout, move || {
            reset_target.cancel()
        });

        let mut sink = sink;
        let consumer = dispatcher.clone();
        let mut process = tokio::spawn(async move { consumer.process(&mut sink).await });

        info!(authority = %request.path, node = %token.node_name, "destination stream opened");
        let subscriber = match self
            .attach(&svc, &authority, cfg, &dispatcher, &stream_cancel)
            .await
        {
            Ok(subscriber) => subscriber,
            Err(error) => {
                dispatcher.close().await;
                process.abort();
                return Err(error);
            }
        };

        let finished = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            _ = stream_cancel.cancelled() => None,
            result = &mut process => Some(result),
        };

        // Teardown order matters: views close before the dispatcher, the
        // dispatcher before the consumer is reaped.
        if let Some(subscriber) = &subscriber {
            self.federated.unsubscribe(&id, subscriber).await;
        }
        dispatcher.close().await;
        let result = match finished {
            Some(result) => result,
            None => {
                process.abort();
                process.await
            }
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(authority = %request.path, %error, "stream send failed; client likely gone");
            }
            Err(join) if join.is_cancelled() => {}
            Err(join) => warn!(authority = %request.path, error = %join, "stream send task panicked"),
        }
        info!(authority = %request.path, "destination stream closed");
        Ok(())
    }

    /// Chooses the path for the authority and attaches the matching views.
    async fn attach(
        &self,
        svc: &ServiceMeta,
        authority: &Authority,
        cfg: ViewConfig,
        dispatcher: &Arc<StreamDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<FederatedSubscriber>>, DiscoveryError> {
        if trellis_federation::is_federated(svc) {
            let subscriber = self
                .federated
                .subscribe(
                    svc,
                    authority.port,
                    authority.instance.clone(),
                    cfg,
                    dispatcher.clone(),
                    cancel.clone(),
                )
                .await?;
            return Ok(Some(subscriber));
        }

        if let Some(cluster) = svc.labels.get(REMOTE_DISCOVERY_LABEL) {
            let remote_name = svc.labels.get(REMOTE_SERVICE_LABEL).ok_or_else(|| {
                DiscoveryError::MisconfiguredRemote(format!(
                    "service {} is missing the remote-service label",
                    svc.id
                ))
            })?;
            let (watcher, cluster_cfg) = self
                .clusters
                .get(cluster)
                .await
                .ok_or_else(|| DiscoveryError::ClusterNotFound(cluster.clone()))?;
            let remote_id = ServiceId::new(svc.id.namespace.clone(), remote_name.clone());
            let topic = watcher
                .topic(&remote_id, authority.port, authority.instance.as_deref())
                .await?;
            let mut cfg = cfg;
            cfg.identity_trust_domain = cluster_cfg.trust_domain.clone();
            cfg.enable_endpoint_filtering = false;
            cfg.service_fqdn = format!(
                "{}.{}.svc.{}",
                remote_id.name, remote_id.namespace, cluster_cfg.cluster_domain
            );
            dispatcher.new_endpoint_view(cancel, topic, cfg).await?;
            return Ok(None);
        }

        let topic = self
            .local
            .topic(&svc.id, authority.port, authority.instance.as_deref())
            .await?;
        dispatcher.new_endpoint_view(cancel, topic, cfg).await?;
        Ok(None)
    }
}
