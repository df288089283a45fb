//! Federated membership scenarios: remote join, local leave and rejoin.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trellis_core::labels::{LOCAL_DISCOVERY_ANNOTATION, REMOTE_DISCOVERY_ANNOTATION};
use trellis_core::{Config, IpFamily, ServiceId, ServiceMeta, ServicePort, TargetPort};
use trellis_federation::FederatedServiceRegistry;
use trellis_proto::destination::{update, Update};
use trellis_stream::{StreamDispatcher, UpdateSink, ViewConfig};
use trellis_watch::{
    ClusterConfig, ClusterEvent, ClusterStore, EndpointSliceRec, EndpointsWatcher, SliceEndpoint,
    SlicePort,
};

struct ChannelSink(mpsc::UnboundedSender<Update>);

#[async_trait]
impl UpdateSink for ChannelSink {
    async fn send(&mut self, update: Update) -> anyhow::Result<()> {
        self.0
            .send(update)
            .map_err(|_| anyhow::anyhow!("update receiver dropped"))
    }
}

fn service(ns: &str, name: &str, port: u16) -> ServiceMeta {
    ServiceMeta {
        id: ServiceId::new(ns, name),
        external_name: false,
        ports: vec![ServicePort {
            port,
            name: None,
            target: TargetPort::Number(port),
        }],
        preferred_family: None,
        annotations: BTreeMap::new(),
        labels: BTreeMap::new(),
    }
}

fn slice(ns: &str, svc: &str, port: u16, ips: &[&str]) -> EndpointSliceRec {
    EndpointSliceRec {
        namespace: ns.to_string(),
        name: format!("{svc}-abc"),
        service: Some(svc.to_string()),
        family: IpFamily::V4,
        ports: vec![SlicePort { port, name: None }],
        endpoints: ips
            .iter()
            .map(|ip| SliceEndpoint::ready(ip.parse::<IpAddr>().unwrap()))
            .collect(),
    }
}

async fn backing_watcher(cluster: &str, ns: &str, svc: &str, port: u16, ips: &[&str]) -> Arc<EndpointsWatcher> {
    let watcher = Arc::new(EndpointsWatcher::new(cluster, true));
    watcher
        .handle_event(ClusterEvent::ServiceApplied(service(ns, svc, port)))
        .await;
    watcher
        .handle_event(ClusterEvent::SliceApplied(slice(ns, svc, port, ips)))
        .await;
    watcher
}

fn federated_meta(local: Option<&str>, remote: Option<&str>) -> ServiceMeta {
    let mut svc = service("test", "bb-federated", 8080);
    if let Some(local) = local {
        svc.annotations
            .insert(LOCAL_DISCOVERY_ANNOTATION.to_string(), local.to_string());
    }
    if let Some(remote) = remote {
        svc.annotations
            .insert(REMOTE_DISCOVERY_ANNOTATION.to_string(), remote.to_string());
    }
    svc
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Update>) -> Update {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("update stream closed")
}

async fn expect_add(rx: &mut mpsc::UnboundedReceiver<Update>, addr: &str) {
    loop {
        if let Some(update::Update::Add(set)) = recv(rx).await.update {
            let addrs: Vec<String> = set
                .addrs
                .iter()
                .filter_map(|a| a.addr.as_ref())
                .map(ToString::to_string)
                .collect();
            if addrs.iter().any(|a| a == addr) {
                return;
            }
        }
    }
}

async fn expect_remove(rx: &mut mpsc::UnboundedReceiver<Update>, addr: &str) {
    loop {
        if let Some(update::Update::Remove(set)) = recv(rx).await.update {
            if set.addrs.iter().any(|a| a.to_string() == addr) {
                return;
            }
        }
    }
}

struct Harness {
    registry: Arc<FederatedServiceRegistry>,
    dispatcher: Arc<StreamDispatcher>,
    cancel: CancellationToken,
    rx: mpsc::UnboundedReceiver<Update>,
}

async fn harness() -> Harness {
    let local = backing_watcher("local", "test", "bb", 8080, &["172.17.0.1"]).await;
    let clusters = Arc::new(ClusterStore::new());
    clusters
        .register(
            "east",
            backing_watcher("east", "test", "bb", 8080, &["172.17.1.1"]).await,
            ClusterConfig {
                trust_domain: "east.example".to_string(),
                cluster_domain: "cluster.east".to_string(),
            },
        )
        .await;
    clusters
        .register(
            "north",
            backing_watcher("north", "test", "bb", 8080, &["172.17.2.1"]).await,
            ClusterConfig {
                trust_domain: "north.example".to_string(),
                cluster_domain: "cluster.north".to_string(),
            },
        )
        .await;

    let registry = FederatedServiceRegistry::new(local, clusters);
    let dispatcher = StreamDispatcher::new(Duration::from_secs(10), || {});
    let (tx, rx) = mpsc::unbounded_channel();
    let d = dispatcher.clone();
    tokio::spawn(async move { d.process(&mut ChannelSink(tx)).await });

    Harness {
        registry,
        dispatcher,
        cancel: CancellationToken::new(),
        rx,
    }
}

#[tokio::test]
async fn remote_member_join_adds_its_endpoints() {
    let mut h = harness().await;
    let svc = federated_meta(Some("bb"), Some("bb@east"));
    let subscriber = h
        .registry
        .subscribe(
            &svc,
            8080,
            None,
            ViewConfig::from_config(&Config::default()),
            h.dispatcher.clone(),
            h.cancel.clone(),
        )
        .await
        .unwrap();
    assert_eq!(subscriber.view_count().await, 2);

    // Initial adds from the local and east members, in either order.
    let mut seen = HashSet::new();
    while seen.len() < 2 {
        if let Some(update::Update::Add(set)) = recv(&mut h.rx).await.update {
            for a in set.addrs.iter().filter_map(|a| a.addr.as_ref()) {
                seen.insert(a.to_string());
            }
        }
    }
    assert!(seen.contains("172.17.0.1:8080"));
    assert!(seen.contains("172.17.1.1:8080"));

    // north joins the membership.
    h.registry
        .apply_service(&federated_meta(Some("bb"), Some("bb@east,bb@north")))
        .await;
    assert_eq!(subscriber.view_count().await, 3);
    expect_add(&mut h.rx, "172.17.2.1:8080").await;

    h.registry.unsubscribe(&svc.id, &subscriber).await;
    assert_eq!(subscriber.view_count().await, 0);
    h.dispatcher.close().await;
}

#[tokio::test]
async fn local_member_leave_and_rejoin() {
    let mut h = harness().await;
    let svc = federated_meta(Some("bb"), Some("bb@east"));
    let subscriber = h
        .registry
        .subscribe(
            &svc,
            8080,
            None,
            ViewConfig::from_config(&Config::default()),
            h.dispatcher.clone(),
            h.cancel.clone(),
        )
        .await
        .unwrap();

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        if let Some(update::Update::Add(set)) = recv(&mut h.rx).await.update {
            for a in set.addrs.iter().filter_map(|a| a.addr.as_ref()) {
                seen.insert(a.to_string());
            }
        }
    }

    // Clearing local-discovery retracts the local endpoints.
    h.registry
        .apply_service(&federated_meta(None, Some("bb@east")))
        .await;
    expect_remove(&mut h.rx, "172.17.0.1:8080").await;
    assert_eq!(subscriber.view_count().await, 1);

    // Re-setting it brings them back.
    h.registry
        .apply_service(&federated_meta(Some("bb"), Some("bb@east")))
        .await;
    expect_add(&mut h.rx, "172.17.0.1:8080").await;
    assert_eq!(subscriber.view_count().await, 2);

    h.registry.unsubscribe(&svc.id, &subscriber).await;
    h.dispatcher.close().await;
}

#[tokio::test]
async fn missing_cluster_is_skipped_but_others_stay_live() {
    let mut h = harness().await;
    let svc = federated_meta(None, Some("bb@east,bb@nowhere"));
    let subscriber = h
        .registry
        .subscribe(
            &svc,
            8080,
            None,
            ViewConfig::from_config(&Config::default()),
            h.dispatcher.clone(),
            h.cancel.clone(),
        )
        .await
        .unwrap();

    // Only the resolvable member produced a view, and its endpoints flow.
    assert_eq!(subscriber.view_count().await, 1);
    expect_add(&mut h.rx, "172.17.1.1:8080").await;

    h.registry.unsubscribe(&svc.id, &subscriber).await;
    h.dispatcher.close().await;
}
