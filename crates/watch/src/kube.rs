//! Thin kube-runtime wiring: list+watch streams feeding [`ClusterEvent`]s
//! into a watcher's ingest channel.

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::convert;
use crate::state::ClusterEvent;

/// Spawns one watch task per resource kind, all feeding `tx`.
pub fn spawn_cluster_watchers(client: Client, tx: mpsc::Sender<ClusterEvent>) {
    tokio::spawn(watch_services(client.clone(), tx.clone()));
    tokio::spawn(watch_endpoint_slices(client.clone(), tx.clone()));
    tokio::spawn(watch_pods(client.clone(), tx.clone()));
    tokio::spawn(watch_nodes(client.clone(), tx.clone()));
    tokio::spawn(watch_external_workloads(client, tx));
}

pub async fn watch_services(client: Client, tx: mpsc::Sender<ClusterEvent>) -> Result<()> {
    let api: Api<Service> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!("service watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(svc) => {
                if let Some(meta) = convert::service_meta(&svc) {
                    let _ = tx.send(ClusterEvent::ServiceApplied(meta)).await;
                }
            }
            Event::Deleted(svc) => {
                if let Some(meta) = convert::service_meta(&svc) {
                    let _ = tx.send(ClusterEvent::ServiceDeleted(meta.id)).await;
                }
            }
            Event::Restarted(list) => {
                for svc in &list {
                    if let Some(meta) = convert::service_meta(svc) {
                        let _ = tx.send(ClusterEvent::ServiceApplied(meta)).await;
                    }
                }
            }
        }
    }
    warn!("service watcher stream ended");
    Ok(())
}

pub async fn watch_endpoint_slices(client: Client, tx: mpsc::Sender<ClusterEvent>) -> Result<()> {
    let api: Api<EndpointSlice> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!("endpoint slice watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(slice) => {
                if let Some(rec) = convert::slice_rec(&slice) {
                    let _ = tx.send(ClusterEvent::SliceApplied(rec)).await;
                }
            }
            Event::Deleted(slice) => {
                if let (Some(namespace), Some(name)) =
                    (slice.metadata.namespace.clone(), slice.metadata.name.clone())
                {
                    let _ = tx.send(ClusterEvent::SliceDeleted { namespace, name }).await;
                }
            }
            Event::Restarted(list) => {
                for slice in &list {
                    if let Some(rec) = convert::slice_rec(slice) {
                        let _ = tx.send(ClusterEvent::SliceApplied(rec)).await;
                    }
                }
            }
        }
    }
    warn!("endpoint slice watcher stream ended");
    Ok(())
}

pub async fn watch_pods(client: Client, tx: mpsc::Sender<ClusterEvent>) -> Result<()> {
    let api: Api<Pod> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!("pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(pod) => {
                if let Some(meta) = convert::pod_meta(&pod) {
                    let _ = tx.send(ClusterEvent::PodApplied(meta)).await;
                }
            }
            Event::Deleted(pod) => {
                if let (Some(namespace), Some(name)) =
                    (pod.metadata.namespace.clone(), pod.metadata.name.clone())
                {
                    let _ = tx.send(ClusterEvent::PodDeleted { namespace, name }).await;
                }
            }
            Event::Restarted(list) => {
                for pod in &list {
                    if let Some(meta) = convert::pod_meta(pod) {
                        let _ = tx.send(ClusterEvent::PodApplied(meta)).await;
                    }
                }
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

pub async fn watch_nodes(client: Client, tx: mpsc::Sender<ClusterEvent>) -> Result<()> {
    let api: Api<Node> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!("node watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(node) => {
                if let Some((name, zone)) = convert::node_zone(&node) {
                    let _ = tx.send(ClusterEvent::NodeApplied { name, zone }).await;
                }
            }
            Event::Deleted(node) => {
                if let Some(name) = node.metadata.name.clone() {
                    let _ = tx.send(ClusterEvent::NodeDeleted { name }).await;
                }
            }
            Event::Restarted(list) => {
                for node in &list {
                    if let Some((name, zone)) = convert::node_zone(node) {
                        let _ = tx.send(ClusterEvent::NodeApplied { name, zone }).await;
                    }
                }
            }
        }
    }
    warn!("node watcher stream ended");
    Ok(())
}

/// External workloads are a custom resource, watched dynamically.
pub async fn watch_external_workloads(client: Client, tx: mpsc::Sender<ClusterEvent>) -> Result<()> {
    let gvk = GroupVersionKind {
        group: "workload.trellis.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "ExternalWorkload".to_string(),
    };
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!("external workload watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(obj) => {
                if let Some(meta) = convert::workload_meta(&obj) {
                    let _ = tx.send(ClusterEvent::WorkloadApplied(meta)).await;
                }
            }
            Event::Deleted(obj) => {
                if let (Some(namespace), Some(name)) =
                    (obj.metadata.namespace.clone(), obj.metadata.name.clone())
                {
                    let _ = tx.send(ClusterEvent::WorkloadDeleted { namespace, name }).await;
                }
            }
            Event::Restarted(list) => {
                for obj in &list {
                    if let Some(meta) = convert::workload_meta(obj) {
                        let _ = tx.send(ClusterEvent::WorkloadApplied(meta)).await;
                    }
                }
            }
        }
    }
    warn!("external workload watcher stream ended");
    Ok(())
}
