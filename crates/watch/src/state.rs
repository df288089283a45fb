//! In-memory cluster state and snapshot construction.
//!
//! The informer machinery stays outside this crate; events arrive as already
//! shaped records (see [`crate::convert`]) so the state can be driven
//! directly in tests.

use std::net::IpAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use trellis_core::labels::OPAQUE_PORTS_ANNOTATION;
use trellis_core::{
    Address, AddressSet, EndpointsState, IpFamily, PodMeta, ServiceId, ServiceMeta, ServicePort,
    TargetPort, WorkloadMeta,
};

/// One typed event from the cluster watchers (or a test harness).
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    ServiceApplied(ServiceMeta),
    ServiceDeleted(ServiceId),
    SliceApplied(EndpointSliceRec),
    SliceDeleted { namespace: String, name: String },
    PodApplied(Arc<PodMeta>),
    PodDeleted { namespace: String, name: String },
    NodeApplied { name: String, zone: Option<String> },
    NodeDeleted { name: String },
    WorkloadApplied(Arc<WorkloadMeta>),
    WorkloadDeleted { namespace: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePort {
    pub port: u16,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceEndpoint {
    pub addresses: Vec<IpAddr>,
    pub hostname: Option<String>,
    pub zone: Option<String>,
    pub zone_hints: SmallVec<[String; 4]>,
    pub ready: bool,
    pub node_name: Option<String>,
    pub target_pod: Option<String>,
    pub target_workload: Option<String>,
}

impl SliceEndpoint {
    pub fn ready(ip: IpAddr) -> Self {
        Self {
            addresses: vec![ip],
            hostname: None,
            zone: None,
            zone_hints: SmallVec::new(),
            ready: true,
            node_name: None,
            target_pod: None,
            target_workload: None,
        }
    }
}

/// A shaped EndpointSlice: the slice's address family, its resolved ports
/// and its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSliceRec {
    pub namespace: String,
    pub name: String,
    /// Owning service, from the standard service-name label.
    pub service: Option<String>,
    pub family: IpFamily,
    pub ports: Vec<SlicePort>,
    pub endpoints: Vec<SliceEndpoint>,
}

type NamespacedName = (String, String);

/// Everything the watcher knows about one cluster, updated event by event.
#[derive(Default)]
pub struct ClusterState {
    pub(crate) services: FxHashMap<ServiceId, ServiceMeta>,
    slices: FxHashMap<NamespacedName, EndpointSliceRec>,
    pods: FxHashMap<NamespacedName, Arc<PodMeta>>,
    workloads: FxHashMap<NamespacedName, Arc<WorkloadMeta>>,
    pub(crate) nodes: FxHashMap<String, Option<String>>,
}

impl ClusterState {
    /// Applies one event and returns the services whose topics must be
    /// republished.
    pub fn apply(&mut self, event: ClusterEvent) -> Vec<ServiceId> {
        match event {
            ClusterEvent::ServiceApplied(meta) => {
                let id = meta.id.clone();
                self.services.insert(id.clone(), meta);
                vec![id]
            }
            ClusterEvent::ServiceDeleted(id) => {
                self.services.remove(&id);
                vec![id]
            }
            ClusterEvent::SliceApplied(rec) => {
                let key = (rec.namespace.clone(), rec.name.clone());
                let mut affected = Vec::new();
                if let Some(prev) = self.slices.get(&key) {
                    if prev.service != rec.service {
                        affected.extend(slice_service(prev));
                    }
                }
                affected.extend(slice_service(&rec));
                self.slices.insert(key, rec);
                affected
            }
            ClusterEvent::SliceDeleted { namespace, name } => self
                .slices
                .remove(&(namespace, name))
                .as_ref()
                .map(slice_service)
                .into_iter()
                .flatten()
                .collect(),
            ClusterEvent::PodApplied(pod) => {
                let key = (pod.namespace.clone(), pod.name.clone());
                self.pods.insert(key, pod.clone());
                self.services_referencing_pod(&pod.namespace, &pod.name)
            }
            ClusterEvent::PodDeleted { namespace, name } => {
                let affected = self.services_referencing_pod(&namespace, &name);
                self.pods.remove(&(namespace, name));
                affected
            }
            ClusterEvent::NodeApplied { name, zone } => {
                self.nodes.insert(name, zone);
                Vec::new()
            }
            ClusterEvent::NodeDeleted { name } => {
                self.nodes.remove(&name);
                Vec::new()
            }
            ClusterEvent::WorkloadApplied(workload) => {
                let key = (workload.namespace.clone(), workload.name.clone());
                self.workloads.insert(key, workload.clone());
                self.services_referencing_workload(&workload.namespace, &workload.name)
            }
            ClusterEvent::WorkloadDeleted { namespace, name } => {
                let affected = self.services_referencing_workload(&namespace, &name);
                self.workloads.remove(&(namespace, name));
                affected
            }
        }
    }

    pub fn service(&self, id: &ServiceId) -> Option<&ServiceMeta> {
        self.services.get(id)
    }

    pub fn node_zone(&self, name: &str) -> Option<String> {
        self.nodes.get(name).cloned().flatten()
    }

    /// Builds the current endpoint state for `(service, port, instance)`.
    ///
    /// An empty result distinguishes "service missing" from "service with no
    /// ready endpoints" via the `exists` flag.
    pub fn build(&self, id: &ServiceId, port: u16, instance: Option<&str>) -> EndpointsState {
        let Some(svc) = self.services.get(id) else {
            return EndpointsState::NoEndpoints { exists: false };
        };
        let Some(svc_port) = svc.port(port) else {
            return EndpointsState::NoEndpoints { exists: true };
        };
        let opaque_ports = svc
            .annotations
            .get(OPAQUE_PORTS_ANNOTATION)
            .map(|raw| trellis_core::labels::parse_port_list(raw))
            .unwrap_or_default();

        let mut set = AddressSet {
            preferred_family: svc.preferred_family,
            ..AddressSet::default()
        };
        set.labels.insert("namespace".to_string(), id.namespace.clone());
        set.labels.insert("service".to_string(), id.name.clone());

        for slice in self
            .slices
            .values()
            .filter(|s| s.namespace == id.namespace && s.service.as_deref() == Some(id.name.as_str()))
        {
            let Some(endpoint_port) = resolve_port(svc_port, &slice.ports) else {
                continue;
            };
            for endpoint in &slice.endpoints {
                if !endpoint.ready {
                    continue;
                }
                if let Some(wanted) = instance {
                    if endpoint.hostname.as_deref() != Some(wanted) {
                        continue;
                    }
                }
                for ip in &endpoint.addresses {
                    let mut addr = Address::new(*ip, endpoint_port);
                    addr.zone = endpoint.zone.clone();
                    addr.zone_hints = endpoint.zone_hints.clone();
                    addr.hostname = endpoint.hostname.clone();
                    addr.opaque_protocol = opaque_ports.contains(&port);
                    if let Some(pod_name) = &endpoint.target_pod {
                        if let Some(pod) = self
                            .pods
                            .get(&(slice.namespace.clone(), pod_name.clone()))
                        {
                            addr.owner = pod.owner.clone();
                            addr.pod = Some(pod.clone());
                        }
                    }
                    if let Some(workload_name) = &endpoint.target_workload {
                        addr.external_workload = self
                            .workloads
                            .get(&(slice.namespace.clone(), workload_name.clone()))
                            .cloned();
                    }
                    set.insert(addr);
                }
            }
        }

        if set.is_empty() {
            return EndpointsState::NoEndpoints { exists: true };
        }
        set.supports_topology_filtering = set
            .addresses
            .values()
            .all(|a| !a.zone_hints.is_empty());
        EndpointsState::Endpoints(set)
    }

    fn services_referencing_pod(&self, namespace: &str, pod: &str) -> Vec<ServiceId> {
        let mut out = Vec::new();
        for slice in self.slices.values().filter(|s| s.namespace == namespace) {
            if slice
                .endpoints
                .iter()
                .any(|e| e.target_pod.as_deref() == Some(pod))
            {
                out.extend(slice_service(slice));
            }
        }
        out.dedup();
        out
    }

    fn services_referencing_workload(&self, namespace: &str, workload: &str) -> Vec<ServiceId> {
        let mut out = Vec::new();
        for slice in self.slices.values().filter(|s| s.namespace == namespace) {
            if slice
                .endpoints
                .iter()
                .any(|e| e.target_workload.as_deref() == Some(workload))
            {
                out.extend(slice_service(slice));
            }
        }
        out.dedup();
        out
    }
}

fn slice_service(slice: &EndpointSliceRec) -> Option<ServiceId> {
    slice
        .service
        .as_ref()
        .map(|name| ServiceId::new(slice.namespace.clone(), name.clone()))
}

/// Maps a service port to the concrete endpoint port carried by a slice.
/// Named ports correlate by name; numeric targets pass straight through.
fn resolve_port(svc_port: &ServicePort, slice_ports: &[SlicePort]) -> Option<u16> {
    if let Some(name) = &svc_port.name {
        if let Some(sp) = slice_ports
            .iter()
            .find(|sp| sp.name.as_deref() == Some(name.as_str()))
        {
            return Some(sp.port);
        }
    }
    match &svc_port.target {
        TargetPort::Number(n) => Some(*n),
        TargetPort::Name(target) => slice_ports
            .iter()
            .find(|sp| sp.name.as_deref() == Some(target.as_str()))
            .map(|sp| sp.port),
    }
}
