//! Workload and service metadata resolved from cluster state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::addr::IpFamily;

/// Identity key for a service: `{namespace, name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// The direct controller of a pod, used for metric labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub kind: String,
    pub name: String,
}

/// Pod facts the translation path needs, extracted once at ingest so that
/// addresses can share them immutably.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodMeta {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: Option<String>,
    pub service_account: String,
    /// Value of the control-plane namespace label; present on meshed pods.
    pub controller_namespace: Option<String>,
    pub identity_mode: Option<String>,
    pub skip_inbound_ports: BTreeSet<u16>,
    /// Ports parsed from the proxy container's listen-address env vars.
    pub proxy_inbound_port: Option<u16>,
    pub proxy_admin_port: Option<u16>,
    pub proxy_control_port: Option<u16>,
    pub weight_override: Option<u32>,
    pub owner: Option<Owner>,
    pub labels: BTreeMap<String, String>,
}

impl PodMeta {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    /// Whether `port` is one of the proxy's own listeners rather than an
    /// application port.
    pub fn is_proxy_meta_port(&self, port: u16) -> bool {
        self.proxy_admin_port == Some(port) || self.proxy_control_port == Some(port)
    }
}

/// A mesh external workload (a VM or other off-cluster endpoint enrolled in
/// the mesh) referenced by an endpoint slice.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkloadMeta {
    pub name: String,
    pub namespace: String,
    /// URI-like mesh TLS identity, e.g. `spiffe://...`.
    pub identity: String,
    /// DNS name the proxy validates on the workload's certificate.
    pub server_name: String,
    pub labels: BTreeMap<String, String>,
}

/// One exposed service port and how it maps to container ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub port: u16,
    pub name: Option<String>,
    pub target: TargetPort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

/// Service facts the handler and watcher need for path selection and
/// snapshot construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMeta {
    pub id: ServiceId,
    pub external_name: bool,
    pub ports: Vec<ServicePort>,
    /// First entry of the service's ipFamilies, when dual-stack.
    pub preferred_family: Option<IpFamily>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ServiceMeta {
    pub fn port(&self, port: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.port == port)
    }
}
