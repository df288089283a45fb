//! Translation of addresses into wire messages.

use std::collections::HashMap;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::warn;

use trellis_core::labels::IDENTITY_MODE_DEFAULT;
use trellis_core::{Address, PodMeta, WorkloadMeta};
use trellis_proto::destination::{
    AddrSet, ProtocolHint, TlsIdentity, Update, WeightedAddr, WeightedAddrSet,
};
use trellis_proto::net::TcpAddress;

use crate::config::ViewConfig;

pub(crate) const DEFAULT_ENDPOINT_WEIGHT: u32 = 10_000;
/// Boost applied to same-zone external workload endpoints.
const ZONE_WEIGHT_MULTIPLIER: u32 = 10;

#[derive(Debug, Error)]
pub(crate) enum TranslateError {
    #[error("external workload {0} has no mesh TLS identity")]
    MissingWorkloadIdentity(String),
}

/// Builds the ADD message for a batch of addresses. Addresses that cannot be
/// rendered are logged and skipped; they never fail the snapshot.
pub(crate) fn add_update(
    added: &[Address],
    set_labels: &FxHashMap<String, String>,
    cfg: &ViewConfig,
) -> Option<Update> {
    if added.is_empty() {
        return None;
    }
    let mut addrs = Vec::with_capacity(added.len());
    for address in added {
        match weighted_addr(address, cfg) {
            Ok(addr) => addrs.push(addr),
            Err(error) => warn!(
                addr = %address.key(),
                %error,
                "skipping address that cannot be translated"
            ),
        }
    }
    if addrs.is_empty() {
        return None;
    }
    Some(Update::add(WeightedAddrSet {
        addrs,
        metric_labels: set_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }))
}

pub(crate) fn remove_update(removed: &[Address]) -> Option<Update> {
    if removed.is_empty() {
        return None;
    }
    Some(Update::remove(AddrSet {
        addrs: removed
            .iter()
            .map(|a| TcpAddress::from((a.ip, a.port)))
            .collect(),
    }))
}

fn weighted_addr(address: &Address, cfg: &ViewConfig) -> Result<WeightedAddr, TranslateError> {
    if let Some(workload) = &address.external_workload {
        return workload_addr(address, workload, cfg);
    }

    let mut addr = WeightedAddr {
        addr: Some(TcpAddress::from((address.ip, address.port))),
        weight: DEFAULT_ENDPOINT_WEIGHT,
        metric_labels: HashMap::new(),
        tls_identity: None,
        protocol_hint: None,
        http2: None,
    };

    let mut labels = HashMap::new();
    if let Some(pod) = &address.pod {
        addr.weight = pod.weight_override.unwrap_or(DEFAULT_ENDPOINT_WEIGHT);
        for (k, v) in &pod.labels {
            labels.insert(k.clone(), v.clone());
        }
        labels.insert("pod".to_string(), pod.name.clone());
        labels.insert("serviceaccount".to_string(), pod.service_account.clone());

        if is_hintable(pod, address.port) {
            if is_opaque(address, cfg) {
                addr.protocol_hint = Some(ProtocolHint::opaque(pod.proxy_inbound_port));
            } else if cfg.enable_h2_upgrade {
                addr.protocol_hint = Some(ProtocolHint::h2());
                addr.http2 = cfg.meshed_http2_client_params;
            }
            addr.tls_identity = pod_identity(pod, cfg);
        }
    }
    if let Some(owner) = &address.owner {
        labels.insert(owner.kind.clone(), owner.name.clone());
    }
    labels.insert("zone".to_string(), address.zone.clone().unwrap_or_default());
    addr.metric_labels = labels;
    Ok(addr)
}

fn workload_addr(
    address: &Address,
    workload: &WorkloadMeta,
    cfg: &ViewConfig,
) -> Result<WeightedAddr, TranslateError> {
    if workload.identity.is_empty() {
        return Err(TranslateError::MissingWorkloadIdentity(workload.name.clone()));
    }

    let mut weight = DEFAULT_ENDPOINT_WEIGHT;
    if cfg.ext_endpoint_zone_weights
        && address.zone.is_some()
        && address.zone == cfg.node_zone
    {
        weight = DEFAULT_ENDPOINT_WEIGHT * ZONE_WEIGHT_MULTIPLIER;
    }

    let mut addr = WeightedAddr {
        addr: Some(TcpAddress::from((address.ip, address.port))),
        weight,
        metric_labels: HashMap::new(),
        tls_identity: Some(TlsIdentity::uri_like(
            workload.identity.clone(),
            workload.server_name.clone(),
        )),
        protocol_hint: None,
        http2: None,
    };
    if is_opaque(address, cfg) {
        addr.protocol_hint = Some(ProtocolHint::opaque(None));
    } else if cfg.enable_h2_upgrade {
        addr.protocol_hint = Some(ProtocolHint::h2());
        addr.http2 = cfg.meshed_http2_client_params;
    }

    let mut labels: HashMap<String, String> = workload
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert("external_workload".to_string(), workload.name.clone());
    labels.insert("zone".to_string(), address.zone.clone().unwrap_or_default());
    addr.metric_labels = labels;
    Ok(addr)
}

/// A port gets protocol hints and identity only when the pod is meshed and
/// the port is neither proxy-skipped nor one of the proxy's own listeners.
fn is_hintable(pod: &PodMeta, port: u16) -> bool {
    pod.controller_namespace.is_some()
        && !pod.skip_inbound_ports.contains(&port)
        && !pod.is_proxy_meta_port(port)
}

fn is_opaque(address: &Address, cfg: &ViewConfig) -> bool {
    cfg.default_opaque_ports.contains(&address.port)
        || address.opaque_protocol
        || cfg.force_opaque_transport
}

fn pod_identity(pod: &PodMeta, cfg: &ViewConfig) -> Option<TlsIdentity> {
    if cfg.identity_trust_domain.is_empty() {
        return None;
    }
    if pod.controller_namespace.as_deref() != Some(cfg.controller_namespace.as_str()) {
        return None;
    }
    if pod.identity_mode.as_deref() != Some(IDENTITY_MODE_DEFAULT) {
        return None;
    }
    Some(TlsIdentity::dns_like(format!(
        "{}.{}.serviceaccount.identity.{}.{}",
        pod.service_account, pod.namespace, cfg.controller_namespace, cfg.identity_trust_domain
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_core::{Config, Owner};
    use trellis_proto::destination::tls_identity::Strategy;

    fn cfg() -> ViewConfig {
        ViewConfig::from_config(&Config::default())
    }

    fn meshed_pod() -> PodMeta {
        PodMeta {
            name: "name1-0".to_string(),
            namespace: "ns".to_string(),
            phase: "Running".to_string(),
            service_account: "default".to_string(),
            controller_namespace: Some("trellis-system".to_string()),
            identity_mode: Some(IDENTITY_MODE_DEFAULT.to_string()),
            proxy_inbound_port: Some(4143),
            proxy_admin_port: Some(4191),
            ..PodMeta::default()
        }
    }

    fn pod_addr(ip: &str, port: u16, pod: PodMeta) -> Address {
        let mut addr = Address::new(ip.parse().unwrap(), port);
        addr.pod = Some(Arc::new(pod));
        addr
    }

    #[test]
    fn meshed_pod_gets_h2_and_identity() {
        let addr = pod_addr("172.17.0.12", 8989, meshed_pod());
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert_eq!(wa.weight, DEFAULT_ENDPOINT_WEIGHT);
        assert!(wa.protocol_hint.as_ref().unwrap().is_h2());
        match wa.tls_identity.unwrap().strategy.unwrap() {
            Strategy::DnsLikeIdentity(id) => assert_eq!(
                id.name,
                "default.ns.serviceaccount.identity.trellis-system.cluster.local"
            ),
            other => panic!("unexpected identity strategy: {other:?}"),
        }
    }

    #[test]
    fn unmeshed_pod_gets_neither_hint_nor_identity() {
        let mut pod = meshed_pod();
        pod.controller_namespace = None;
        let addr = pod_addr("172.17.0.12", 8989, pod);
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert!(wa.protocol_hint.is_none());
        assert!(wa.tls_identity.is_none());
    }

    #[test]
    fn opaque_port_carries_inbound_transport() {
        let addr = pod_addr("172.17.0.12", 3306, meshed_pod());
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        let hint = wa.protocol_hint.unwrap();
        assert!(hint.is_opaque());
        assert_eq!(hint.opaque_transport.unwrap().inbound_port, 4143);
    }

    #[test]
    fn skipped_and_meta_ports_are_plain() {
        // 4191 is the proxy admin listener on this pod.
        let addr = pod_addr("172.17.0.12", 4191, meshed_pod());
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert!(wa.protocol_hint.is_none());
        assert!(wa.tls_identity.is_none());

        let mut pod = meshed_pod();
        pod.skip_inbound_ports.insert(8989);
        let addr = pod_addr("172.17.0.12", 8989, pod);
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert!(wa.protocol_hint.is_none());
    }

    #[test]
    fn weight_annotation_overrides_default() {
        let mut pod = meshed_pod();
        pod.weight_override = Some(500);
        let wa = weighted_addr(&pod_addr("172.17.0.12", 8989, pod), &cfg()).unwrap();
        assert_eq!(wa.weight, 500);
    }

    #[test]
    fn metric_labels_cover_owner_pod_and_zone() {
        let mut addr = pod_addr("172.17.0.12", 8989, meshed_pod());
        addr.owner = Some(Owner {
            kind: "replicaset".to_string(),
            name: "name1-5f6d8".to_string(),
        });
        addr.zone = Some("east-1a".to_string());
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert_eq!(wa.metric_labels.get("pod").map(String::as_str), Some("name1-0"));
        assert_eq!(wa.metric_labels.get("serviceaccount").map(String::as_str), Some("default"));
        assert_eq!(wa.metric_labels.get("replicaset").map(String::as_str), Some("name1-5f6d8"));
        assert_eq!(wa.metric_labels.get("zone").map(String::as_str), Some("east-1a"));
    }

    #[test]
    fn bare_address_still_carries_zone_label() {
        let addr = Address::new("10.0.0.9".parse().unwrap(), 80);
        let wa = weighted_addr(&addr, &cfg()).unwrap();
        assert_eq!(wa.metric_labels.get("zone").map(String::as_str), Some(""));
        assert!(wa.tls_identity.is_none());
    }

    #[test]
    fn workload_identity_and_zone_weight() {
        let workload = WorkloadMeta {
            name: "vm-1".to_string(),
            namespace: "ns".to_string(),
            identity: "spiffe://east.example/vm-1".to_string(),
            server_name: "vm-1.ns.workload.east.example".to_string(),
            labels: Default::default(),
        };
        let mut addr = Address::new("192.168.1.10".parse().unwrap(), 8080);
        addr.zone = Some("east-1a".to_string());
        addr.external_workload = Some(Arc::new(workload));

        let mut cfg = cfg();
        cfg.ext_endpoint_zone_weights = true;
        cfg.node_zone = Some("east-1a".to_string());
        let wa = weighted_addr(&addr, &cfg).unwrap();
        assert_eq!(wa.weight, DEFAULT_ENDPOINT_WEIGHT * 10);
        match wa.tls_identity.as_ref().unwrap().strategy.as_ref().unwrap() {
            Strategy::UriLikeIdentity(id) => assert_eq!(id.uri, "spiffe://east.example/vm-1"),
            other => panic!("unexpected identity strategy: {other:?}"),
        }
        assert_eq!(
            wa.tls_identity.unwrap().server_name.unwrap().name,
            "vm-1.ns.workload.east.example"
        );

        cfg.node_zone = Some("west-2a".to_string());
        let wa = weighted_addr(&addr, &cfg).unwrap();
        assert_eq!(wa.weight, DEFAULT_ENDPOINT_WEIGHT);
    }

    #[test]
    fn workload_without_identity_is_an_error() {
        let workload = WorkloadMeta {
            name: "vm-2".to_string(),
            namespace: "ns".to_string(),
            ..WorkloadMeta::default()
        };
        let mut addr = Address::new("192.168.1.11".parse().unwrap(), 8080);
        addr.external_workload = Some(Arc::new(workload));
        assert!(weighted_addr(&addr, &cfg()).is_err());
    }
}
