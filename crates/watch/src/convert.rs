//! Shaping of raw Kubernetes objects into the watcher's records.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use smallvec::SmallVec;
use tracing::warn;

use trellis_core::labels::{
    CONTROL_PLANE_NS_LABEL, ENDPOINT_WEIGHT_ANNOTATION, IDENTITY_MODE_ANNOTATION,
    PROXY_ADMIN_LISTEN_ADDR_ENV, PROXY_CONTAINER_NAME, PROXY_CONTROL_LISTEN_ADDR_ENV,
    PROXY_INBOUND_LISTEN_ADDR_ENV, SERVICE_NAME_LABEL, SKIP_INBOUND_PORTS_ANNOTATION,
    TOPOLOGY_ZONE_LABEL,
};
use trellis_core::labels::{parse_listen_port, parse_port_list};
use trellis_core::{
    IpFamily, Owner, PodMeta, ServiceId, ServiceMeta, ServicePort, TargetPort, WorkloadMeta,
};

use crate::state::{EndpointSliceRec, SliceEndpoint, SlicePort};

pub fn service_meta(svc: &Service) -> Option<ServiceMeta> {
    let name = svc.metadata.name.clone()?;
    let namespace = svc.metadata.namespace.clone()?;
    let spec = svc.spec.as_ref();

    let ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = u16::try_from(p.port).ok()?;
                    let target = match &p.target_port {
                        Some(IntOrString::Int(n)) => TargetPort::Number(u16::try_from(*n).ok()?),
                        Some(IntOrString::String(s)) => TargetPort::Name(s.clone()),
                        None => TargetPort::Number(port),
                    };
                    Some(ServicePort {
                        port,
                        name: p.name.clone(),
                        target,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let preferred_family = spec
        .and_then(|s| s.ip_families.as_ref())
        .and_then(|families| families.first())
        .and_then(|family| match family.as_str() {
            "IPv4" => Some(IpFamily::V4),
            "IPv6" => Some(IpFamily::V6),
            _ => None,
        });

    Some(ServiceMeta {
        id: ServiceId::new(namespace, name),
        external_name: spec.and_then(|s| s.type_.as_deref()) == Some("ExternalName"),
        ports,
        preferred_family,
        annotations: svc.metadata.annotations.clone().unwrap_or_default(),
        labels: svc.metadata.labels.clone().unwrap_or_default(),
    })
}

pub fn pod_meta(pod: &Pod) -> Option<Arc<PodMeta>> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone()?;
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let spec = pod.spec.as_ref();

    let weight_override = annotations.get(ENDPOINT_WEIGHT_ANNOTATION).and_then(|raw| {
        let parsed = raw.parse::<u32>().ok();
        if parsed.is_none() {
            warn!(pod = %name, value = %raw, "ignoring unparsable endpoint weight annotation");
        }
        parsed
    });

    let proxy = spec.and_then(|s| {
        s.containers
            .iter()
            .find(|c| c.name == PROXY_CONTAINER_NAME)
    });
    let proxy_port = |env_name: &str| {
        proxy
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == env_name))
            .and_then(|e| e.value.as_deref())
            .and_then(parse_listen_port)
    };

    let owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| Owner {
            kind: r.kind.to_ascii_lowercase(),
            name: r.name.clone(),
        });

    Some(Arc::new(PodMeta {
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        node_name: spec.and_then(|s| s.node_name.clone()),
        service_account: spec
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_default(),
        controller_namespace: labels.get(CONTROL_PLANE_NS_LABEL).cloned(),
        identity_mode: annotations.get(IDENTITY_MODE_ANNOTATION).cloned(),
        skip_inbound_ports: annotations
            .get(SKIP_INBOUND_PORTS_ANNOTATION)
            .map(|raw| parse_port_list(raw))
            .unwrap_or_default(),
        proxy_inbound_port: proxy_port(PROXY_INBOUND_LISTEN_ADDR_ENV),
        proxy_admin_port: proxy_port(PROXY_ADMIN_LISTEN_ADDR_ENV),
        proxy_control_port: proxy_port(PROXY_CONTROL_LISTEN_ADDR_ENV),
        weight_override,
        owner,
        labels,
        name,
        namespace,
    }))
}

/// Shapes an EndpointSlice. FQDN slices carry no routable addresses and are
/// skipped.
pub fn slice_rec(slice: &EndpointSlice) -> Option<EndpointSliceRec> {
    let name = slice.metadata.name.clone()?;
    let namespace = slice.metadata.namespace.clone()?;
    let family = match slice.address_type.as_str() {
        "IPv4" => IpFamily::V4,
        "IPv6" => IpFamily::V6,
        other => {
            warn!(slice = %name, address_type = %other, "skipping slice with unsupported address type");
            return None;
        }
    };

    let ports = slice
        .ports
        .as_ref()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    Some(SlicePort {
                        port: u16::try_from(p.port?).ok()?,
                        name: p.name.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let endpoints = slice
        .endpoints
        .iter()
        .map(|ep| {
            let addresses = ep
                .addresses
                .iter()
                .filter_map(|raw| match raw.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(slice = %name, address = %raw, "skipping unparsable endpoint address");
                        None
                    }
                })
                .collect();
            let zone_hints: SmallVec<[String; 4]> = ep
                .hints
                .as_ref()
                .and_then(|h| h.for_zones.as_ref())
                .map(|zones| zones.iter().map(|z| z.name.clone()).collect())
                .unwrap_or_default();
            let (target_pod, target_workload) = match ep.target_ref.as_ref() {
                Some(r) if r.kind.as_deref() == Some("Pod") => (r.name.clone(), None),
                Some(r) if r.kind.as_deref() == Some("ExternalWorkload") => (None, r.name.clone()),
                _ => (None, None),
            };
            SliceEndpoint {
                addresses,
                hostname: ep.hostname.clone(),
                zone: ep.zone.clone(),
                zone_hints,
                ready: ep
                    .conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(true),
                node_name: ep.node_name.clone(),
                target_pod,
                target_workload,
            }
        })
        .collect();

    Some(EndpointSliceRec {
        service: slice
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SERVICE_NAME_LABEL))
            .cloned(),
        namespace,
        name,
        family,
        ports,
        endpoints,
    })
}

pub fn node_zone(node: &Node) -> Option<(String, Option<String>)> {
    let name = node.metadata.name.clone()?;
    let zone = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TOPOLOGY_ZONE_LABEL))
        .cloned();
    Some((name, zone))
}

/// Shapes an external workload custom resource, read dynamically.
pub fn workload_meta(obj: &DynamicObject) -> Option<Arc<WorkloadMeta>> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone()?;
    let mesh_tls = obj.data.get("spec").and_then(|s| s.get("meshTls"));
    let field = |key: &str| {
        mesh_tls
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Some(Arc::new(WorkloadMeta {
        name,
        namespace,
        identity: field("identity"),
        server_name: field("serverName"),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, EnvVar, ObjectReference, PodSpec, PodStatus, ServiceSpec};
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn service_ports_and_families() {
        let svc = Service {
            metadata: meta("ns", "world"),
            spec: Some(ServiceSpec {
                ports: Some(vec![k8s_openapi::api::core::v1::ServicePort {
                    port: 7778,
                    target_port: Some(IntOrString::String("http".to_string())),
                    ..Default::default()
                }]),
                ip_families: Some(vec!["IPv6".to_string(), "IPv4".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let meta = service_meta(&svc).unwrap();
        assert_eq!(meta.id, ServiceId::new("ns", "world"));
        assert_eq!(meta.preferred_family, Some(IpFamily::V6));
        assert_eq!(
            meta.ports,
            vec![ServicePort {
                port: 7778,
                name: None,
                target: TargetPort::Name("http".to_string()),
            }]
        );
        assert!(!meta.external_name);
    }

    #[test]
    fn pod_proxy_ports_and_mesh_labels() {
        let pod = Pod {
            metadata: ObjectMeta {
                labels: Some([(CONTROL_PLANE_NS_LABEL.to_string(), "trellis-system".to_string())].into()),
                annotations: Some(
                    [
                        (IDENTITY_MODE_ANNOTATION.to_string(), "default".to_string()),
                        (SKIP_INBOUND_PORTS_ANNOTATION.to_string(), "25,587".to_string()),
                    ]
                    .into(),
                ),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "name1-5f6d8".to_string(),
                    ..Default::default()
                }]),
                ..meta("ns", "name1-5f6d8-xyz")
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                service_account_name: Some("default".to_string()),
                containers: vec![Container {
                    name: PROXY_CONTAINER_NAME.to_string(),
                    env: Some(vec![
                        EnvVar {
                            name: PROXY_INBOUND_LISTEN_ADDR_ENV.to_string(),
                            value: Some("0.0.0.0:4143".to_string()),
                            ..Default::default()
                        },
                        EnvVar {
                            name: PROXY_ADMIN_LISTEN_ADDR_ENV.to_string(),
                            value: Some("0.0.0.0:4191".to_string()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };
        let meta = pod_meta(&pod).unwrap();
        assert!(meta.is_running());
        assert_eq!(meta.controller_namespace.as_deref(), Some("trellis-system"));
        assert_eq!(meta.identity_mode.as_deref(), Some("default"));
        assert!(meta.skip_inbound_ports.contains(&587));
        assert_eq!(meta.proxy_inbound_port, Some(4143));
        assert_eq!(meta.proxy_admin_port, Some(4191));
        assert_eq!(meta.proxy_control_port, None);
        assert!(meta.is_proxy_meta_port(4191));
        assert_eq!(
            meta.owner,
            Some(Owner {
                kind: "replicaset".to_string(),
                name: "name1-5f6d8".to_string()
            })
        );
    }

    #[test]
    fn slice_targets_and_hints() {
        let slice = EndpointSlice {
            metadata: ObjectMeta {
                labels: Some([(SERVICE_NAME_LABEL.to_string(), "world".to_string())].into()),
                ..meta("ns", "world-abc")
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![Endpoint {
                addresses: vec!["10.1.30.135".to_string(), "bogus".to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..Default::default()
                }),
                hints: Some(k8s_openapi::api::discovery::v1::EndpointHints {
                    for_zones: Some(vec![k8s_openapi::api::discovery::v1::ForZone {
                        name: "east-1a".to_string(),
                    }]),
                    ..Default::default()
                }),
                target_ref: Some(ObjectReference {
                    kind: Some("Pod".to_string()),
                    name: Some("world-0".to_string()),
                    ..Default::default()
                }),
                zone: Some("east-1a".to_string()),
                ..Default::default()
            }],
            ports: Some(vec![EndpointPort {
                name: Some("http".to_string()),
                port: Some(7779),
                ..Default::default()
            }]),
        };
        let rec = slice_rec(&slice).unwrap();
        assert_eq!(rec.service.as_deref(), Some("world"));
        assert_eq!(rec.family, IpFamily::V4);
        assert_eq!(rec.ports, vec![SlicePort { port: 7779, name: Some("http".to_string()) }]);
        let ep = &rec.endpoints[0];
        assert_eq!(ep.addresses, vec!["10.1.30.135".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(ep.zone_hints.as_slice(), ["east-1a".to_string()]);
        assert_eq!(ep.target_pod.as_deref(), Some("world-0"));
    }

    #[test]
    fn fqdn_slices_are_skipped() {
        let slice = EndpointSlice {
            metadata: meta("ns", "world-fqdn"),
            address_type: "FQDN".to_string(),
            endpoints: vec![],
            ports: None,
        };
        assert!(slice_rec(&slice).is_none());
    }
}
