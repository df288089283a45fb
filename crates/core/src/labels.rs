//! Annotations, labels and env var names the discovery plane recognizes.

use std::collections::BTreeSet;

/// Service annotation naming a same-namespace service whose endpoints join a
/// federated service.
pub const LOCAL_DISCOVERY_ANNOTATION: &str = "trellis.io/local-discovery";

/// Service annotation listing remote members of a federated service, as
/// `svc@cluster[,svc@cluster...]`.
pub const REMOTE_DISCOVERY_ANNOTATION: &str = "trellis.io/remote-discovery";

/// Service label marking a mirrored remote-discovery service; the value is
/// the cluster name.
pub const REMOTE_DISCOVERY_LABEL: &str = "trellis.io/remote-discovery";

/// Service label carrying the name of the service in the remote cluster.
pub const REMOTE_SERVICE_LABEL: &str = "trellis.io/remote-service";

/// Service annotation listing ports that should be treated as opaque TCP.
pub const OPAQUE_PORTS_ANNOTATION: &str = "trellis.io/opaque-ports";

/// Pod label set by proxy injection; the value is the namespace of the
/// control plane managing the pod.
pub const CONTROL_PLANE_NS_LABEL: &str = "trellis.io/control-plane-ns";

/// Pod annotation selecting the identity scheme. Only [`IDENTITY_MODE_DEFAULT`]
/// enables mesh TLS identity for the pod.
pub const IDENTITY_MODE_ANNOTATION: &str = "trellis.io/identity-mode";
pub const IDENTITY_MODE_DEFAULT: &str = "default";

/// Pod annotation listing inbound ports the proxy does not intercept.
pub const SKIP_INBOUND_PORTS_ANNOTATION: &str = "trellis.io/skip-inbound-ports";

/// Pod annotation overriding the default endpoint weight.
pub const ENDPOINT_WEIGHT_ANNOTATION: &str = "trellis.io/endpoint-weight";

pub const PROXY_CONTAINER_NAME: &str = "trellis-proxy";
pub const PROXY_INBOUND_LISTEN_ADDR_ENV: &str = "TRELLIS_PROXY_INBOUND_LISTEN_ADDR";
pub const PROXY_ADMIN_LISTEN_ADDR_ENV: &str = "TRELLIS_PROXY_ADMIN_LISTEN_ADDR";
pub const PROXY_CONTROL_LISTEN_ADDR_ENV: &str = "TRELLIS_PROXY_CONTROL_LISTEN_ADDR";

/// Standard label tying an EndpointSlice back to its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Standard node topology label.
pub const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Parses a comma-separated port list, skipping entries that do not parse.
pub fn parse_port_list(raw: &str) -> BTreeSet<u16> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u16>().ok())
        .collect()
}

/// Extracts the port from a `host:port` listen address, tolerating bracketed
/// IPv6 hosts.
pub fn parse_listen_port(raw: &str) -> Option<u16> {
    let (_, port) = raw.rsplit_once(':')?;
    port.parse::<u16>().ok()
}
