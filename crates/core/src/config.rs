//! Discovery plane configuration, with `TRELLIS_*` env overrides layered on
//! top of the built-in defaults.

use std::collections::BTreeSet;
use std::time::Duration;

use trellis_proto::destination::Http2ClientParams;

use crate::labels::parse_port_list;

const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_CONTROLLER_NAMESPACE: &str = "trellis-system";
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace of the control plane; pods carrying this value in their
    /// control-plane label are considered meshed.
    pub controller_namespace: String,
    /// Trust domain for mesh TLS identities; empty disables identity.
    pub identity_trust_domain: String,
    pub cluster_domain: String,
    pub default_opaque_ports: BTreeSet<u16>,
    pub force_opaque_transport: bool,
    pub enable_h2_upgrade: bool,
    pub enable_endpoint_slices: bool,
    pub enable_endpoint_filtering: bool,
    pub enable_ipv6: bool,
    /// Weight same-zone external workload endpoints above the rest.
    pub ext_endpoint_zone_weights: bool,
    /// HTTP/2 settings passed through to proxies for meshed endpoints.
    pub meshed_http2_client_params: Option<Http2ClientParams>,
    /// Per-update delivery deadline on a stream; exceeding it resets the RPC.
    pub stream_send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            identity_trust_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            default_opaque_ports: BTreeSet::from([25, 587, 3306, 4444, 5432, 6379, 9300, 11211]),
            force_opaque_transport: false,
            enable_h2_upgrade: true,
            enable_endpoint_slices: true,
            enable_endpoint_filtering: true,
            enable_ipv6: false,
            ext_endpoint_zone_weights: false,
            meshed_http2_client_params: None,
            stream_send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults with `TRELLIS_*` env overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(v) = std::env::var("TRELLIS_CONTROLLER_NAMESPACE") {
            cfg.controller_namespace = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_IDENTITY_TRUST_DOMAIN") {
            cfg.identity_trust_domain = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_CLUSTER_DOMAIN") {
            cfg.cluster_domain = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_DEFAULT_OPAQUE_PORTS") {
            cfg.default_opaque_ports = parse_port_list(&v);
        }
        if let Some(v) = env_bool("TRELLIS_FORCE_OPAQUE_TRANSPORT") {
            cfg.force_opaque_transport = v;
        }
        if let Some(v) = env_bool("TRELLIS_ENABLE_H2_UPGRADE") {
            cfg.enable_h2_upgrade = v;
        }
        if let Some(v) = env_bool("TRELLIS_ENABLE_ENDPOINT_SLICES") {
            cfg.enable_endpoint_slices = v;
        }
        if let Some(v) = env_bool("TRELLIS_ENABLE_ENDPOINT_FILTERING") {
            cfg.enable_endpoint_filtering = v;
        }
        if let Some(v) = env_bool("TRELLIS_ENABLE_IPV6") {
            cfg.enable_ipv6 = v;
        }
        if let Some(v) = env_bool("TRELLIS_EXT_ENDPOINT_ZONE_WEIGHTS") {
            cfg.ext_endpoint_zone_weights = v;
        }
        if let Some(ms) = std::env::var("TRELLIS_STREAM_SEND_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            cfg.stream_send_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
