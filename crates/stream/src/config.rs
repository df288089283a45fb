//! Per-subscriber view configuration.

use std::collections::BTreeSet;

use trellis_core::Config;
use trellis_proto::destination::Http2ClientParams;

/// Everything one view needs to filter and translate a topic's snapshots.
///
/// Built from the global [`Config`] plus the subscriber's context (node and
/// zone) and, for remote views, the remote cluster's identity domains.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub controller_namespace: String,
    pub identity_trust_domain: String,
    pub node_name: Option<String>,
    pub node_zone: Option<String>,
    pub default_opaque_ports: BTreeSet<u16>,
    pub force_opaque_transport: bool,
    pub enable_h2_upgrade: bool,
    pub enable_endpoint_filtering: bool,
    pub enable_ipv6: bool,
    pub ext_endpoint_zone_weights: bool,
    pub meshed_http2_client_params: Option<Http2ClientParams>,
    /// Fully qualified name of the service backing the view, for logging.
    pub service_fqdn: String,
}

impl ViewConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            controller_namespace: config.controller_namespace.clone(),
            identity_trust_domain: config.identity_trust_domain.clone(),
            node_name: None,
            node_zone: None,
            default_opaque_ports: config.default_opaque_ports.clone(),
            force_opaque_transport: config.force_opaque_transport,
            enable_h2_upgrade: config.enable_h2_upgrade,
            enable_endpoint_filtering: config.enable_endpoint_filtering,
            enable_ipv6: config.enable_ipv6,
            ext_endpoint_zone_weights: config.ext_endpoint_zone_weights,
            meshed_http2_client_params: config.meshed_http2_client_params,
            service_fqdn: String::new(),
        }
    }
}
