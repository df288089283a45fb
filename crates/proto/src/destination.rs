//! Destination API messages: a `Get` request and the update stream it yields.

use std::collections::HashMap;

use crate::net::TcpAddress;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDestination {
    #[prost(string, tag = "1")]
    pub scheme: String,
    /// The authority to resolve, `host:port`.
    #[prost(string, tag = "2")]
    pub path: String,
    /// Opaque subscriber context; see the server's context-token handling.
    #[prost(string, tag = "3")]
    pub context_token: String,
}

/// One message on the `Get` response stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Update {
    #[prost(oneof = "update::Update", tags = "1, 2, 3")]
    pub update: Option<update::Update>,
}

pub mod update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Update {
        #[prost(message, tag = "1")]
        Add(super::WeightedAddrSet),
        #[prost(message, tag = "2")]
        Remove(super::AddrSet),
        #[prost(message, tag = "3")]
        NoEndpoints(super::NoEndpoints),
    }
}

impl Update {
    pub fn add(set: WeightedAddrSet) -> Self {
        Update {
            update: Some(update::Update::Add(set)),
        }
    }

    pub fn remove(set: AddrSet) -> Self {
        Update {
            update: Some(update::Update::Remove(set)),
        }
    }

    pub fn no_endpoints(exists: bool) -> Self {
        Update {
            update: Some(update::Update::NoEndpoints(NoEndpoints { exists })),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddrSet {
    #[prost(message, repeated, tag = "1")]
    pub addrs: Vec<TcpAddress>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WeightedAddrSet {
    #[prost(message, repeated, tag = "1")]
    pub addrs: Vec<WeightedAddr>,
    /// Labels shared by every address in the set.
    #[prost(map = "string, string", tag = "2")]
    pub metric_labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WeightedAddr {
    #[prost(message, optional, tag = "1")]
    pub addr: Option<TcpAddress>,
    #[prost(uint32, tag = "3")]
    pub weight: u32,
    #[prost(map = "string, string", tag = "4")]
    pub metric_labels: HashMap<String, String>,
    #[prost(message, optional, tag = "5")]
    pub tls_identity: Option<TlsIdentity>,
    #[prost(message, optional, tag = "6")]
    pub protocol_hint: Option<ProtocolHint>,
    #[prost(message, optional, tag = "8")]
    pub http2: Option<Http2ClientParams>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NoEndpoints {
    #[prost(bool, tag = "1")]
    pub exists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TlsIdentity {
    #[prost(oneof = "tls_identity::Strategy", tags = "1, 3")]
    pub strategy: Option<tls_identity::Strategy>,
    /// The name the proxy should validate on the peer certificate, when it
    /// differs from the identity itself.
    #[prost(message, optional, tag = "2")]
    pub server_name: Option<tls_identity::DnsLikeIdentity>,
}

pub mod tls_identity {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DnsLikeIdentity {
        #[prost(string, tag = "1")]
        pub name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UriLikeIdentity {
        #[prost(string, tag = "1")]
        pub uri: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Strategy {
        #[prost(message, tag = "1")]
        DnsLikeIdentity(DnsLikeIdentity),
        #[prost(message, tag = "3")]
        UriLikeIdentity(UriLikeIdentity),
    }
}

impl TlsIdentity {
    pub fn dns_like(name: String) -> Self {
        let id = tls_identity::DnsLikeIdentity { name };
        TlsIdentity {
            strategy: Some(tls_identity::Strategy::DnsLikeIdentity(id.clone())),
            server_name: Some(id),
        }
    }

    pub fn uri_like(uri: String, server_name: String) -> Self {
        TlsIdentity {
            strategy: Some(tls_identity::Strategy::UriLikeIdentity(
                tls_identity::UriLikeIdentity { uri },
            )),
            server_name: Some(tls_identity::DnsLikeIdentity { name: server_name }),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolHint {
    #[prost(oneof = "protocol_hint::Protocol", tags = "1, 2")]
    pub protocol: Option<protocol_hint::Protocol>,
    /// Set alongside `Opaque` when the peer's inbound proxy port is known.
    #[prost(message, optional, tag = "3")]
    pub opaque_transport: Option<OpaqueTransport>,
}

pub mod protocol_hint {
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct H2 {}

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Opaque {}

    #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
    pub enum Protocol {
        #[prost(message, tag = "1")]
        H2(H2),
        #[prost(message, tag = "2")]
        Opaque(Opaque),
    }
}

impl ProtocolHint {
    pub fn h2() -> Self {
        ProtocolHint {
            protocol: Some(protocol_hint::Protocol::H2(protocol_hint::H2 {})),
            opaque_transport: None,
        }
    }

    pub fn opaque(inbound_port: Option<u16>) -> Self {
        ProtocolHint {
            protocol: Some(protocol_hint::Protocol::Opaque(protocol_hint::Opaque {})),
            opaque_transport: inbound_port.map(|p| OpaqueTransport {
                inbound_port: u32::from(p),
            }),
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self.protocol, Some(protocol_hint::Protocol::H2(_)))
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.protocol, Some(protocol_hint::Protocol::Opaque(_)))
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct OpaqueTransport {
    #[prost(uint32, tag = "1")]
    pub inbound_port: u32,
}

/// HTTP/2 settings handed to the proxy for meshed connections. The discovery
/// core treats this as an opaque pass-through.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Http2ClientParams {
    #[prost(message, optional, tag = "1")]
    pub flow_control: Option<http2_client_params::FlowControl>,
    #[prost(message, optional, tag = "2")]
    pub keep_alive: Option<http2_client_params::KeepAlive>,
}

pub mod http2_client_params {
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct FlowControl {
        #[prost(uint32, tag = "1")]
        pub initial_stream_window_size: u32,
        #[prost(uint32, tag = "2")]
        pub initial_connection_window_size: u32,
        #[prost(bool, tag = "3")]
        pub adaptive_flow_control: bool,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct KeepAlive {
        #[prost(uint32, tag = "1")]
        pub interval_secs: u32,
        #[prost(uint32, tag = "2")]
        pub timeout_secs: u32,
        #[prost(bool, tag = "3")]
        pub while_idle: bool,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn update_oneof_round_trips() {
        let update = Update::no_endpoints(true);
        let bytes = update.encode_to_vec();
        let decoded = Update::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn weighted_addr_round_trips() {
        let sa: std::net::SocketAddr = "10.1.30.135:7779".parse().unwrap();
        let addr = WeightedAddr {
            addr: Some(sa.into()),
            weight: 10_000,
            metric_labels: [("zone".to_string(), "east-1a".to_string())].into(),
            tls_identity: Some(TlsIdentity::dns_like("web.ns.example".to_string())),
            protocol_hint: Some(ProtocolHint::opaque(Some(4143))),
            http2: None,
        };
        let set = WeightedAddrSet {
            addrs: vec![addr.clone()],
            metric_labels: [("service".to_string(), "world".to_string())].into(),
        };
        let bytes = Update::add(set).encode_to_vec();
        let decoded = Update::decode(bytes.as_slice()).unwrap();
        match decoded.update {
            Some(update::Update::Add(set)) => {
                assert_eq!(set.addrs, vec![addr]);
                assert_eq!(set.metric_labels.get("service").map(String::as_str), Some("world"));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }
}
