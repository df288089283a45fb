//! Network address messages shared by the destination API.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpAddress {
    #[prost(oneof = "ip_address::Ip", tags = "1, 2")]
    pub ip: Option<ip_address::Ip>,
}

pub mod ip_address {
    #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
    pub enum Ip {
        #[prost(fixed32, tag = "1")]
        Ipv4(u32),
        #[prost(message, tag = "2")]
        Ipv6(super::Ipv6),
    }
}

/// An IPv6 address, big-endian, split into two 64-bit halves.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ipv6 {
    #[prost(fixed64, tag = "1")]
    pub first: u64,
    #[prost(fixed64, tag = "2")]
    pub last: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpAddress {
    #[prost(message, optional, tag = "1")]
    pub ip: Option<IpAddress>,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => ip_address::Ip::Ipv4(u32::from(v4)),
            IpAddr::V6(v6) => ip_address::Ip::Ipv6(Ipv6::from(v6)),
        };
        IpAddress { ip: Some(ip) }
    }
}

impl From<Ipv6Addr> for Ipv6 {
    fn from(v6: Ipv6Addr) -> Self {
        let bits = u128::from(v6);
        Ipv6 {
            first: (bits >> 64) as u64,
            last: bits as u64,
        }
    }
}

impl From<Ipv6> for Ipv6Addr {
    fn from(v6: Ipv6) -> Self {
        Ipv6Addr::from(((v6.first as u128) << 64) | v6.last as u128)
    }
}

impl From<SocketAddr> for TcpAddress {
    fn from(sa: SocketAddr) -> Self {
        TcpAddress {
            ip: Some(IpAddress::from(sa.ip())),
            port: u32::from(sa.port()),
        }
    }
}

impl From<(IpAddr, u16)> for TcpAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        TcpAddress {
            ip: Some(IpAddress::from(ip)),
            port: u32::from(port),
        }
    }
}

impl TcpAddress {
    /// Recovers the std address, if the message is well formed.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::try_from(self.port).ok()?;
        match self.ip.as_ref()?.ip? {
            ip_address::Ip::Ipv4(raw) => Some(SocketAddr::new(Ipv4Addr::from(raw).into(), port)),
            ip_address::Ip::Ipv6(raw) => Some(SocketAddr::new(Ipv6Addr::from(raw).into(), port)),
        }
    }
}

impl fmt::Display for TcpAddress {
    /// Renders `ip:port`, bracketing IPv6 addresses.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(sa) => sa.fmt(f),
            None => write!(f, "<invalid>:{}", self.port),
        }
    }
}
