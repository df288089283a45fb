//! Authority parsing: `host:port` where the host is a fully qualified
//! service name inside the configured cluster domain.

use trellis_core::DiscoveryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub name: String,
    pub namespace: String,
    /// Stateful instance hostname, when the authority addresses a single
    /// instance (`instance.name.ns.svc.<domain>`).
    pub instance: Option<String>,
    pub port: u16,
}

pub fn parse_authority(path: &str, cluster_domain: &str) -> Result<Authority, DiscoveryError> {
    let invalid = |msg: &str| DiscoveryError::InvalidAuthority(format!("{path:?}: {msg}"));
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('[') {
        return Err(invalid("IP literals are not resolvable"));
    }

    let (host, port) = match path.rsplit_once(':') {
        Some((host, port_raw)) => {
            if host.contains(':') {
                return Err(invalid("IP literals are not resolvable"));
            }
            let port = port_raw
                .parse::<u32>()
                .map_err(|_| invalid("unparsable port"))?;
            if port == 0 || port > u32::from(u16::MAX) {
                return Err(invalid("port out of range"));
            }
            (host, port as u16)
        }
        None => (path, 80),
    };

    if host.parse::<std::net::IpAddr>().is_ok() {
        return Err(invalid("IP literals are not resolvable"));
    }

    let host = host.strip_suffix('.').unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.iter().any(|l| !is_dns_label(l)) {
        return Err(invalid("malformed host"));
    }

    if labels.len() >= 4 && labels[2] == "svc" && labels[3..].join(".") == cluster_domain {
        return Ok(Authority {
            name: labels[0].to_string(),
            namespace: labels[1].to_string(),
            instance: None,
            port,
        });
    }
    if labels.len() >= 5 && labels[3] == "svc" && labels[4..].join(".") == cluster_domain {
        return Ok(Authority {
            name: labels[1].to_string(),
            namespace: labels[2].to_string(),
            instance: Some(labels[0].to_string()),
            port,
        });
    }
    Err(invalid("host is not a service address in the cluster domain"))
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::ErrorCode;

    const DOMAIN: &str = "cluster.local";

    #[test]
    fn plain_service_authority() {
        let auth = parse_authority("name1.ns.svc.cluster.local:8989", DOMAIN).unwrap();
        assert_eq!(auth.name, "name1");
        assert_eq!(auth.namespace, "ns");
        assert_eq!(auth.instance, None);
        assert_eq!(auth.port, 8989);
    }

    #[test]
    fn instance_authority() {
        let auth = parse_authority("db-0.db.ns.svc.cluster.local:5432", DOMAIN).unwrap();
        assert_eq!(auth.instance.as_deref(), Some("db-0"));
        assert_eq!(auth.name, "db");
        assert_eq!(auth.namespace, "ns");
    }

    #[test]
    fn implicit_port_defaults_to_80() {
        let auth = parse_authority("web.ns.svc.cluster.local", DOMAIN).unwrap();
        assert_eq!(auth.port, 80);
    }

    #[test]
    fn out_of_range_ports_are_rejected() {
        for path in ["web.ns.svc.cluster.local:0", "web.ns.svc.cluster.local:70000"] {
            let err = parse_authority(path, DOMAIN).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{path}");
        }
    }

    #[test]
    fn ip_literals_are_rejected() {
        for path in ["10.0.0.1:80", "[2001:db8::94]:80", "2001:db8::94:80"] {
            let err = parse_authority(path, DOMAIN).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{path}");
        }
    }

    #[test]
    fn foreign_hosts_are_rejected() {
        for path in [
            "web:80",
            "web.ns:80",
            "name.ns.svc.other.domain:80",
            "name.ns.pod.cluster.local:80",
            "-bad.ns.svc.cluster.local:80",
        ] {
            assert!(parse_authority(path, DOMAIN).is_err(), "{path}");
        }
    }

    #[test]
    fn trailing_dot_is_tolerated() {
        let auth = parse_authority("name1.ns.svc.cluster.local.:8989", DOMAIN).unwrap();
        assert_eq!(auth.name, "name1");
    }
}
