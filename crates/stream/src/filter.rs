//! Subscriber-specific filtering: address family, topology, pod phase.

use tracing::{debug, warn};

use trellis_core::{Address, AddressSet, IpFamily};

use crate::config::ViewConfig;

/// Applies the full filter chain in order: family selection, topology
/// filtering, pod-phase filtering. Deterministic for a given (cfg, set).
pub(crate) fn apply(cfg: &ViewConfig, set: &AddressSet) -> AddressSet {
    let set = select_family(cfg, set);
    let set = filter_topology(cfg, set);
    filter_pod_phase(set)
}

/// With IPv6 disabled, IPv6 addresses are dropped. With it enabled and both
/// families present, only the backing service's preferred family is kept.
fn select_family(cfg: &ViewConfig, set: &AddressSet) -> AddressSet {
    let keep = if !cfg.enable_ipv6 {
        Some(IpFamily::V4)
    } else {
        let has_v4 = set.addresses.values().any(|a| a.family() == IpFamily::V4);
        let has_v6 = set.addresses.values().any(|a| a.family() == IpFamily::V6);
        if has_v4 && has_v6 {
            Some(set.preferred_family.unwrap_or(IpFamily::V4))
        } else {
            None
        }
    };
    match keep {
        None => set.clone(),
        Some(family) => {
            let mut out = set.empty_like();
            for addr in set.addresses.values().filter(|a| a.family() == family) {
                out.insert(addr.clone());
            }
            out
        }
    }
}

/// Keeps addresses hinted at the subscriber's zone. When nothing matches
/// (including a subscriber with no zone), the set passes through unfiltered
/// rather than blackholing the service.
fn filter_topology(cfg: &ViewConfig, set: AddressSet) -> AddressSet {
    if !cfg.enable_endpoint_filtering
        || !set.supports_topology_filtering
        || set.addresses.is_empty()
    {
        return set;
    }
    let zone = cfg.node_zone.as_deref().unwrap_or("");
    let matched: Vec<Address> = set
        .addresses
        .values()
        .filter(|a| a.zone_hints.iter().any(|hint| hint == zone))
        .cloned()
        .collect();
    if matched.is_empty() {
        warn!(
            zone,
            service = %cfg.service_fqdn,
            "no endpoints hinted for the subscriber zone; passing the set through unfiltered"
        );
        return set;
    }
    let mut out = set.empty_like();
    for addr in matched {
        out.insert(addr);
    }
    out
}

/// Drops addresses whose pod is known and not Running. An address without a
/// resolved pod is kept as an address-only endpoint.
fn filter_pod_phase(set: AddressSet) -> AddressSet {
    let mut out = set.empty_like();
    for (_, addr) in set.addresses.iter() {
        if let Some(pod) = &addr.pod {
            if !pod.is_running() {
                debug!(pod = %pod.name, phase = %pod.phase, "dropping address for non-running pod");
                continue;
            }
        }
        out.insert(addr.clone());
    }
    out
}
