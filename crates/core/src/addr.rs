//! Addresses, address sets and the snapshots a topic publishes.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::meta::{Owner, PodMeta, WorkloadMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// Stable key identifying one endpoint within a set: `ip:port`.
///
/// Diffs between consecutive snapshots are computed by key equality, never by
/// pointer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl AddressKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl PartialOrd for AddressKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip.cmp(&other.ip).then(self.port.cmp(&other.port))
    }
}

impl fmt::Display for AddressKey {
    /// IPv6 addresses are bracketed, matching socket-address notation.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// One resolvable endpoint, immutable once published in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
    /// Topology zone the endpoint runs in, when known.
    pub zone: Option<String>,
    /// Zones this endpoint is hinted to serve (EndpointSlice hints).
    pub zone_hints: SmallVec<[String; 4]>,
    /// Endpoint hostname, set for stateful instances.
    pub hostname: Option<String>,
    pub pod: Option<Arc<PodMeta>>,
    pub external_workload: Option<Arc<WorkloadMeta>>,
    pub owner: Option<Owner>,
    /// The backing service marks this port as an opaque TCP stream.
    pub opaque_protocol: bool,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            zone: None,
            zone_hints: SmallVec::new(),
            hostname: None,
            pod: None,
            external_workload: None,
            owner: None,
            opaque_protocol: false,
        }
    }

    pub fn key(&self) -> AddressKey {
        AddressKey::new(self.ip, self.port)
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.ip)
    }
}

/// A keyed set of addresses plus the labels shared by all of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressSet {
    pub addresses: FxHashMap<AddressKey, Address>,
    /// Set-level metric labels (namespace, service, ...).
    pub labels: FxHashMap<String, String>,
    /// Whether every member carries zone hints, enabling topology filtering.
    pub supports_topology_filtering: bool,
    /// Family kept when the set is dual-stack and IPv6 is enabled.
    pub preferred_family: Option<IpFamily>,
}

impl AddressSet {
    /// Inserts by key; a later occurrence of the same `ip:port` wins.
    pub fn insert(&mut self, addr: Address) {
        self.addresses.insert(addr.key(), addr);
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// An empty set that keeps this set's labels and flags.
    pub fn empty_like(&self) -> Self {
        Self {
            addresses: FxHashMap::default(),
            labels: self.labels.clone(),
            supports_topology_filtering: self.supports_topology_filtering,
            preferred_family: self.preferred_family,
        }
    }

    pub fn contains(&self, key: &AddressKey) -> bool {
        self.addresses.contains_key(key)
    }

    /// Computes the transition from `self` to `newer`, keyed by `ip:port`.
    ///
    /// An address whose metadata changed while keeping its key is re-emitted
    /// as an addition only: receivers treat an add for a known key as a
    /// replace, so a key never appears on both sides of one diff.
    pub fn diff(&self, newer: &AddressSet) -> AddressDiff {
        let mut added: Vec<Address> = newer
            .addresses
            .iter()
            .filter(|(key, addr)| self.addresses.get(key) != Some(addr))
            .map(|(_, addr)| addr.clone())
            .collect();
        let mut removed: Vec<Address> = self
            .addresses
            .iter()
            .filter(|(key, _)| !newer.addresses.contains_key(key))
            .map(|(_, addr)| addr.clone())
            .collect();
        added.sort_by_key(Address::key);
        removed.sort_by_key(Address::key);
        AddressDiff { added, removed }
    }
}

/// The additions and removals between two consecutive filtered sets.
#[derive(Debug, Clone, Default)]
pub struct AddressDiff {
    pub added: Vec<Address>,
    pub removed: Vec<Address>,
}

impl AddressDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// State carried by one snapshot: either a concrete address set, or the fact
/// that there are none (and whether the backing service exists at all).
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointsState {
    Endpoints(AddressSet),
    NoEndpoints { exists: bool },
}

/// A versioned topic state. Versions are strictly increasing within a topic;
/// subscribers that fall behind may skip intermediate versions.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressSnapshot {
    pub version: u64,
    pub state: EndpointsState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> Address {
        Address::new(ip.parse().unwrap(), port)
    }

    fn set_of(addrs: &[Address]) -> AddressSet {
        let mut set = AddressSet::default();
        for a in addrs {
            set.insert(a.clone());
        }
        set
    }

    #[test]
    fn key_display_brackets_ipv6() {
        assert_eq!(addr("172.17.0.12", 8989).key().to_string(), "172.17.0.12:8989");
        assert_eq!(addr("2001:db8::94", 8989).key().to_string(), "[2001:db8::94]:8989");
    }

    #[test]
    fn insert_keeps_last_occurrence() {
        let mut dup = addr("10.0.0.1", 80);
        dup.zone = Some("east-1a".to_string());
        let set = set_of(&[addr("10.0.0.1", 80), dup.clone()]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.addresses[&dup.key()].zone.as_deref(), Some("east-1a"));
    }

    #[test]
    fn diff_satisfies_set_law() {
        // new = (previous ∪ added) \ removed, keyed by ip:port.
        let previous = set_of(&[addr("10.0.0.1", 80), addr("10.0.0.2", 80)]);
        let newer = set_of(&[addr("10.0.0.2", 80), addr("10.0.0.3", 80)]);
        let diff = previous.diff(&newer);

        let mut reconstructed = previous.clone();
        for a in &diff.added {
            reconstructed.insert(a.clone());
        }
        for a in &diff.removed {
            reconstructed.addresses.remove(&a.key());
        }
        assert_eq!(reconstructed.addresses, newer.addresses);

        assert_eq!(diff.added.iter().map(Address::key).collect::<Vec<_>>(), vec![addr("10.0.0.3", 80).key()]);
        assert_eq!(diff.removed.iter().map(Address::key).collect::<Vec<_>>(), vec![addr("10.0.0.1", 80).key()]);
    }

    #[test]
    fn metadata_change_is_re_added_not_removed() {
        let previous = set_of(&[addr("10.0.0.1", 80)]);
        let mut changed = addr("10.0.0.1", 80);
        changed.zone = Some("east-1b".to_string());
        let newer = set_of(&[changed.clone()]);

        let diff = previous.diff(&newer);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());

        let add_keys: Vec<_> = diff.added.iter().map(Address::key).collect();
        let rm_keys: Vec<_> = diff.removed.iter().map(Address::key).collect();
        assert!(add_keys.iter().all(|k| !rm_keys.contains(k)));
    }

    #[test]
    fn identical_sets_diff_empty() {
        let set = set_of(&[addr("10.0.0.1", 80), addr("2001:db8::94", 8989)]);
        assert!(set.diff(&set.clone()).is_empty());
    }
}
