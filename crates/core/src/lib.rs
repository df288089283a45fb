//! Core types for the endpoint discovery plane: addresses and snapshots,
//! workload metadata, configuration and the error taxonomy.

#![forbid(unsafe_code)]

pub mod addr;
pub mod config;
pub mod error;
pub mod labels;
pub mod meta;

pub use addr::{
    Address, AddressDiff, AddressKey, AddressSet, AddressSnapshot, EndpointsState, IpFamily,
};
pub use config::Config;
pub use error::{DiscoveryError, ErrorCode};
pub use meta::{Owner, PodMeta, ServiceId, ServiceMeta, ServicePort, TargetPort, WorkloadMeta};
