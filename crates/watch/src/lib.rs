//! Topics and the cluster-state watcher facade.
//!
//! A topic multiplexes one `(service, port, instance)` endpoint subscription
//! so that many streams share a single watcher; the watcher ingests cluster
//! events and publishes versioned snapshots to every topic they affect.

#![forbid(unsafe_code)]

pub mod convert;
pub mod kube;
pub mod state;
pub mod store;
pub mod topic;
pub mod watcher;

pub use state::{ClusterEvent, ClusterState, EndpointSliceRec, SliceEndpoint, SlicePort};
pub use store::{ClusterConfig, ClusterStore};
pub use topic::{EndpointTopic, TopicKey};
pub use watcher::{EndpointsWatcher, ServiceEvent};
