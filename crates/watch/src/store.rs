//! Registry of remote-cluster watchers.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::watcher::EndpointsWatcher;

/// Per-cluster identity configuration used when building remote views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub trust_domain: String,
    pub cluster_domain: String,
}

/// Maps cluster names to their watchers. Credential plumbing lives outside
/// the core; entries are registered by whatever loads cluster credentials.
#[derive(Default)]
pub struct ClusterStore {
    clusters: RwLock<FxHashMap<String, (Arc<EndpointsWatcher>, ClusterConfig)>>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        watcher: Arc<EndpointsWatcher>,
        config: ClusterConfig,
    ) {
        let name = name.into();
        info!(cluster = %name, "cluster registered");
        self.clusters.write().await.insert(name, (watcher, config));
    }

    pub async fn get(&self, name: &str) -> Option<(Arc<EndpointsWatcher>, ClusterConfig)> {
        self.clusters.read().await.get(name).cloned()
    }

    /// Removes a cluster and closes its watcher's topics, ending every view
    /// that was attached to them.
    pub async fn remove(&self, name: &str) {
        let removed = self.clusters.write().await.remove(name);
        if let Some((watcher, _)) = removed {
            info!(cluster = %name, "cluster removed");
            watcher.close().await;
        }
    }
}
