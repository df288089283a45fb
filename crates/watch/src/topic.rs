//! A shared subscription point multiplexing one endpoint watch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tracing::{debug, warn};

use trellis_core::{AddressSnapshot, DiscoveryError, EndpointsState, ServiceId};

/// Identity of a topic: one logical subscription per (service, port,
/// instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub service: ServiceId,
    pub port: u16,
    pub instance: Option<String>,
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}.{}:{}", instance, self.service, self.port),
            None => write!(f, "{}:{}", self.service, self.port),
        }
    }
}

/// Holds the latest [`AddressSnapshot`] and fans a change signal out to
/// subscribers.
///
/// The signal carries only the snapshot version: a slow subscriber never
/// blocks the publisher, it simply re-reads [`EndpointTopic::latest`] when it
/// catches up and may observe coalesced state. That is safe because every
/// subscriber diffs against its own last filtered set.
pub struct EndpointTopic {
    key: TopicKey,
    latest: ArcSwapOption<AddressSnapshot>,
    version_tx: watch::Sender<u64>,
    next_version: AtomicU64,
    closed: AtomicBool,
}

impl EndpointTopic {
    pub fn new(key: TopicKey) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            key,
            latest: ArcSwapOption::empty(),
            version_tx,
            next_version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    /// Registers a subscriber.
    ///
    /// The returned receiver is pre-marked changed, so the first wait
    /// completes immediately and the subscriber observes the current
    /// `latest` (if any) without polling. Dropping the receiver
    /// unsubscribes; dropping twice is naturally a no-op.
    pub fn subscribe(&self) -> Result<watch::Receiver<u64>, DiscoveryError> {
        if self.is_closed() {
            return Err(DiscoveryError::TopicClosed);
        }
        let mut rx = self.version_tx.subscribe();
        rx.mark_changed();
        Ok(rx)
    }

    /// Publishes a snapshot. The version must be strictly greater than the
    /// current one; stale snapshots are dropped with a warning. Publishing
    /// on a closed topic is a no-op.
    pub fn publish(&self, snapshot: AddressSnapshot) {
        if self.is_closed() {
            debug!(topic = %self.key, "publish on closed topic ignored");
            return;
        }
        if let Some(current) = &*self.latest.load() {
            if snapshot.version <= current.version {
                warn!(
                    topic = %self.key,
                    version = snapshot.version,
                    current = current.version,
                    "dropping stale snapshot"
                );
                return;
            }
        }
        let version = snapshot.version;
        self.next_version.fetch_max(version, Ordering::SeqCst);
        self.latest.store(Some(Arc::new(snapshot)));
        self.version_tx.send_replace(version);
    }

    /// Publishes `state` under the next version. Only the owning watcher
    /// writes a topic, so the version counter needs no external ordering.
    pub fn publish_state(&self, state: EndpointsState) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(AddressSnapshot { version, state });
    }

    /// Non-blocking read of the current snapshot.
    pub fn latest(&self) -> Option<Arc<AddressSnapshot>> {
        self.latest.load_full()
    }

    pub fn subscriber_count(&self) -> usize {
        self.version_tx.receiver_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the topic and wakes subscribers so they can observe the close.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.version_tx.send_modify(|_| ());
        }
    }
}
