//! A per-subscriber view of one topic: filter, diff, translate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use trellis_core::{AddressSet, AddressSnapshot, DiscoveryError, EndpointsState};
use trellis_proto::destination::Update;
use trellis_watch::EndpointTopic;

use crate::config::ViewConfig;
use crate::counters;
use crate::dispatch::StreamDispatcher;
use crate::{filter, translate};

#[derive(Default)]
struct ViewState {
    /// The topic's latest address set, unfiltered.
    available: AddressSet,
    /// What this subscriber last saw after filtering; diffs are computed
    /// against it.
    filtered: AddressSet,
    version: u64,
}

/// Turns a topic's snapshots into ADD / REMOVE / NO_ENDPOINTS updates for
/// one subscriber.
///
/// Owned by the dispatcher that created it; holds only a weak back-reference
/// for enqueueing and unregistration so teardown cannot cycle.
pub struct EndpointView {
    id: u64,
    cfg: ViewConfig,
    topic: Arc<EndpointTopic>,
    dispatcher: Weak<StreamDispatcher>,
    cancel: CancellationToken,
    state: Mutex<ViewState>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EndpointView {
    pub(crate) async fn spawn(
        id: u64,
        cfg: ViewConfig,
        topic: Arc<EndpointTopic>,
        dispatcher: Weak<StreamDispatcher>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, DiscoveryError> {
        let rx = topic.subscribe()?;
        let view = Arc::new(Self {
            id,
            cfg,
            topic,
            dispatcher,
            cancel,
            state: Mutex::new(ViewState::default()),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        counters::view_created();
        let task = tokio::spawn(Arc::clone(&view).drain(rx));
        *view.task.lock().await = Some(task);
        Ok(view)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drains topic change signals until cancellation or topic close. The
    /// receiver arrives pre-marked, so the current snapshot is applied
    /// before any future event.
    async fn drain(self: Arc<Self>, mut rx: watch::Receiver<u64>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() || self.topic.is_closed() {
                        break;
                    }
                    if let Some(snapshot) = self.topic.latest() {
                        self.apply_snapshot(&snapshot).await;
                    }
                }
            }
        }
        trace!(view = self.id, service = %self.cfg.service_fqdn, "view drain loop ended");
    }

    /// Applies one snapshot, skipping anything at or below the last seen
    /// version (a coalesced signal may deliver the same snapshot twice).
    async fn apply_snapshot(&self, snapshot: &AddressSnapshot) {
        let mut st = self.state.lock().await;
        if snapshot.version <= st.version {
            return;
        }
        st.version = snapshot.version;
        match &snapshot.state {
            EndpointsState::Endpoints(set) => {
                st.available = set.clone();
                self.send_filtered(&mut st).await;
            }
            EndpointsState::NoEndpoints { exists } => {
                let exists = *exists;
                self.clear_endpoints(&mut st, exists).await;
            }
        }
    }

    /// Forces the no-endpoints transition, regardless of topic state. Used
    /// by the federation layer before tearing a member view down.
    pub async fn no_endpoints(&self, exists: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut st = self.state.lock().await;
        self.clear_endpoints(&mut st, exists).await;
    }

    /// Empties the available set. Prior endpoints are retracted through the
    /// normal diff; if nothing was advertised, an explicit NO_ENDPOINTS
    /// message makes the transition observable.
    async fn clear_endpoints(&self, st: &mut ViewState, exists: bool) {
        st.available = st.available.empty_like();
        let had_endpoints = !st.filtered.is_empty();
        self.send_filtered(st).await;
        if !had_endpoints {
            self.enqueue(Update::no_endpoints(exists)).await;
        }
    }

    /// Filters the available set, diffs it against what the subscriber last
    /// saw and enqueues the translated transition, additions first.
    async fn send_filtered(&self, st: &mut ViewState) {
        let filtered = filter::apply(&self.cfg, &st.available);
        let diff = st.filtered.diff(&filtered);
        if diff.is_empty() {
            st.filtered = filtered;
            return;
        }
        debug!(
            view = self.id,
            service = %self.cfg.service_fqdn,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "publishing endpoint transition"
        );
        let add = translate::add_update(&diff.added, &filtered.labels, &self.cfg);
        let remove = translate::remove_update(&diff.removed);
        st.filtered = filtered;
        if let Some(update) = add {
            self.enqueue(update).await;
        }
        if let Some(update) = remove {
            self.enqueue(update).await;
        }
    }

    async fn enqueue(&self, update: Update) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.enqueue(update).await;
        }
    }

    /// Idempotent. Cancels the subscription, waits for the drain loop, then
    /// unregisters from the dispatcher; afterwards nothing is enqueued on
    /// this view's behalf.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unregister_view(self.id).await;
        }
        counters::view_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
