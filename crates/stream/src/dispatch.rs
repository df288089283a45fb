//! Serializes updates from any number of views onto one client stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trellis_core::DiscoveryError;
use trellis_proto::destination::Update;
use trellis_watch::EndpointTopic;

use crate::config::ViewConfig;
use crate::view::EndpointView;

/// The downstream half of a stream: whatever the RPC scaffolding uses to
/// write one update to the client.
#[async_trait::async_trait]
pub trait UpdateSink: Send {
    async fn send(&mut self, update: Update) -> anyhow::Result<()>;
}

/// Fans updates from registered views into a single consumer with
/// timeout-based backpressure.
///
/// The queue is a rendezvous channel: an enqueue completes only once the
/// process loop has accepted the update, which in turn means the previous
/// send has finished. Views therefore never accumulate stale updates, and a
/// stuck client surfaces as an enqueue timeout within `send_timeout`,
/// triggering the reset callback so the client reconnects for a fresh
/// snapshot.
pub struct StreamDispatcher {
    send_timeout: Duration,
    reset: Box<dyn Fn() + Send + Sync>,
    tx: Mutex<Option<flume::Sender<Update>>>,
    rx: Mutex<Option<flume::Receiver<Update>>>,
    views: Mutex<FxHashMap<u64, Arc<EndpointView>>>,
    next_view_id: AtomicU64,
    closed: AtomicBool,
}

impl StreamDispatcher {
    pub fn new(send_timeout: Duration, reset: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        let (tx, rx) = flume::bounded(0);
        Arc::new(Self {
            send_timeout,
            reset: Box::new(reset),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            views: Mutex::new(FxHashMap::default()),
            next_view_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Consumes enqueued updates and writes them to `sink`, one at a time.
    ///
    /// Returns when the queue is closed (clean teardown) or on the first
    /// send error (client gone).
    pub async fn process<S: UpdateSink>(&self, sink: &mut S) -> anyhow::Result<()> {
        let rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                debug!("dispatcher already has a consumer; refusing a second");
                return Ok(());
            }
        };
        while let Ok(update) = rx.recv_async().await {
            let started = Instant::now();
            let result = sink.send(update).await;
            histogram!(
                "stream_send_duration_seconds",
                started.elapsed().as_secs_f64()
            );
            result?;
        }
        Ok(())
    }

    /// Hands one update to the process loop, waiting at most `send_timeout`.
    ///
    /// On timeout the update is dropped and the reset callback fires; the
    /// subscriber is expected to reconnect and receive a fresh snapshot.
    pub(crate) async fn enqueue(&self, update: Update) {
        let tx = match self.tx.lock().await.clone() {
            Some(tx) => tx,
            None => return,
        };
        match tokio::time::timeout(self.send_timeout, tx.send_async(update)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("dropping update: stream consumer is gone"),
            Err(_) => {
                counter!("stream_send_timeouts_total", 1);
                warn!(timeout = ?self.send_timeout, "update delivery timed out; resetting stream");
                (self.reset)();
            }
        }
    }

    /// Creates a view bound to this dispatcher and registers it. Fails once
    /// the dispatcher is closed.
    pub async fn new_endpoint_view(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        topic: Arc<EndpointTopic>,
        cfg: ViewConfig,
    ) -> Result<Arc<EndpointView>, DiscoveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::DispatcherClosed);
        }
        let id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let view =
            EndpointView::spawn(id, cfg, topic, Arc::downgrade(self), cancel.child_token()).await?;
        self.views.lock().await.insert(id, view.clone());
        if self.closed.load(Ordering::SeqCst) {
            // Lost the race with close(); do not leak a live view.
            self.views.lock().await.remove(&id);
            view.close().await;
            return Err(DiscoveryError::DispatcherClosed);
        }
        Ok(view)
    }

    /// Called by a view at the end of its close sequence.
    pub(crate) async fn unregister_view(&self, id: u64) {
        self.views.lock().await.remove(&id);
    }

    pub async fn view_count(&self) -> usize {
        self.views.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. Closes every registered view, then the queue, which ends
    /// the process loop after any in-flight send.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let views: Vec<Arc<EndpointView>> = self.views.lock().await.values().cloned().collect();
        for view in views {
            view.close().await;
        }
        self.tx.lock().await.take();
    }
}
