//! The per-RPC streaming pipeline: views that filter, diff and translate
//! topic snapshots, and the dispatcher that serializes their updates onto
//! one client stream with timeout-based backpressure.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
mod filter;
mod translate;
pub mod view;

pub use config::ViewConfig;
pub use dispatch::{StreamDispatcher, UpdateSink};
pub use view::EndpointView;

/// Live view count across all dispatchers, mirrored into the
/// `endpoint_views_active` gauge.
pub(crate) mod counters {
    use std::sync::atomic::{AtomicI64, Ordering};

    static ACTIVE_VIEWS: AtomicI64 = AtomicI64::new(0);

    pub(crate) fn view_created() {
        let n = ACTIVE_VIEWS.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("endpoint_views_active", n as f64);
    }

    pub(crate) fn view_closed() {
        let n = ACTIVE_VIEWS.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("endpoint_views_active", n as f64);
    }

    pub fn active_views() -> i64 {
        ACTIVE_VIEWS.load(Ordering::SeqCst)
    }
}

pub use counters::active_views;
