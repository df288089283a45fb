//! Wire types for the proxy-facing destination API.
//!
//! These messages are hand-maintained prost derives rather than build-script
//! output: the message set is small and the tags must stay bit-exact with
//! deployed proxies, so the definitions are checked in and reviewed like any
//! other source.

#![forbid(unsafe_code)]

pub mod destination;
pub mod net;
