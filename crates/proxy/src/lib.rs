//! Observing HTTP proxy for the monitored browsing session.
//!
//! Handles `CONNECT host:port` tunnels and plain HTTP forwards from loopback
//! clients. Every request is forwarded — the proxy never filters; blocking
//! happens at the host-resolution table. Its one job is to append visit
//! records for the policy evaluator, once per domain per proxy session.

pub mod error;
pub mod observer;

pub use {
    error::{Error, Result},
    observer::ObservingProxy,
};
