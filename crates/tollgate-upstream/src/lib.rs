//! Upstream endpoint selection and forwarding plumbing

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod client;
mod dispatch;
mod error;
mod registry;
pub mod tee;

use std::time::Duration;

pub use client::UpstreamClient;
pub use dispatch::{DispatchFailure, Dispatched, Dispatcher};
pub use error::DispatchError;
pub use registry::UpstreamRegistry;
pub use tee::{StreamEnd, TeeOutcome, spawn_tee};

/// Deadlines and billing policy shared by the forwarding pipelines
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    /// Whole-exchange deadline of a buffered call, and the time allowed for
    /// a stream to open
    pub request_timeout: Duration,
    /// Deadline for a stream to reach its end, longer than `request_timeout`
    pub stream_timeout: Duration,
    /// Bill the locally estimated input when the upstream rejects a call
    pub charge_on_upstream_error: bool,
}
