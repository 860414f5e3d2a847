//! Mirror/source resolution.
//!
//! The scheduler calls [`SourceResolver::transform_url`] once per task when
//! it is enqueued; nothing else in the orchestration core depends on which
//! host a file comes from.
//!
//! # Architecture
//!
//! - [`SourceResolver`] - async trait consumed by the scheduler
//! - [`MirrorResolver`] - built-in implementation with the official and
//!   BMCLAPI hosts plus caller-defined mirrors
//! - [`MirrorDefinition`] - prefix table for one host
//! - [`SourceProbe`] / [`SourceInfo`] - probe results and listings

mod error;
mod mirror;

pub use error::SourceError;
pub use mirror::{BMCLAPI_SOURCE, DEFAULT_SOURCE, MirrorDefinition, MirrorResolver, OFFICIAL_SOURCE};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Listing entry for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    /// Stable key (e.g. "official", "bmclapi").
    pub key: String,
    /// Human-readable label.
    pub label: String,
}

/// Result of probing one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceProbe {
    /// Source key.
    pub key: String,
    /// Whether the probe request succeeded.
    pub success: bool,
    /// Round-trip time of the probe (also reported on failure).
    pub latency: Duration,
    /// HTTP status, when a response arrived.
    pub status: Option<u16>,
    /// Short description of the outcome.
    pub message: String,
}

impl SourceProbe {
    /// Latency in whole milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Rewrites origin URLs onto a mirror and reports mirror health.
///
/// # Object Safety
///
/// Uses `async_trait` so the manager can hold an `Arc<dyn SourceResolver>`.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Maps an origin URL onto the active source. URLs the source has no
    /// rule for come back unchanged.
    fn transform_url(&self, url: &str) -> String;

    /// Probes `key` and measures round-trip latency. Unknown keys produce an
    /// unsuccessful probe rather than an error.
    async fn test_latency(&self, key: &str) -> SourceProbe;

    /// Every known source in preference order.
    fn list_sources(&self) -> Vec<SourceInfo>;
}
