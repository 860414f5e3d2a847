//! Asset Fetch Core Library
//!
//! Download orchestration for large, heterogeneous game file sets: a client
//! JAR, hundreds of libraries and tens of thousands of small content-addressed
//! assets, fetched with adaptive concurrency, verified by digest, retried on
//! transient failure and repaired when found corrupted.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - HTTP transfers: single-stream, chunked, integrity, retry policy
//! - [`scheduler`] - Priority queue, adaptive concurrency, stall detection, events
//! - [`source`] - Mirror resolution and latency probing
//! - [`manifest`] - Version descriptors and asset indexes to task descriptors
//! - [`repair`] - Verification and re-fetch of missing or corrupted files
//!
//! # Example
//!
//! ```no_run
//! use assetfetch_core::{DownloadManager, ManagerConfig, TaskSpec};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(ManagerConfig::default())?;
//! manager.add_task(
//!     TaskSpec::builder("https://example.com/client.jar", "versions/1.20.1/1.20.1.jar")
//!         .priority(10)
//!         .build()?,
//! )?;
//! let summary = manager.wait_for_completion().await?;
//! println!("{} completed, {} failed", summary.completed, summary.failed);
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod manifest;
pub mod repair;
pub mod scheduler;
pub mod source;
#[cfg(test)]
pub(crate) mod test_support;
mod user_agent;

// Re-export commonly used types
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, FailureType, HttpClient, RetryDecision, RetryPolicy,
    classify_error,
};
pub use manifest::{AssetIndex, ExpectedFile, FileKind, ManifestError, Platform, VersionManifest};
pub use repair::{RepairError, RepairReport, RepairService, VerificationReport, verify_files};
pub use scheduler::{
    AggregateStats, BandwidthStats, CompletionSummary, DownloadEvent, DownloadManager,
    ManagerConfig, ManagerError, TaskId, TaskSnapshot, TaskSpec, TaskStatus,
};
pub use source::{MirrorResolver, SourceError, SourceResolver};
