//! Transfer layer: fetching and verifying individual files.
//!
//! # Features
//!
//! - Streaming single-range transfers with resume and a running content hash
//! - Concurrent multi-range transfers for large files with an ordered merge
//! - Overall and stall timeouts on every transfer
//! - SHA-1 / SHA-256 verification with cooperative, bounded-read hashing
//! - Error classification and capped linear retry backoff
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//!
//! use assetfetch_core::download::{HttpClient, TransferProgress, TransferRequest, transfer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let progress = TransferProgress::new();
//! let outcome = transfer(
//!     &client,
//!     TransferRequest {
//!         url: "https://example.com/client.jar",
//!         dest: Path::new("./client.jar"),
//!         expected_hash: None,
//!         expected_size: None,
//!         resume: true,
//!         overall_timeout: Duration::from_secs(60),
//!         stall_timeout: Duration::from_secs(10),
//!     },
//!     &progress,
//! )
//! .await?;
//! println!("wrote {} bytes", outcome.total_bytes);
//! # Ok(())
//! # }
//! ```

mod chunked;
mod client;
pub mod constants;
mod error;
pub mod integrity;
mod retry;
mod transfer;

pub use chunked::{
    ChunkDescriptor, ChunkedDownloader, ChunkedOutcome, ChunkedRequest, merge_chunks, plan_chunks,
};
pub use client::HttpClient;
pub use error::DownloadError;
pub use integrity::{
    ContentHasher, ExpectedHash, FileState, HashAlgorithm, HashParseError, check_file, hash_file,
    is_valid,
};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use transfer::{TransferOutcome, TransferProgress, TransferRequest, transfer};

pub(crate) use transfer::discard;

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
