//! Single-stream transfer unit.
//!
//! One GET streamed straight to disk, hashing as it goes. A partial file at the
//! destination is resumed with a `Range` request and its bytes are fed through
//! the hasher first, so the final digest always covers the whole file.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use super::client::HttpClient;
use super::error::DownloadError;
use super::integrity::{ContentHasher, ExpectedHash, hash_reader};

/// Byte and liveness counters shared between a running transfer and observers.
///
/// The scheduler reads these for progress events and the stall detector
/// compares [`idle_for`](Self::idle_for) against its window.
#[derive(Debug)]
pub struct TransferProgress {
    origin: Instant,
    bytes: AtomicU64,
    last_progress_ms: AtomicU64,
    sink: Option<Arc<AtomicU64>>,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProgress {
    /// Creates counters with "last progress" set to now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            bytes: AtomicU64::new(0),
            last_progress_ms: AtomicU64::new(0),
            sink: None,
        }
    }

    /// Creates counters that also add every received byte to `sink`.
    ///
    /// The manager passes its session-wide counter here so the speed sampler
    /// sees bytes from every attempt, including ones that later fail.
    #[must_use]
    pub fn with_sink(sink: Arc<AtomicU64>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Adds received bytes and refreshes the liveness timestamp.
    pub fn record(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.fetch_add(n, Ordering::Relaxed);
        }
        self.touch();
    }

    /// Overwrites the byte count, used when a resume starts part-way in.
    pub fn set_bytes(&self, n: u64) {
        self.bytes.store(n, Ordering::Relaxed);
        self.touch();
    }

    /// Refreshes the liveness timestamp without counting bytes.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_progress_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Bytes received so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Time since bytes last arrived, measured at `now`.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.origin
            + Duration::from_millis(self.last_progress_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }
}

/// Parameters for one single-stream transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    /// Source URL.
    pub url: &'a str,
    /// Destination file.
    pub dest: &'a Path,
    /// Digest the finished file must match.
    pub expected_hash: Option<&'a ExpectedHash>,
    /// Size the finished file must have, when known and non-zero.
    pub expected_size: Option<u64>,
    /// Continue from an existing partial file instead of truncating it.
    pub resume: bool,
    /// Wall-clock budget for the whole transfer.
    pub overall_timeout: Duration,
    /// Maximum gap between two received data events.
    pub stall_timeout: Duration,
}

/// Result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes written by this transfer (excludes resumed bytes).
    pub bytes_written: u64,
    /// Final size of the destination file.
    pub total_bytes: u64,
    /// Digest of the whole file, when a hash was requested.
    pub digest: Option<String>,
    /// Whether a partial file was continued.
    pub resumed: bool,
}

/// Downloads `request.url` into `request.dest`.
///
/// # Errors
///
/// - [`DownloadError::Timeout`] when the overall budget elapses
/// - [`DownloadError::Stall`] when no data arrives within the stall window
/// - [`DownloadError::HashMismatch`] / [`DownloadError::Integrity`] when the
///   finished file fails verification (the file is deleted first)
/// - network, status and IO errors otherwise
#[instrument(skip(client, request, progress), fields(url = %request.url, dest = %request.dest.display()))]
pub async fn transfer(
    client: &HttpClient,
    request: TransferRequest<'_>,
    progress: &TransferProgress,
) -> Result<TransferOutcome, DownloadError> {
    match tokio::time::timeout(
        request.overall_timeout,
        transfer_inner(client, request, progress),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            debug!(
                timeout_ms = request.overall_timeout.as_millis(),
                "overall transfer timeout"
            );
            Err(DownloadError::timeout(request.url))
        }
    }
}

async fn transfer_inner(
    client: &HttpClient,
    request: TransferRequest<'_>,
    progress: &TransferProgress,
) -> Result<TransferOutcome, DownloadError> {
    let url = request.url;
    let dest = request.dest;
    let mut hasher = request
        .expected_hash
        .map(|hash| ContentHasher::new(hash.algorithm()));

    let existing_bytes = if request.resume {
        tokio::fs::metadata(dest)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    } else {
        0
    };

    let response = if existing_bytes > 0 {
        let range = format!("bytes={existing_bytes}-");
        match client.get(url, Some(&range)).await {
            Ok(response) => Some(response),
            // nothing left to send: the partial file is already complete
            Err(DownloadError::HttpStatus { status: 416, .. }) => None,
            Err(error) => return Err(error),
        }
    } else {
        Some(client.get(url, None).await?)
    };

    let Some(response) = response else {
        debug!(existing_bytes, "range not satisfiable, verifying existing file");
        if let Some(hasher) = hasher.as_mut() {
            let mut file = File::open(dest)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
            hash_reader(&mut file, hasher)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
        }
        progress.set_bytes(existing_bytes);
        return finish(
            request,
            existing_bytes,
            0,
            hasher.map(ContentHasher::finalize_hex),
            true,
        )
        .await;
    };

    let resumed = existing_bytes > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let mut file = if resumed {
        if let Some(hasher) = hasher.as_mut() {
            let mut existing = File::open(dest)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
            hash_reader(&mut existing, hasher)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
        }
        debug!(existing_bytes, "resuming partial file");
        OpenOptions::new()
            .append(true)
            .open(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?
    } else {
        if existing_bytes > 0 {
            debug!(existing_bytes, "server ignored range request, restarting");
        }
        File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?
    };

    let start = if resumed { existing_bytes } else { 0 };
    progress.set_bytes(start);

    let written = stream_body(
        response,
        &mut file,
        hasher.as_mut(),
        request.stall_timeout,
        url,
        dest,
        |n| progress.record(n),
    )
    .await?;

    finish(
        request,
        start + written,
        written,
        hasher.map(ContentHasher::finalize_hex),
        resumed,
    )
    .await
}

async fn finish(
    request: TransferRequest<'_>,
    total_bytes: u64,
    bytes_written: u64,
    digest: Option<String>,
    resumed: bool,
) -> Result<TransferOutcome, DownloadError> {
    if let Some(expected_size) = request.expected_size
        && expected_size > 0
        && expected_size != total_bytes
    {
        discard(request.dest).await;
        return Err(DownloadError::integrity(
            request.dest,
            expected_size,
            total_bytes,
        ));
    }

    if let (Some(expected), Some(actual)) = (request.expected_hash, digest.as_deref())
        && !expected.matches(actual)
    {
        discard(request.dest).await;
        return Err(DownloadError::hash_mismatch(
            request.dest,
            expected.as_hex(),
            actual,
        ));
    }

    Ok(TransferOutcome {
        bytes_written,
        total_bytes,
        digest,
        resumed,
    })
}

/// Removes a file that failed verification so it cannot pass as valid later.
pub(crate) async fn discard(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "failed to remove unverified file");
    }
}

/// Streams a response body into `file`, enforcing the stall window between
/// data events. `on_bytes` is called once per received chunk, in order.
pub(crate) async fn stream_body(
    response: reqwest::Response,
    file: &mut File,
    mut hasher: Option<&mut ContentHasher>,
    stall_timeout: Duration,
    url: &str,
    file_path: &Path,
    mut on_bytes: impl FnMut(u64),
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let next = match tokio::time::timeout(stall_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Err(DownloadError::stall(url, stall_timeout)),
        };
        let Some(chunk_result) = next else {
            break;
        };
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.update(&chunk);
        }

        let n = chunk.len() as u64;
        bytes_written += n;
        on_bytes(n);
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
