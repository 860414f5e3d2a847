//! Multi-range downloads for large files.
//!
//! A file of known size is split into at most `max_threads` byte ranges, each
//! fetched concurrently into its own temporary file. The segments are then
//! concatenated in index order into a sibling `.part` file while hashing, and
//! the `.part` file is renamed over the destination only after it verifies.
//! The per-task work directory is removed whether the download succeeds,
//! fails, or is aborted mid-flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::try_join_all;
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::constants::{HASH_READ_BUFFER_BYTES, READS_PER_YIELD};
use super::error::DownloadError;
use super::integrity::{ContentHasher, ExpectedHash, HashAlgorithm};
use super::transfer::{TransferProgress, discard, stream_body};

/// One byte range of a chunked download.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    /// Position in the merge order.
    pub index: usize,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (inclusive).
    pub end: u64,
    /// Temporary segment file.
    pub temp_path: PathBuf,
    downloaded: Arc<AtomicU64>,
}

impl ChunkDescriptor {
    /// Number of bytes in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a planned chunk covers at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Bytes received for this chunk so far.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Shared counter, so observers can read chunk progress while it runs.
    #[must_use]
    pub fn progress_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.downloaded)
    }

    fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Splits `[0, size)` into contiguous ranges.
///
/// The chunk count is `min(ceil(size / chunk_size), max_threads)` and every
/// range but the last has `ceil(size / count)` bytes.
#[must_use]
pub fn plan_chunks(
    size: u64,
    chunk_size: u64,
    max_threads: usize,
    work_dir: &Path,
) -> Vec<ChunkDescriptor> {
    if size == 0 {
        return Vec::new();
    }
    let by_size = size.div_ceil(chunk_size.max(1));
    let count = by_size.min(max_threads.max(1) as u64).max(1);
    let per_chunk = size.div_ceil(count);

    let mut chunks = Vec::new();
    let mut start = 0_u64;
    let mut index = 0_usize;
    while start < size {
        let end = (start + per_chunk).min(size) - 1;
        chunks.push(ChunkDescriptor {
            index,
            start,
            end,
            temp_path: work_dir.join(format!("chunk-{index}")),
            downloaded: Arc::new(AtomicU64::new(0)),
        });
        start = end + 1;
        index += 1;
    }
    chunks
}

/// Parameters for one chunked download.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedRequest<'a> {
    /// Source URL (must honour `Range`).
    pub url: &'a str,
    /// Final destination.
    pub dest: &'a Path,
    /// Total size; the chunks must cover exactly this many bytes.
    pub size: u64,
    /// Digest the merged file must match.
    pub expected_hash: Option<&'a ExpectedHash>,
    /// Directory that holds the segment files; removed afterwards.
    pub work_dir: &'a Path,
}

/// Result of a successful chunked download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedOutcome {
    /// Bytes in the merged file.
    pub total_bytes: u64,
    /// Digest of the merged file.
    pub digest: String,
    /// Number of ranges fetched.
    pub chunk_count: usize,
}

/// Drives concurrent range requests and the ordered merge.
#[derive(Debug, Clone)]
pub struct ChunkedDownloader {
    client: HttpClient,
    chunk_size: u64,
    max_threads: usize,
    chunk_timeout: Duration,
    stall_timeout: Duration,
}

impl ChunkedDownloader {
    /// Creates a downloader that shares `client`'s connection pool.
    #[must_use]
    pub fn new(
        client: HttpClient,
        chunk_size: u64,
        max_threads: usize,
        chunk_timeout: Duration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            client,
            chunk_size,
            max_threads,
            chunk_timeout,
            stall_timeout,
        }
    }

    /// Plans the ranges for a file of `size` bytes inside `work_dir`.
    #[must_use]
    pub fn plan(&self, size: u64, work_dir: &Path) -> Vec<ChunkDescriptor> {
        plan_chunks(size, self.chunk_size, self.max_threads, work_dir)
    }

    /// Fetches every planned chunk, merges them and verifies the result.
    ///
    /// Each received byte is counted both on its chunk and on `progress`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::RangeNotSupported`] when a segment comes back as a full body
    /// - [`DownloadError::Integrity`] / [`DownloadError::HashMismatch`] when the
    ///   merged file fails verification; the destination is left untouched
    /// - network, stall, timeout and IO errors from any segment
    #[instrument(skip(self, request, chunks, progress), fields(url = %request.url, size = request.size, chunks = chunks.len()))]
    pub async fn download(
        &self,
        request: ChunkedRequest<'_>,
        chunks: &[ChunkDescriptor],
        progress: &TransferProgress,
    ) -> Result<ChunkedOutcome, DownloadError> {
        let guard = WorkDirGuard::new(request.work_dir);
        let result = self.download_inner(request, chunks, progress).await;
        guard.cleanup().await;
        result
    }

    async fn download_inner(
        &self,
        request: ChunkedRequest<'_>,
        chunks: &[ChunkDescriptor],
        progress: &TransferProgress,
    ) -> Result<ChunkedOutcome, DownloadError> {
        tokio::fs::create_dir_all(request.work_dir)
            .await
            .map_err(|e| DownloadError::io(request.work_dir, e))?;

        progress.set_bytes(0);
        try_join_all(
            chunks
                .iter()
                .map(|chunk| self.fetch_chunk(request.url, chunk, progress)),
        )
        .await?;

        let algorithm = request
            .expected_hash
            .map_or(HashAlgorithm::Sha1, ExpectedHash::algorithm);
        let part_path = part_path(request.dest);
        let part_guard = PartFileGuard::new(&part_path);
        let (total_bytes, digest) = merge_chunks(chunks, &part_path, algorithm).await?;

        if total_bytes != request.size {
            discard(&part_path).await;
            return Err(DownloadError::integrity(
                request.dest,
                request.size,
                total_bytes,
            ));
        }
        if let Some(expected) = request.expected_hash
            && !expected.matches(&digest)
        {
            discard(&part_path).await;
            return Err(DownloadError::hash_mismatch(
                request.dest,
                expected.as_hex(),
                digest,
            ));
        }

        if let Err(error) = tokio::fs::rename(&part_path, request.dest).await {
            discard(&part_path).await;
            return Err(DownloadError::io(request.dest, error));
        }
        part_guard.disarm();

        info!(
            dest = %request.dest.display(),
            bytes = total_bytes,
            chunks = chunks.len(),
            "chunked download merged"
        );

        Ok(ChunkedOutcome {
            total_bytes,
            digest,
            chunk_count: chunks.len(),
        })
    }

    async fn fetch_chunk(
        &self,
        url: &str,
        chunk: &ChunkDescriptor,
        progress: &TransferProgress,
    ) -> Result<(), DownloadError> {
        let fetch = async {
            let response = self.client.get(url, Some(&chunk.range_header())).await?;
            if response.status() != StatusCode::PARTIAL_CONTENT {
                return Err(DownloadError::range_not_supported(url));
            }
            let mut file = File::create(&chunk.temp_path)
                .await
                .map_err(|e| DownloadError::io(&chunk.temp_path, e))?;
            chunk.downloaded.store(0, Ordering::Relaxed);
            let written = stream_body(
                response,
                &mut file,
                None,
                self.stall_timeout,
                url,
                &chunk.temp_path,
                |n| {
                    chunk.downloaded.fetch_add(n, Ordering::Relaxed);
                    progress.record(n);
                },
            )
            .await?;
            if written != chunk.len() {
                return Err(DownloadError::integrity(
                    &chunk.temp_path,
                    chunk.len(),
                    written,
                ));
            }
            debug!(index = chunk.index, bytes = written, "chunk complete");
            Ok(())
        };

        match tokio::time::timeout(self.chunk_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::timeout(url)),
        }
    }
}

/// Concatenates chunk files in index order into `dest`, hashing as it writes.
///
/// Returns the merged size and lowercase hex digest.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if a segment cannot be read or `dest` written.
pub async fn merge_chunks(
    chunks: &[ChunkDescriptor],
    dest: &Path,
    algorithm: HashAlgorithm,
) -> Result<(u64, String), DownloadError> {
    let mut ordered: Vec<&ChunkDescriptor> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.index);

    let out = File::create(dest)
        .await
        .map_err(|e| DownloadError::io(dest, e))?;
    let mut writer = BufWriter::new(out);
    let mut hasher = ContentHasher::new(algorithm);
    let mut buffer = vec![0_u8; HASH_READ_BUFFER_BYTES];
    let mut total: u64 = 0;
    let mut reads = 0_usize;

    for chunk in ordered {
        let mut segment = File::open(&chunk.temp_path)
            .await
            .map_err(|e| DownloadError::io(&chunk.temp_path, e))?;
        loop {
            let n = segment
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io(&chunk.temp_path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
            total += n as u64;
            reads += 1;
            if reads % READS_PER_YIELD == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(dest, e))?;

    Ok((total, hasher.finalize_hex()))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Removes a chunk work directory when dropped, so segment files do not
/// survive an aborted task. [`cleanup`](Self::cleanup) does the same without
/// blocking and disarms the drop.
struct WorkDirGuard {
    path: Option<PathBuf>,
}

impl WorkDirGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    async fn cleanup(mut self) {
        if let Some(path) = self.path.take()
            && let Err(error) = tokio::fs::remove_dir_all(&path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %error, "failed to remove chunk directory");
        }
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}

/// Removes a half-written merge target when the merge fails or is aborted.
struct PartFileGuard {
    path: Option<PathBuf>,
}

impl PartFileGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// The file was renamed into place; nothing to remove.
    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for PartFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ==================== Planning Tests ====================

    #[test]
    fn test_plan_chunks_caps_at_max_threads() {
        let dir = Path::new("/tmp/work");
        let chunks = plan_chunks(100 * 1024 * 1024, 8 * 1024 * 1024, 8, dir);
        assert_eq!(chunks.len(), 8);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, 100 * 1024 * 1024 - 1);
    }

    #[test]
    fn test_plan_chunks_uses_size_when_fewer_chunks_needed() {
        let chunks = plan_chunks(20, 8, 8, Path::new("/w"));
        // ceil(20/8) = 3 chunks of ceil(20/3) = 7 bytes
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(ChunkDescriptor::len).collect::<Vec<_>>(),
            vec![7, 7, 6]
        );
    }

    #[test]
    fn test_plan_chunks_ranges_are_contiguous_and_cover_file() {
        let size = 1_000_003;
        let chunks = plan_chunks(size, 65_536, 6, Path::new("/w"));
        let mut expected_start = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.start, expected_start);
            assert!(chunk.end >= chunk.start);
            expected_start = chunk.end + 1;
        }
        assert_eq!(expected_start, size);
        assert_eq!(chunks[2].temp_path, Path::new("/w/chunk-2"));
    }

    #[test]
    fn test_plan_chunks_empty_file() {
        assert!(plan_chunks(0, 8, 4, Path::new("/w")).is_empty());
    }

    // ==================== Merge Tests ====================

    #[tokio::test]
    async fn test_merge_chunks_matches_single_stream_hash() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..200_000_u32).map(|i| (i % 253) as u8).collect();
        let chunks = plan_chunks(data.len() as u64, 30_000, 5, dir.path());
        // write segments out of order to prove ordering comes from the index
        for chunk in chunks.iter().rev() {
            let start = usize::try_from(chunk.start).unwrap();
            let end = usize::try_from(chunk.end).unwrap();
            std::fs::write(&chunk.temp_path, &data[start..=end]).unwrap();
        }

        let dest = dir.path().join("merged.bin");
        let (total, digest) = merge_chunks(&chunks, &dest, HashAlgorithm::Sha1)
            .await
            .unwrap();

        let mut single = ContentHasher::new(HashAlgorithm::Sha1);
        single.update(&data);
        assert_eq!(total, data.len() as u64);
        assert_eq!(digest, single.finalize_hex());
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_part_path_is_sibling() {
        assert_eq!(
            part_path(Path::new("/game/versions/1.20/1.20.jar")),
            Path::new("/game/versions/1.20/1.20.jar.part")
        );
    }

    #[test]
    fn test_part_file_guard_removes_unless_disarmed() {
        let dir = TempDir::new().unwrap();
        let dropped = dir.path().join("a.jar.part");
        let kept = dir.path().join("b.jar.part");
        std::fs::write(&dropped, b"half").unwrap();
        std::fs::write(&kept, b"whole").unwrap();
        {
            let _guard = PartFileGuard::new(&dropped);
        }
        PartFileGuard::new(&kept).disarm();
        assert!(!dropped.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_work_dir_guard_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("task-1");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("chunk-0"), b"x").unwrap();
        {
            let _guard = WorkDirGuard::new(&work);
        }
        assert!(!work.exists());
    }
}
