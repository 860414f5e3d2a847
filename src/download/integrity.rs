//! On-disk integrity checks.
//!
//! Files are hashed in bounded reads with a cooperative yield every few reads,
//! so hashing a multi-gigabyte file never holds a worker thread for long and
//! never loads the file into memory.
//!
//! The algorithm is inferred from the expected digest: 40 hex characters is
//! SHA-1 (what the content store publishes), 64 is SHA-256.

use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use super::constants::{HASH_READ_BUFFER_BYTES, READS_PER_YIELD};

/// Supported content digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1, 40 hex characters.
    Sha1,
    /// SHA-256, 64 hex characters.
    Sha256,
}

impl HashAlgorithm {
    /// Picks the algorithm whose hex digest has `len` characters.
    #[must_use]
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

/// Rejected expected-hash strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    /// Length matches no supported algorithm.
    #[error("unsupported digest length {len}: expected 40 (sha1) or 64 (sha256) hex characters")]
    UnsupportedLength {
        /// Observed length.
        len: usize,
    },

    /// Contains non-hex characters.
    #[error("digest is not valid hex: {value}")]
    NotHex {
        /// The rejected value.
        value: String,
    },
}

/// A validated expected digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedHash {
    algorithm: HashAlgorithm,
    hex: String,
}

impl ExpectedHash {
    /// Parses a hex digest, inferring the algorithm from its length.
    ///
    /// # Errors
    ///
    /// Returns [`HashParseError`] for unsupported lengths or non-hex input.
    pub fn parse(value: &str) -> Result<Self, HashParseError> {
        let trimmed = value.trim();
        let algorithm = HashAlgorithm::from_hex_len(trimmed.len()).ok_or(
            HashParseError::UnsupportedLength {
                len: trimmed.len(),
            },
        )?;
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashParseError::NotHex {
                value: trimmed.to_string(),
            });
        }
        Ok(Self {
            algorithm,
            hex: trimmed.to_ascii_lowercase(),
        })
    }

    /// The inferred algorithm.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Case-insensitive comparison against a computed digest.
    #[must_use]
    pub fn matches(&self, actual_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(actual_hex)
    }
}

impl std::fmt::Display for ExpectedHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Incremental hasher over either supported algorithm.
#[derive(Debug, Clone)]
pub enum ContentHasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-256 state.
    Sha256(Sha256),
}

impl ContentHasher {
    /// Creates an empty hasher.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
        }
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Outcome of checking one file against its expected size and digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Nothing at the path.
    Missing,
    /// Present and matching every supplied expectation.
    Valid,
    /// Present but the size or digest differs.
    Corrupted,
}

/// Streams everything readable from `file` into `hasher`.
///
/// Returns the number of bytes consumed.
///
/// # Errors
///
/// Propagates read errors.
pub async fn hash_reader(file: &mut File, hasher: &mut ContentHasher) -> std::io::Result<u64> {
    let mut buffer = vec![0_u8; HASH_READ_BUFFER_BYTES];
    let mut total: u64 = 0;
    let mut reads = 0_usize;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
        reads += 1;
        if reads % READS_PER_YIELD == 0 {
            tokio::task::yield_now().await;
        }
    }
    Ok(total)
}

/// Computes the hex digest of the file at `path`.
///
/// # Errors
///
/// Propagates open and read errors.
#[instrument(level = "debug", fields(path = %path.display()))]
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = ContentHasher::new(algorithm);
    let bytes = hash_reader(&mut file, &mut hasher).await?;
    let digest = hasher.finalize_hex();
    debug!(bytes, digest = %digest, "hashed file");
    Ok(digest)
}

/// Decides whether the file at `path` can be used as-is.
///
/// - absent file: `false`
/// - present and no expected hash: `true`
/// - otherwise: whether the computed digest matches
pub async fn is_valid(path: &Path, expected: Option<&ExpectedHash>) -> bool {
    if tokio::fs::metadata(path).await.is_err() {
        return false;
    }
    let Some(expected) = expected else {
        return true;
    };
    match hash_file(path, expected.algorithm()).await {
        Ok(actual) => expected.matches(&actual),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "failed to hash existing file");
            false
        }
    }
}

/// Classifies a file against an optional size and optional digest.
///
/// The size check runs first so truncated files are rejected without hashing.
pub async fn check_file(
    path: &Path,
    expected_size: Option<u64>,
    expected: Option<&ExpectedHash>,
) -> FileState {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return FileState::Missing;
    };
    if !metadata.is_file() {
        return FileState::Corrupted;
    }
    if let Some(size) = expected_size
        && size > 0
        && metadata.len() != size
    {
        debug!(
            path = %path.display(),
            expected = size,
            actual = metadata.len(),
            "size mismatch"
        );
        return FileState::Corrupted;
    }
    if is_valid(path, expected).await {
        FileState::Valid
    } else {
        FileState::Corrupted
    }
}
