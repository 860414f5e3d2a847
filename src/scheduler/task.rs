//! Task descriptors and snapshots.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::download::{ExpectedHash, HashParseError};

/// Identifier of a download task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps a caller-chosen identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn generated(seq: u64) -> Self {
        Self(format!("task-{seq}"))
    }

    /// Borrowed form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a slot, or waiting out a retry backoff.
    Pending,
    /// Holding an active slot.
    Downloading,
    /// Finished and verified (terminal).
    Completed,
    /// Out of retries (terminal).
    Failed,
    /// Holding an active slot while the manager is paused.
    Paused,
    /// Dropped by a stop before it finished.
    Cancelled,
}

impl TaskStatus {
    /// Stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task will never run again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Rejected task descriptors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No URL given.
    #[error("task url must not be empty")]
    EmptyUrl,

    /// URL does not parse or is not http(s).
    #[error("task url is not a valid http(s) URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// No destination given.
    #[error("task destination must not be empty")]
    EmptyDestination,

    /// Expected hash is malformed.
    #[error("invalid expected hash for {dest}: {source}")]
    InvalidHash {
        /// Destination of the rejected task.
        dest: PathBuf,
        /// Parse failure.
        #[source]
        source: HashParseError,
    },
}

/// A validated description of one file to obtain.
///
/// Built with [`TaskSpec::builder`]; the destination path is the dedup key.
///
/// ```
/// use assetfetch_core::TaskSpec;
///
/// let spec = TaskSpec::builder("https://example.com/a.jar", "libs/a.jar")
///     .priority(5)
///     .size(1024)
///     .hash("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
///     .kind("library")
///     .build()
///     .unwrap();
/// assert_eq!(spec.priority(), 5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    id: Option<TaskId>,
    url: String,
    dest: PathBuf,
    expected_hash: Option<ExpectedHash>,
    size: u64,
    priority: i32,
    kind: Option<String>,
    metadata: Map<String, Value>,
}

impl TaskSpec {
    /// Starts a descriptor for `url` saved at `dest`.
    pub fn builder(url: impl Into<String>, dest: impl Into<PathBuf>) -> TaskSpecBuilder {
        TaskSpecBuilder {
            id: None,
            url: url.into(),
            dest: dest.into(),
            hash: None,
            size: 0,
            priority: 0,
            kind: None,
            metadata: Map::new(),
        }
    }

    /// Caller-supplied id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Destination path.
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Expected digest.
    #[must_use]
    pub fn expected_hash(&self) -> Option<&ExpectedHash> {
        self.expected_hash.as_ref()
    }

    /// Expected size in bytes; zero means unknown.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Scheduling priority; higher runs first.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Free-form category label (e.g. "library", "asset").
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Opaque caller metadata.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Last path component of the destination, for display.
    #[must_use]
    pub fn dest_name(&self) -> String {
        self.dest
            .file_name()
            .map_or_else(|| self.dest.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Returns a copy with a different priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Returns a copy with an extra metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }
}

/// Builder for [`TaskSpec`].
#[derive(Debug, Clone)]
#[must_use]
pub struct TaskSpecBuilder {
    id: Option<TaskId>,
    url: String,
    dest: PathBuf,
    hash: Option<String>,
    size: u64,
    priority: i32,
    kind: Option<String>,
    metadata: Map<String, Value>,
}

impl TaskSpecBuilder {
    /// Uses a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(TaskId::new(id));
        self
    }

    /// Expected hex digest (SHA-1 or SHA-256). Empty strings are ignored.
    pub fn hash(mut self, hex: impl Into<String>) -> Self {
        let hex = hex.into();
        self.hash = if hex.trim().is_empty() { None } else { Some(hex) };
        self
    }

    /// Expected size in bytes.
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Category label.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Adds an opaque metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validates and builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] for an empty or non-http(s) URL, an empty
    /// destination, or a malformed hash.
    pub fn build(self) -> Result<TaskSpec, TaskError> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(TaskError::EmptyUrl);
        }
        match Url::parse(&url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(TaskError::InvalidUrl { url }),
        }
        if self.dest.as_os_str().is_empty() {
            return Err(TaskError::EmptyDestination);
        }
        let expected_hash = self
            .hash
            .as_deref()
            .map(ExpectedHash::parse)
            .transpose()
            .map_err(|source| TaskError::InvalidHash {
                dest: self.dest.clone(),
                source,
            })?;

        Ok(TaskSpec {
            id: self.id,
            url,
            dest: self.dest,
            expected_hash,
            size: self.size,
            priority: self.priority,
            kind: self.kind,
            metadata: self.metadata,
        })
    }
}

/// Point-in-time view of a task's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// URL actually fetched (after mirror rewriting).
    pub url: String,
    /// Destination path.
    pub dest: PathBuf,
    /// Current status.
    pub status: TaskStatus,
    /// Scheduling priority.
    pub priority: i32,
    /// Known size in bytes; zero when unknown.
    pub size: u64,
    /// Bytes received in the current or last attempt.
    pub downloaded: u64,
    /// Average speed of the current attempt in bytes per second.
    pub speed_bps: f64,
    /// Failures so far.
    pub retry_count: u32,
    /// Bytes per chunk, in index order, for chunked transfers.
    pub chunk_progress: Vec<u64>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Category label.
    pub kind: Option<String>,
    /// Opaque caller metadata.
    pub metadata: Map<String, Value>,
}
