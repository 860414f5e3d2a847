//! Manager-level errors.
//!
//! Individual task failures never surface here; they are reported through
//! [`DownloadEvent::TaskFailed`](super::DownloadEvent::TaskFailed). These
//! variants cover construction and control-surface misuse only.

use std::path::PathBuf;

use thiserror::Error;

use super::concurrency::ConcurrencyOutOfRange;
use super::config::ConfigError;
use super::task::TaskId;
use crate::download::DownloadError;

/// Errors returned by [`DownloadManager`](super::DownloadManager) methods.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Configuration failed validation.
    #[error("invalid manager configuration: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] DownloadError),

    /// Manual concurrency outside the configured bounds.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyOutOfRange),

    /// A caller-chosen id is already used by a task with another destination.
    #[error("task id {id} is already used for {}", .existing_dest.display())]
    DuplicateTaskId {
        /// Conflicting id.
        id: TaskId,
        /// Destination of the task that owns the id.
        existing_dest: PathBuf,
    },

    /// The manager was stopped; call `reset` before reusing it.
    #[error("download manager is stopped")]
    Stopped,

    /// Constructed outside a Tokio runtime.
    #[error("download manager must be created inside a Tokio runtime")]
    NoRuntime,
}
