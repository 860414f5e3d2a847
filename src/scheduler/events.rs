//! Typed progress events.
//!
//! The manager broadcasts these on a `tokio::sync::broadcast` channel; every
//! [`DownloadManager::subscribe`](super::DownloadManager::subscribe) call gets
//! its own receiver. Events for one task are sent in the order they happened.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::concurrency::AdjustmentRecord;
use super::task::TaskId;

/// Aggregate progress payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Task whose bytes triggered this update, if any.
    pub task_id: Option<TaskId>,
    /// Completed bytes over known total bytes, 0 to 100.
    pub total_progress_percent: f64,
    /// Session speed in bytes per second.
    pub aggregate_speed: f64,
    /// Bytes of completed files plus bytes of active transfers.
    pub downloaded_bytes: u64,
    /// Sum of known sizes of all tasks.
    pub total_bytes: u64,
    /// Tasks holding a slot.
    pub active_count: usize,
    /// Tasks waiting for a slot or a retry.
    pub queued_count: usize,
}

/// Final accounting of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    /// Tasks that finished (including skip-if-valid).
    pub completed: usize,
    /// Tasks that exhausted their retries.
    pub failed: usize,
    /// Tasks ever accepted.
    pub total: usize,
}

impl CompletionSummary {
    /// Whether every task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Everything a progress sink can observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DownloadEvent {
    /// A task took an active slot.
    #[serde(rename_all = "camelCase")]
    TaskStarted {
        /// Task id.
        id: TaskId,
        /// Destination file name.
        dest_name: String,
        /// Known size, zero when unknown.
        size: u64,
    },
    /// Throttled aggregate progress.
    Progress(ProgressUpdate),
    /// A task finished and verified.
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        /// Task id.
        id: TaskId,
        /// Destination file name.
        dest_name: String,
    },
    /// A task failed and will run again after `delay`.
    #[serde(rename_all = "camelCase")]
    TaskRetrying {
        /// Task id.
        id: TaskId,
        /// Destination file name.
        dest_name: String,
        /// Failure message.
        error: String,
        /// Failures so far.
        retry_count: u32,
        /// Backoff before re-queueing.
        delay: Duration,
    },
    /// A task is out of retries.
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        /// Task id.
        id: TaskId,
        /// Destination file name.
        dest_name: String,
        /// Failure message.
        error: String,
        /// Failures recorded.
        retry_count: u32,
    },
    /// Nothing is pending, retrying or active.
    AllCompleted(CompletionSummary),
    /// The controller or a caller changed the ceiling.
    ConcurrencyAdjusted(AdjustmentRecord),
}

impl DownloadEvent {
    /// Kebab-case event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task-started",
            Self::Progress(_) => "progress",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskRetrying { .. } => "task-retrying",
            Self::TaskFailed { .. } => "task-failed",
            Self::AllCompleted(_) => "all-completed",
            Self::ConcurrencyAdjusted(_) => "concurrency-adjusted",
        }
    }
}

/// Rate limiter for progress events.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true and arms the throttle when an event may go out at `now`.
    pub(crate) fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
