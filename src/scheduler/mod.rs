//! Download orchestration: priority queue, adaptive concurrency, retry state
//! machine and stall detection.
//!
//! # Architecture
//!
//! - [`DownloadManager`] - session handle: enqueue, control, stats, events
//! - [`TaskSpec`] - validated descriptor of one file to obtain
//! - [`AdaptiveController`] - ceiling decisions from throughput samples
//! - [`StallDetector`] - backstop verdicts for stuck attempts
//! - [`DownloadEvent`] - typed events on a broadcast channel
//! - [`ManagerConfig`] - every tuning constant, validated at construction
//!
//! # Task lifecycle
//!
//! ```text
//! Pending ──admit──▶ Downloading ──ok──▶ Completed
//!    ▲                   │
//!    └──backoff──── failed-retry
//!                        │ (retries exhausted or permanent)
//!                        ▼
//!                      Failed
//! ```

mod concurrency;
mod config;
mod error;
mod events;
mod manager;
mod stall;
mod stats;
mod task;

pub use concurrency::{
    AdaptiveController, AdjustmentReason, AdjustmentRecord, ConcurrencyOutOfRange,
    ConcurrencyState,
};
pub use config::{ConfigError, ControllerConfig, ManagerConfig, StallConfig};
pub use error::ManagerError;
pub use events::{CompletionSummary, DownloadEvent, ProgressUpdate};
pub use manager::DownloadManager;
pub use stall::{ActiveTaskView, StallDetector, StallVerdict};
pub use stats::{AggregateStats, BandwidthStats};
pub use task::{TaskError, TaskId, TaskSnapshot, TaskSpec, TaskSpecBuilder, TaskStatus};
