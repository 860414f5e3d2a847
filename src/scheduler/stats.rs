//! Aggregate and bandwidth statistics.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::concurrency::AdjustmentRecord;

/// File and byte counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    /// Tasks ever accepted.
    pub total_files: usize,
    /// Tasks completed, including ones skipped as already valid.
    pub completed_files: usize,
    /// Tasks out of retries.
    pub failed_files: usize,
    /// Sum of known task sizes.
    pub total_bytes: u64,
    /// Bytes of completed files plus bytes received by active transfers.
    pub downloaded_bytes: u64,
    /// Tasks holding a slot.
    pub active_count: usize,
    /// Tasks waiting for a slot or a retry.
    pub queued_count: usize,
    /// Most recent session speed sample, bytes per second.
    pub speed_bps: f64,
}

impl AggregateStats {
    /// Downloaded over total bytes as a percentage. Falls back to the file
    /// ratio when no sizes are known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> f64 {
        let percent = if self.total_bytes > 0 {
            self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0
        } else if self.total_files > 0 {
            (self.completed_files + self.failed_files) as f64 / self.total_files as f64 * 100.0
        } else {
            0.0
        };
        percent.clamp(0.0, 100.0)
    }

    /// Tasks that reached a terminal state.
    #[must_use]
    pub fn finished_files(&self) -> usize {
        self.completed_files + self.failed_files
    }
}

/// Throughput view including controller state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthStats {
    /// Most recent sample, bytes per second.
    pub current_speed: f64,
    /// Mean of the controller's sample window.
    pub average_speed: f64,
    /// Highest sample this session.
    pub peak_speed: f64,
    /// Average speed over the controller's throughput model.
    pub efficiency: f64,
    /// Bytes received by all attempts this session.
    pub total_transferred: u64,
    /// Time since the session started.
    pub session_elapsed: Duration,
    /// Current ceiling.
    pub concurrency: usize,
    /// Ceiling floor.
    pub min_concurrency: usize,
    /// Ceiling bound.
    pub max_concurrency: usize,
    /// Recorded ceiling changes, oldest first.
    pub adjustments: Vec<AdjustmentRecord>,
}

/// Turns a monotonically growing byte counter into speed samples.
#[derive(Debug)]
pub(crate) struct SpeedMeter {
    last_total: u64,
    last_at: Instant,
    current: f64,
    peak: f64,
}

impl SpeedMeter {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            last_total: 0,
            last_at: now,
            current: 0.0,
            peak: 0.0,
        }
    }

    /// Speed since the previous sample. A zero-length interval repeats the
    /// previous value.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn sample(&mut self, total_transferred: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return self.current;
        }
        let delta = total_transferred.saturating_sub(self.last_total);
        self.current = delta as f64 / elapsed;
        self.peak = self.peak.max(self.current);
        self.last_total = total_transferred;
        self.last_at = now;
        self.current
    }

    pub(crate) fn current(&self) -> f64 {
        self.current
    }

    pub(crate) fn peak(&self) -> f64 {
        self.peak
    }
}
