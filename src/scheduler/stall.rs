//! Stall and wall-clock backstop for active tasks.
//!
//! Transfers already carry their own timeouts, but a connection that neither
//! sends data nor closes can outlive them (for example while a chunk merge or
//! a HEAD probe is parked). The detector scans a snapshot of active tasks on a
//! fixed tick and returns verdicts; the manager turns each verdict into the
//! normal failure path, guarded by the task's attempt number so a task already
//! leaving the active set is never failed twice.

use std::time::{Duration, Instant};

use super::config::StallConfig;
use super::task::TaskId;
use crate::download::DownloadError;

/// What the detector needs to know about one active attempt.
#[derive(Debug, Clone)]
pub struct ActiveTaskView {
    /// Task id.
    pub id: TaskId,
    /// Attempt number the verdict applies to.
    pub attempt: u64,
    /// URL being fetched, for the error message.
    pub url: String,
    /// When the attempt took its slot.
    pub started_at: Instant,
    /// Time since bytes last arrived.
    pub idle: Duration,
    /// Known size, zero when unknown.
    pub size: u64,
}

/// Why an attempt is being force-failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// No bytes within the stall window.
    Stalled {
        /// Observed idle time.
        idle: Duration,
    },
    /// The wall-clock budget for the file size ran out.
    TimedOut {
        /// Time since the attempt started.
        elapsed: Duration,
        /// Budget that applied.
        limit: Duration,
    },
}

impl StallVerdict {
    /// Error fed into the retry state machine.
    #[must_use]
    pub fn into_error(self, url: &str) -> DownloadError {
        match self {
            Self::Stalled { idle } => DownloadError::stall(url, idle),
            Self::TimedOut { .. } => DownloadError::timeout(url),
        }
    }
}

/// Pure verdict function over active-task views.
#[derive(Debug, Clone)]
pub struct StallDetector {
    config: StallConfig,
    large_file_threshold: u64,
}

impl StallDetector {
    /// Creates a detector; files above `large_file_threshold` get the large budget.
    #[must_use]
    pub fn new(config: StallConfig, large_file_threshold: u64) -> Self {
        Self {
            config,
            large_file_threshold,
        }
    }

    /// Tick period.
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.config.tick
    }

    /// Wall-clock budget for a file of `size` bytes.
    #[must_use]
    pub fn timeout_for(&self, size: u64) -> Duration {
        if size > self.large_file_threshold {
            self.config.large_file_timeout
        } else {
            self.config.small_file_timeout
        }
    }

    /// Verdict for one attempt, or `None` when it is healthy.
    #[must_use]
    pub fn check(&self, now: Instant, view: &ActiveTaskView) -> Option<StallVerdict> {
        let elapsed = now.saturating_duration_since(view.started_at);
        let limit = self.timeout_for(view.size);
        if elapsed > limit {
            return Some(StallVerdict::TimedOut { elapsed, limit });
        }
        if view.idle > self.config.stall_window {
            return Some(StallVerdict::Stalled { idle: view.idle });
        }
        None
    }

    /// Verdicts for every unhealthy attempt in `views`.
    pub fn scan<'a>(
        &'a self,
        now: Instant,
        views: &'a [ActiveTaskView],
    ) -> impl Iterator<Item = (&'a ActiveTaskView, StallVerdict)> + 'a {
        views
            .iter()
            .filter_map(move |view| self.check(now, view).map(|verdict| (view, verdict)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn detector() -> StallDetector {
        StallDetector::new(StallConfig::default(), 5 * MIB)
    }

    fn view(started_at: Instant, idle_secs: u64, size: u64) -> ActiveTaskView {
        ActiveTaskView {
            id: TaskId::new("t"),
            attempt: 1,
            url: "https://example.com/t".to_string(),
            started_at,
            idle: Duration::from_secs(idle_secs),
            size,
        }
    }

    #[test]
    fn test_healthy_task_has_no_verdict() {
        let now = Instant::now();
        let started = now.checked_sub(Duration::from_secs(3)).unwrap_or(now);
        assert_eq!(detector().check(now, &view(started, 1, 100)), None);
    }

    #[test]
    fn test_idle_beyond_window_is_a_stall() {
        let now = Instant::now();
        let verdict = detector().check(now, &view(now, 11, 100));
        assert_eq!(
            verdict,
            Some(StallVerdict::Stalled {
                idle: Duration::from_secs(11)
            })
        );
    }

    #[test]
    fn test_budget_depends_on_size() {
        let d = detector();
        assert_eq!(d.timeout_for(MIB), Duration::from_secs(15));
        assert_eq!(d.timeout_for(5 * MIB), Duration::from_secs(15));
        assert_eq!(d.timeout_for(6 * MIB), Duration::from_secs(60));

        let started = Instant::now();
        let now = started + Duration::from_secs(20);
        assert!(matches!(
            d.check(now, &view(started, 0, MIB)),
            Some(StallVerdict::TimedOut { .. })
        ));
        assert_eq!(d.check(now, &view(started, 0, 50 * MIB)), None);
    }

    #[test]
    fn test_scan_reports_only_unhealthy() {
        let now = Instant::now();
        let views = vec![view(now, 0, 1), view(now, 30, 1), view(now, 2, 1)];
        let d = detector();
        let verdicts: Vec<_> = d.scan(now, &views).collect();
        assert_eq!(verdicts.len(), 1);
    }

    #[test]
    fn test_verdict_maps_to_retryable_errors() {
        let stall = StallVerdict::Stalled {
            idle: Duration::from_secs(12),
        }
        .into_error("https://example.com/a");
        assert!(matches!(stall, DownloadError::Stall { .. }));
        let timeout = StallVerdict::TimedOut {
            elapsed: Duration::from_secs(20),
            limit: Duration::from_secs(15),
        }
        .into_error("https://example.com/a");
        assert!(matches!(timeout, DownloadError::Timeout { .. }));
    }
}
