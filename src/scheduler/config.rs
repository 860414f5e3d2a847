//! Manager configuration and validation.
//!
//! All tuning constants live here. Invalid combinations are programmer
//! errors and are rejected when the manager is constructed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::RetryPolicy;

const MIB: u64 = 1024 * 1024;

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Concurrency bounds are inverted or zero.
    #[error("invalid concurrency bounds: min {min}, max {max} (expected 1 <= min <= max)")]
    InvalidBounds {
        /// Configured floor.
        min: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Starting ceiling lies outside the bounds.
    #[error("initial concurrency {initial} outside [{min}, {max}]")]
    InitialOutOfRange {
        /// Configured starting value.
        initial: usize,
        /// Configured floor.
        min: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// A value that must be positive is zero.
    #[error("`{field}` must be greater than zero")]
    Zero {
        /// Offending field.
        field: &'static str,
    },

    /// A value is out of its valid range.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Tuning for the adaptive concurrency controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Lowest ceiling the controller may choose.
    pub min_concurrency: usize,
    /// Highest ceiling the controller may choose.
    pub max_concurrency: usize,
    /// Ceiling at session start.
    pub initial_concurrency: usize,
    /// How often aggregate speed is sampled.
    pub sample_interval: Duration,
    /// Minimum gap between two adjustments.
    pub cooldown: Duration,
    /// Samples required before the first adjustment.
    pub min_samples: usize,
    /// Samples kept in the rolling window.
    pub history_size: usize,
    /// Samples averaged for the "recent" trend.
    pub recent_window: usize,
    /// Assumed throughput of one connection, bytes per second.
    pub per_connection_bps: f64,
    /// Efficiency above which the controller grows aggressively.
    pub high_efficiency: f64,
    /// Efficiency above which the controller grows by one step.
    pub moderate_efficiency: f64,
    /// Efficiency below which the controller shrinks.
    pub low_efficiency: f64,
    /// Fraction of `max_concurrency` the moderate rule may grow up to.
    pub moderate_ceiling_ratio: f64,
    /// Recent/average ratio that counts as trending up.
    pub trend_up_ratio: f64,
    /// Recent/average ratio that counts as trending down.
    pub trend_down_ratio: f64,
    /// Standard step size.
    pub step: usize,
    /// Multiplier applied to `step` by the aggressive rule.
    pub aggressive_multiplier: usize,
    /// Fraction of the current ceiling removed by a decrease (at least `step`).
    pub decrease_ratio: f64,
    /// Adjustment records kept for diagnostics.
    pub adjustment_history: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 4,
            max_concurrency: 48,
            initial_concurrency: 12,
            sample_interval: Duration::from_secs(3),
            cooldown: Duration::from_secs(5),
            min_samples: 3,
            history_size: 10,
            recent_window: 3,
            per_connection_bps: (2 * MIB) as f64,
            high_efficiency: 0.85,
            moderate_efficiency: 0.7,
            low_efficiency: 0.5,
            moderate_ceiling_ratio: 0.8,
            trend_up_ratio: 1.1,
            trend_down_ratio: 0.8,
            step: 2,
            aggressive_multiplier: 2,
            decrease_ratio: 0.2,
            adjustment_history: 20,
        }
    }
}

impl ControllerConfig {
    /// Fixed bounds with the same starting ceiling; no adaptive headroom.
    #[must_use]
    pub fn fixed(concurrency: usize) -> Self {
        Self {
            min_concurrency: concurrency,
            max_concurrency: concurrency,
            initial_concurrency: concurrency,
            ..Self::default()
        }
    }

    /// Checks bounds and intervals.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency == 0 || self.min_concurrency > self.max_concurrency {
            return Err(ConfigError::InvalidBounds {
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        if !(self.min_concurrency..=self.max_concurrency).contains(&self.initial_concurrency) {
            return Err(ConfigError::InitialOutOfRange {
                initial: self.initial_concurrency,
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        non_zero_duration("sample_interval", self.sample_interval)?;
        non_zero("min_samples", self.min_samples)?;
        non_zero("recent_window", self.recent_window)?;
        non_zero("step", self.step)?;
        non_zero("aggressive_multiplier", self.aggressive_multiplier)?;
        if self.history_size < self.min_samples.max(self.recent_window) {
            return Err(ConfigError::Invalid {
                field: "history_size",
                reason: format!(
                    "{} is smaller than min_samples/recent_window",
                    self.history_size
                ),
            });
        }
        if self.per_connection_bps.is_nan() || self.per_connection_bps <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "per_connection_bps",
                reason: "must be a positive number".to_string(),
            });
        }
        if !(self.low_efficiency <= self.moderate_efficiency
            && self.moderate_efficiency <= self.high_efficiency)
        {
            return Err(ConfigError::Invalid {
                field: "efficiency bands",
                reason: format!(
                    "expected low <= moderate <= high, got {} / {} / {}",
                    self.low_efficiency, self.moderate_efficiency, self.high_efficiency
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.decrease_ratio) {
            return Err(ConfigError::Invalid {
                field: "decrease_ratio",
                reason: format!("{} not in [0, 1]", self.decrease_ratio),
            });
        }
        Ok(())
    }
}

/// Timing for the stall/timeout detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallConfig {
    /// How often active tasks are inspected.
    pub tick: Duration,
    /// Longest allowed gap between two data events.
    pub stall_window: Duration,
    /// Wall-clock budget for files at or below the large-file threshold.
    pub small_file_timeout: Duration,
    /// Wall-clock budget for files above the large-file threshold.
    pub large_file_timeout: Duration,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            stall_window: Duration::from_secs(10),
            small_file_timeout: Duration::from_secs(15),
            large_file_timeout: Duration::from_secs(60),
        }
    }
}

/// Complete configuration of a [`DownloadManager`](super::DownloadManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrency controller tuning.
    pub controller: ControllerConfig,
    /// Stall detector timing.
    pub stall: StallConfig,
    /// Retry budget and backoff.
    pub retry: RetryPolicy,
    /// Target bytes per chunk.
    pub chunk_size: u64,
    /// Files larger than this use chunked transfers.
    pub large_file_threshold: u64,
    /// Upper bound on chunks per file.
    pub max_threads_per_file: usize,
    /// Timeout for a single chunk request.
    pub chunk_timeout: Duration,
    /// Root for per-task chunk directories; removed on stop.
    pub temp_dir: PathBuf,
    /// Continue partial single-stream files instead of restarting them.
    pub resume_partial: bool,
    /// Minimum gap between two progress events.
    pub progress_interval: Duration,
    /// Delay before re-running admission after a completion.
    pub completion_defer: Duration,
    /// Delay before re-running admission after a failure.
    pub failure_defer: Duration,
    /// Buffered events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            stall: StallConfig::default(),
            retry: RetryPolicy::default(),
            chunk_size: 8 * MIB,
            large_file_threshold: 5 * MIB,
            max_threads_per_file: 8,
            chunk_timeout: Duration::from_secs(30),
            temp_dir: std::env::temp_dir().join("assetfetch-chunks"),
            resume_partial: true,
            progress_interval: Duration::from_millis(500),
            completion_defer: Duration::from_millis(50),
            failure_defer: Duration::from_millis(100),
            event_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Checks every nested section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        non_zero_duration("stall.tick", self.stall.tick)?;
        non_zero_duration("stall.stall_window", self.stall.stall_window)?;
        non_zero_duration("stall.small_file_timeout", self.stall.small_file_timeout)?;
        non_zero_duration("stall.large_file_timeout", self.stall.large_file_timeout)?;
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero {
                field: "chunk_size",
            });
        }
        non_zero("max_threads_per_file", self.max_threads_per_file)?;
        non_zero_duration("chunk_timeout", self.chunk_timeout)?;
        non_zero_duration("progress_interval", self.progress_interval)?;
        non_zero("event_capacity", self.event_capacity)?;
        Ok(())
    }
}

fn non_zero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(ManagerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_defaults_match_documented_tuning() {
        let config = ManagerConfig::default();
        assert_eq!(config.chunk_size, 8 * MIB);
        assert_eq!(config.large_file_threshold, 5 * MIB);
        assert_eq!(config.max_threads_per_file, 8);
        assert_eq!(config.controller.min_concurrency, 4);
        assert_eq!(config.controller.max_concurrency, 48);
        assert_eq!(config.controller.initial_concurrency, 12);
        assert_eq!(config.stall.stall_window, Duration::from_secs(10));
    }

    #[test]
    fn test_min_greater_than_max_is_rejected() {
        let config = ControllerConfig {
            min_concurrency: 10,
            max_concurrency: 4,
            initial_concurrency: 5,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBounds { min: 10, max: 4 })
        );
    }

    #[test]
    fn test_zero_min_is_rejected() {
        let config = ControllerConfig {
            min_concurrency: 0,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn test_initial_outside_bounds_is_rejected() {
        let config = ControllerConfig {
            initial_concurrency: 100,
            ..ControllerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InitialOutOfRange {
                initial: 100,
                min: 4,
                max: 48
            })
        );
    }

    #[test]
    fn test_inverted_efficiency_bands_are_rejected() {
        let config = ControllerConfig {
            low_efficiency: 0.9,
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "efficiency bands", .. })
        ));
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let config = ManagerConfig {
            chunk_size: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "chunk_size"
            })
        );
    }

    #[test]
    fn test_fixed_controller() {
        let fixed = ControllerConfig::fixed(3);
        assert_eq!(fixed.min_concurrency, 3);
        assert_eq!(fixed.max_concurrency, 3);
        assert_eq!(fixed.validate(), Ok(()));
    }
}
