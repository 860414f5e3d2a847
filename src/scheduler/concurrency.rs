//! Adaptive concurrency controller.
//!
//! The controller is plain state plus a decision function so it can be driven
//! with synthetic samples and explicit instants. The manager owns one behind a
//! mutex, feeds it a speed sample every interval and publishes the resulting
//! ceiling through an atomic that the admission pass reads.
//!
//! Rules, first match wins:
//!
//! | # | condition | change | reason |
//! |---|-----------|--------|--------|
//! | 1 | efficiency > high, recent trending up, below max | + step × multiplier | `high-efficiency` |
//! | 2 | efficiency > moderate, below `max × ratio` | + step | `moderate-efficiency` |
//! | 3 | efficiency < low, recent trending down, above min | − max(step, ceiling × ratio) | `low-efficiency` |
//! | 4 | nothing active but work pending | + step | `underutilized` |
//!
//! `efficiency = average speed / (ceiling × per-connection throughput)`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::config::ControllerConfig;

/// Why the ceiling changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjustmentReason {
    /// Rule 1.
    HighEfficiency,
    /// Rule 2.
    ModerateEfficiency,
    /// Rule 3.
    LowEfficiency,
    /// Rule 4.
    Underutilized,
    /// Explicit caller override.
    Manual,
}

impl AdjustmentReason {
    /// Stable kebab-case tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighEfficiency => "high-efficiency",
            Self::ModerateEfficiency => "moderate-efficiency",
            Self::LowEfficiency => "low-efficiency",
            Self::Underutilized => "underutilized",
            Self::Manual => "manual",
        }
    }
}

/// One recorded ceiling change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentRecord {
    /// Time since the controller was created.
    pub elapsed: Duration,
    /// Ceiling before.
    pub from: usize,
    /// Ceiling after.
    pub to: usize,
    /// Rule that fired.
    pub reason: AdjustmentReason,
    /// Efficiency at decision time.
    pub efficiency: f64,
    /// Average speed at decision time, bytes per second.
    pub speed_bps: f64,
}

/// Manual ceiling outside the configured bounds.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("concurrency {requested} outside [{min}, {max}]")]
pub struct ConcurrencyOutOfRange {
    /// Requested ceiling.
    pub requested: usize,
    /// Configured floor.
    pub min: usize,
    /// Configured ceiling.
    pub max: usize,
}

/// Ceiling, bounds and rolling speed window.
#[derive(Debug, Clone)]
pub struct ConcurrencyState {
    /// Current active-slot ceiling.
    pub ceiling: usize,
    /// Floor.
    pub min: usize,
    /// Ceiling bound.
    pub max: usize,
    /// Recent aggregate speed samples, oldest first.
    pub history: VecDeque<f64>,
    /// When the ceiling last changed.
    pub last_adjustment: Option<Instant>,
    /// Minimum gap between adjustments.
    pub cooldown: Duration,
}

/// Decides ceiling changes from throughput samples.
#[derive(Debug)]
pub struct AdaptiveController {
    config: ControllerConfig,
    state: ConcurrencyState,
    adjustments: VecDeque<AdjustmentRecord>,
    origin: Instant,
}

impl AdaptiveController {
    /// Creates a controller at `config.initial_concurrency`.
    ///
    /// The config is expected to have passed [`ControllerConfig::validate`].
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let state = ConcurrencyState {
            ceiling: config.initial_concurrency,
            min: config.min_concurrency,
            max: config.max_concurrency,
            history: VecDeque::with_capacity(config.history_size),
            last_adjustment: None,
            cooldown: config.cooldown,
        };
        Self {
            config,
            state,
            adjustments: VecDeque::new(),
            origin: Instant::now(),
        }
    }

    /// Current ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.state.ceiling
    }

    /// Read-only view of the state.
    #[must_use]
    pub fn state(&self) -> &ConcurrencyState {
        &self.state
    }

    /// Recorded adjustments, oldest first.
    #[must_use]
    pub fn adjustments(&self) -> Vec<AdjustmentRecord> {
        self.adjustments.iter().cloned().collect()
    }

    /// Appends a speed sample, dropping the oldest beyond the window.
    pub fn record_sample(&mut self, speed_bps: f64) {
        if self.state.history.len() == self.config.history_size {
            self.state.history.pop_front();
        }
        self.state.history.push_back(speed_bps.max(0.0));
    }

    /// Mean of the window.
    #[must_use]
    pub fn average_speed(&self) -> f64 {
        mean(self.state.history.iter().copied())
    }

    /// Observed over theoretical throughput for the current ceiling.
    #[must_use]
    pub fn efficiency(&self) -> f64 {
        self.efficiency_of(self.average_speed())
    }

    #[allow(clippy::cast_precision_loss)]
    fn efficiency_of(&self, speed: f64) -> f64 {
        let theoretical = self.state.ceiling as f64 * self.config.per_connection_bps;
        if theoretical > 0.0 {
            speed / theoretical
        } else {
            0.0
        }
    }

    /// Runs the decision rules and applies at most one change.
    ///
    /// Returns `None` with too few samples, inside the cooldown, or when no
    /// rule fires.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn evaluate(
        &mut self,
        now: Instant,
        active: usize,
        queued: usize,
    ) -> Option<AdjustmentRecord> {
        let history = &self.state.history;
        if history.len() < self.config.min_samples {
            return None;
        }
        if let Some(last) = self.state.last_adjustment
            && now.saturating_duration_since(last) < self.state.cooldown
        {
            return None;
        }

        let average = self.average_speed();
        let recent_count = self.config.recent_window.min(history.len());
        let recent = mean(history.iter().rev().take(recent_count).copied());
        let efficiency = self.efficiency_of(average);
        let ceiling = self.state.ceiling;
        let (min, max) = (self.state.min, self.state.max);
        let cfg = &self.config;

        let decision = if efficiency > cfg.high_efficiency
            && recent > average * cfg.trend_up_ratio
            && ceiling < max
        {
            Some((
                (ceiling + cfg.step * cfg.aggressive_multiplier).min(max),
                AdjustmentReason::HighEfficiency,
            ))
        } else if efficiency > cfg.moderate_efficiency
            && (ceiling as f64) < max as f64 * cfg.moderate_ceiling_ratio
        {
            Some(((ceiling + cfg.step).min(max), AdjustmentReason::ModerateEfficiency))
        } else if efficiency < cfg.low_efficiency
            && recent < average * cfg.trend_down_ratio
            && ceiling > min
        {
            let proportional = (ceiling as f64 * cfg.decrease_ratio).floor() as usize;
            let decrease = cfg.step.max(proportional);
            Some((
                ceiling.saturating_sub(decrease).max(min),
                AdjustmentReason::LowEfficiency,
            ))
        } else if active == 0 && queued > 0 && ceiling < max {
            Some(((ceiling + cfg.step).min(max), AdjustmentReason::Underutilized))
        } else {
            None
        };

        let (to, reason) = decision?;
        if to == ceiling {
            return None;
        }
        let record = self.apply(now, to, reason, efficiency, average);
        info!(
            from = record.from,
            to = record.to,
            reason = record.reason.as_str(),
            efficiency = format!("{efficiency:.2}"),
            speed_bps = average as u64,
            "concurrency adjusted"
        );
        Some(record)
    }

    /// Sets the ceiling explicitly.
    ///
    /// The change is recorded with [`AdjustmentReason::Manual`] and restarts
    /// the cooldown so the next automatic decision does not undo it at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyOutOfRange`] when `requested` is outside the bounds.
    pub fn set_manual(
        &mut self,
        requested: usize,
        now: Instant,
    ) -> Result<AdjustmentRecord, ConcurrencyOutOfRange> {
        if !(self.state.min..=self.state.max).contains(&requested) {
            return Err(ConcurrencyOutOfRange {
                requested,
                min: self.state.min,
                max: self.state.max,
            });
        }
        let efficiency = self.efficiency();
        let average = self.average_speed();
        debug!(from = self.state.ceiling, to = requested, "manual concurrency");
        Ok(self.apply(now, requested, AdjustmentReason::Manual, efficiency, average))
    }

    /// Returns to the initial ceiling with an empty window.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn apply(
        &mut self,
        now: Instant,
        to: usize,
        reason: AdjustmentReason,
        efficiency: f64,
        speed_bps: f64,
    ) -> AdjustmentRecord {
        let record = AdjustmentRecord {
            elapsed: now.saturating_duration_since(self.origin),
            from: self.state.ceiling,
            to,
            reason,
            efficiency,
            speed_bps,
        };
        self.state.ceiling = to;
        self.state.last_adjustment = Some(now);
        if self.adjustments.len() == self.config.adjustment_history {
            self.adjustments.pop_front();
        }
        self.adjustments.push_back(record.clone());
        record
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: f64 = 1024.0 * 1024.0;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(ControllerConfig::default())
    }

    fn secs(origin: Instant, s: u64) -> Instant {
        origin + Duration::from_secs(s)
    }

    #[test]
    fn test_needs_min_samples_before_adjusting() {
        let mut c = controller();
        let t0 = Instant::now();
        c.record_sample(20.0 * MIB);
        c.record_sample(20.0 * MIB);
        assert!(c.evaluate(t0, 12, 100).is_none());
        assert_eq!(c.ceiling(), 12);
    }

    #[test]
    fn test_flat_then_rising_raises_exactly_once_within_cooldown() {
        let mut c = controller();
        let t0 = Instant::now();
        let flat = 20.0 * MIB;
        let risen = flat * 1.2;
        let samples = [flat, flat, risen, risen, risen];

        let mut changes = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            c.record_sample(*sample);
            if let Some(record) = c.evaluate(secs(t0, i as u64), 12, 200) {
                changes.push(record);
            }
        }
        // sampled again immediately after the last one
        if let Some(record) = c.evaluate(secs(t0, 4), 12, 200) {
            changes.push(record);
        }

        assert_eq!(changes.len(), 1, "changes: {changes:?}");
        let change = &changes[0];
        assert_eq!(change.from, 12);
        assert!(matches!(
            change.reason,
            AdjustmentReason::ModerateEfficiency | AdjustmentReason::HighEfficiency
        ));
        assert!(change.to == 14 || change.to == 16, "to = {}", change.to);
        assert_eq!(c.ceiling(), change.to);
    }

    #[test]
    fn test_cooldown_expiry_allows_next_adjustment() {
        let mut c = controller();
        let t0 = Instant::now();
        for _ in 0..3 {
            c.record_sample(22.0 * MIB);
        }
        assert!(c.evaluate(t0, 12, 10).is_some());
        c.record_sample(26.0 * MIB);
        assert!(c.evaluate(secs(t0, 4), 14, 10).is_none());
        assert!(c.evaluate(secs(t0, 5), 14, 10).is_some());
    }

    #[test]
    fn test_high_efficiency_with_rising_trend_is_aggressive() {
        let mut c = controller();
        let t0 = Instant::now();
        // average well above the model, recent clearly above average
        for sample in [10.0, 10.0, 10.0, 10.0, 40.0, 40.0, 40.0] {
            c.record_sample(sample * MIB);
        }
        let record = c.evaluate(t0, 12, 0).unwrap();
        assert_eq!(record.reason, AdjustmentReason::HighEfficiency);
        assert_eq!(record.to, 16);
    }

    #[test]
    fn test_low_efficiency_with_falling_trend_decreases() {
        let config = ControllerConfig {
            initial_concurrency: 40,
            ..ControllerConfig::default()
        };
        let mut c = AdaptiveController::new(config);
        let t0 = Instant::now();
        for sample in [30.0, 30.0, 30.0, 2.0, 2.0, 2.0] {
            c.record_sample(sample * MIB);
        }
        let record = c.evaluate(t0, 40, 5).unwrap();
        assert_eq!(record.reason, AdjustmentReason::LowEfficiency);
        // max(2, floor(40 * 0.2)) = 8
        assert_eq!(record.to, 32);
    }

    #[test]
    fn test_decrease_never_goes_below_min() {
        let config = ControllerConfig {
            initial_concurrency: 5,
            ..ControllerConfig::default()
        };
        let mut c = AdaptiveController::new(config);
        for sample in [8.0, 8.0, 8.0, 0.1, 0.1, 0.1] {
            c.record_sample(sample * MIB);
        }
        let record = c.evaluate(Instant::now(), 5, 5).unwrap();
        assert_eq!(record.to, 4);
    }

    #[test]
    fn test_underutilized_scheduler_is_nudged_up() {
        let mut c = controller();
        for _ in 0..3 {
            c.record_sample(12.0 * MIB);
        }
        // efficiency 0.5: no band matches, but nothing is running
        let record = c.evaluate(Instant::now(), 0, 50).unwrap();
        assert_eq!(record.reason, AdjustmentReason::Underutilized);
        assert_eq!(record.to, 14);
    }

    #[test]
    fn test_no_rule_no_change() {
        let mut c = controller();
        for _ in 0..3 {
            c.record_sample(12.0 * MIB);
        }
        assert!(c.evaluate(Instant::now(), 12, 50).is_none());
        assert!(c.adjustments().is_empty());
    }

    #[test]
    fn test_ceiling_never_exceeds_max() {
        let config = ControllerConfig {
            max_concurrency: 13,
            ..ControllerConfig::default()
        };
        let mut c = AdaptiveController::new(config);
        for sample in [10.0, 10.0, 10.0, 10.0, 40.0, 40.0, 40.0] {
            c.record_sample(sample * MIB);
        }
        let record = c.evaluate(Instant::now(), 12, 0).unwrap();
        assert_eq!(record.to, 13);
    }

    #[test]
    fn test_manual_override_bounds_and_cooldown() {
        let mut c = controller();
        let t0 = Instant::now();
        assert_eq!(
            c.set_manual(49, t0),
            Err(ConcurrencyOutOfRange {
                requested: 49,
                min: 4,
                max: 48
            })
        );
        let record = c.set_manual(30, t0).unwrap();
        assert_eq!(record.reason, AdjustmentReason::Manual);
        assert_eq!(c.ceiling(), 30);

        for _ in 0..3 {
            c.record_sample(0.0);
        }
        assert!(c.evaluate(secs(t0, 1), 0, 10).is_none());
    }

    #[test]
    fn test_adjustment_history_is_capped() {
        let config = ControllerConfig {
            adjustment_history: 3,
            ..ControllerConfig::default()
        };
        let mut c = AdaptiveController::new(config);
        let t0 = Instant::now();
        for n in 4..10 {
            c.set_manual(n, t0).unwrap();
        }
        let history = c.adjustments();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().to, 9);
    }

    #[test]
    fn test_history_window_drops_oldest() {
        let mut c = controller();
        for i in 0..15 {
            c.record_sample(f64::from(i));
        }
        assert_eq!(c.state().history.len(), 10);
        assert_eq!(c.state().history.front().copied(), Some(5.0));
    }
}
