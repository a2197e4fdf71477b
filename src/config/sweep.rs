//! Sweep configuration, validation and delay planning.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the number of points a single pass may generate.
pub const MAX_POINTS_PER_PASS: usize = 1_000_000;

/// Upper bound on the number of points a whole run may plan, across passes.
pub const MAX_POINTS_PER_RUN: usize = 10_000_000;

/// Relative tolerance when deciding whether `stop` is reached by the last step.
const STEP_EPSILON: f64 = 1e-9;

/// How the samples of a point are reduced to its aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Arithmetic mean.
    Mean,
    /// Median; the mean of the middle pair for even counts.
    Median,
}

impl Aggregation {
    /// Reduce `values`. Returns `None` for an empty slice.
    pub fn reduce(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregation::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            Aggregation::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
        }
    }
}

/// Delay sweep definition.
///
/// Either a linear sweep (`start`, `stop`, `step`) or an explicit delay list.
/// When `explicit_delays` is present it wins and the linear fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First delay of a linear sweep.
    #[serde(default)]
    pub start: f64,
    /// Last delay of a linear sweep, included when a step lands on it.
    #[serde(default)]
    pub stop: f64,
    /// Signed increment of a linear sweep.
    #[serde(default)]
    pub step: f64,
    /// Delays to visit in order, replacing the linear sweep.
    #[serde(default)]
    pub explicit_delays: Option<Vec<f64>>,
    /// Dwell after each delay change before acquiring.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Readings collected at every point.
    pub samples_per_point: usize,
    /// Failed sample or delay commands tolerated per point.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Number of passes over the delay list.
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Reduction applied to each point's readings.
    pub aggregation: Aggregation,
    /// Bound on a single `acquire_one` or `set_delay` call.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Bound on collecting every sample of one point.
    #[serde(with = "humantime_serde")]
    pub point_timeout: Duration,
    /// Whole-point retries the coordinator attempts after a point errors.
    #[serde(default)]
    pub point_retries: u32,
    /// STM bias held while the sweep runs; the previous bias is restored after.
    #[serde(default)]
    pub probe_bias: Option<f64>,
}

fn default_retry_budget() -> u32 {
    1
}

fn default_repeat_count() -> u32 {
    1
}

/// One scheduled point of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannedPoint {
    /// Position in the run, counting across passes.
    pub index: usize,
    /// Delay to command.
    pub delay: f64,
    /// Pass the point belongs to, from 0.
    pub repeat: u32,
}

impl SweepConfig {
    /// Linear sweep from `start` to `stop` (inclusive when reached exactly).
    pub fn linear(start: f64, stop: f64, step: f64) -> Self {
        Self {
            start,
            stop,
            step,
            explicit_delays: None,
            settle_time: Duration::ZERO,
            samples_per_point: 1,
            retry_budget: default_retry_budget(),
            repeat_count: default_repeat_count(),
            aggregation: Aggregation::Mean,
            acquire_timeout: Duration::from_secs(1),
            point_timeout: Duration::from_secs(30),
            point_retries: 0,
            probe_bias: None,
        }
    }

    /// Sweep over an explicit delay list, in list order.
    pub fn from_delays(delays: Vec<f64>) -> Self {
        Self {
            explicit_delays: Some(delays),
            ..Self::linear(0.0, 0.0, 0.0)
        }
    }

    /// Set the dwell after each delay change.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Set the readings collected per point.
    pub fn with_samples_per_point(mut self, samples: usize) -> Self {
        self.samples_per_point = samples;
        self
    }

    /// Set the failures tolerated per point.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Set the number of passes over the delay list.
    pub fn with_repeat_count(mut self, repeats: u32) -> Self {
        self.repeat_count = repeats;
        self
    }

    /// Set the per-point reduction.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Set the per-call and per-point timeouts.
    pub fn with_timeouts(mut self, acquire: Duration, point: Duration) -> Self {
        self.acquire_timeout = acquire;
        self.point_timeout = point;
        self
    }

    /// Set the whole-point retries after a point errors.
    pub fn with_point_retries(mut self, retries: u32) -> Self {
        self.point_retries = retries;
        self
    }

    /// Hold the STM at `bias` for the duration of the run.
    pub fn with_probe_bias(mut self, bias: f64) -> Self {
        self.probe_bias = Some(bias);
        self
    }

    /// Validate the sweep.
    ///
    /// Pure: the same configuration always yields the same outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::InvalidConfig`] when:
    /// - `samples_per_point` or `repeat_count` is zero
    /// - a timeout is zero
    /// - a numeric field is NaN or infinite
    /// - the explicit delay list is empty
    /// - `step` is zero while `start != stop`
    /// - the sign of `step` does not lead from `start` towards `stop`
    /// - the sweep would exceed [`MAX_POINTS_PER_PASS`]
    /// - all passes together would exceed [`MAX_POINTS_PER_RUN`]
    pub fn validate(&self) -> AppResult<()> {
        if self.samples_per_point < 1 {
            return Err(invalid("samples_per_point must be >= 1"));
        }
        if self.repeat_count < 1 {
            return Err(invalid("repeat_count must be >= 1"));
        }
        if self.acquire_timeout.is_zero() || self.point_timeout.is_zero() {
            return Err(invalid("acquire_timeout and point_timeout must be non-zero"));
        }
        if let Some(bias) = self.probe_bias {
            if !bias.is_finite() {
                return Err(invalid(format!("probe_bias {} is not finite", bias)));
            }
        }

        match &self.explicit_delays {
            Some(delays) => {
                if delays.is_empty() {
                    return Err(invalid("explicit_delays must not be empty"));
                }
                if delays.len() > MAX_POINTS_PER_PASS {
                    return Err(invalid(format!(
                        "explicit_delays holds {} points, limit is {}",
                        delays.len(),
                        MAX_POINTS_PER_PASS
                    )));
                }
                if let Some(bad) = delays.iter().find(|d| !d.is_finite()) {
                    return Err(invalid(format!("explicit delay {} is not finite", bad)));
                }
            }
            None => {
                for (name, value) in [("start", self.start), ("stop", self.stop), ("step", self.step)] {
                    if !value.is_finite() {
                        return Err(invalid(format!("{} = {} is not finite", name, value)));
                    }
                }
                if self.start != self.stop {
                    if self.step == 0.0 {
                        return Err(invalid("step must be non-zero when start != stop"));
                    }
                    if (self.stop - self.start).signum() != self.step.signum() {
                        return Err(invalid(format!(
                            "step {} does not lead from start {} to stop {}",
                            self.step, self.start, self.stop
                        )));
                    }
                    let span = (self.stop - self.start) / self.step;
                    if span >= MAX_POINTS_PER_PASS as f64 {
                        return Err(invalid(format!(
                            "sweep would produce more than {} points",
                            MAX_POINTS_PER_PASS
                        )));
                    }
                }
            }
        }

        let total = usize::try_from(self.repeat_count)
            .ok()
            .and_then(|repeats| self.points_per_pass().checked_mul(repeats))
            .filter(|&total| total <= MAX_POINTS_PER_RUN);
        if total.is_none() {
            return Err(invalid(format!(
                "{} passes of {} points exceed the run limit of {}",
                self.repeat_count,
                self.points_per_pass(),
                MAX_POINTS_PER_RUN
            )));
        }
        Ok(())
    }

    /// Number of points in one pass. Call after the per-pass checks hold.
    fn points_per_pass(&self) -> usize {
        match &self.explicit_delays {
            Some(delays) => delays.len(),
            None if self.start == self.stop => 1,
            None => self.last_step() + 1,
        }
    }

    fn last_step(&self) -> usize {
        ((self.stop - self.start) / self.step + STEP_EPSILON).floor() as usize
    }

    /// Delays of a single pass, in sweep order. Call after [`Self::validate`].
    pub fn delays(&self) -> Vec<f64> {
        if let Some(delays) = &self.explicit_delays {
            return delays.clone();
        }
        if self.start == self.stop {
            return vec![self.start];
        }
        (0..=self.last_step())
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }

    /// Every point of the run across all passes, indexed `0..N`.
    pub fn plan(&self) -> Vec<PlannedPoint> {
        let delays = self.delays();
        (0..self.repeat_count)
            .flat_map(|repeat| delays.iter().map(move |&delay| (repeat, delay)))
            .enumerate()
            .map(|(index, (repeat, delay))| PlannedPoint {
                index,
                delay,
                repeat,
            })
            .collect()
    }
}

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_sweep_includes_stop() {
        let config = SweepConfig::linear(0.0, 10.0, 5.0);
        config.validate().unwrap();
        assert_eq!(config.delays(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn descending_sweep_with_negative_step() {
        let config = SweepConfig::linear(1.0, -1.0, -0.5);
        config.validate().unwrap();
        assert_eq!(config.delays(), vec![1.0, 0.5, 0.0, -0.5, -1.0]);
    }

    #[test]
    fn fractional_steps_do_not_overshoot() {
        let config = SweepConfig::linear(0.0, 1.0, 0.1);
        let delays = config.delays();
        assert_eq!(delays.len(), 11);
        assert!((delays[10] - 1.0).abs() < 1e-12);

        let uneven = SweepConfig::linear(0.0, 1.0, 0.3);
        let delays = uneven.delays();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= 1.0));
    }

    #[test]
    fn single_point_when_start_equals_stop() {
        let config = SweepConfig::linear(3.0, 3.0, 0.0);
        config.validate().unwrap();
        assert_eq!(config.delays(), vec![3.0]);
    }

    #[test]
    fn rejects_step_sign_mismatch() {
        let err = SweepConfig::linear(0.0, 10.0, -1.0).validate().unwrap_err();
        assert!(matches!(err, DaqError::InvalidConfig(_)));
        assert!(SweepConfig::linear(0.0, 10.0, 0.0).validate().is_err());
    }

    #[test]
    fn rejects_zero_samples_per_point() {
        let config = SweepConfig::linear(0.0, 1.0, 1.0).with_samples_per_point(0);
        assert!(matches!(
            config.validate(),
            Err(DaqError::InvalidConfig(msg)) if msg.contains("samples_per_point")
        ));
    }

    #[test]
    fn rejects_non_finite_and_empty_lists() {
        assert!(SweepConfig::from_delays(vec![]).validate().is_err());
        assert!(SweepConfig::from_delays(vec![1.0, f64::NAN]).validate().is_err());
        assert!(SweepConfig::linear(0.0, f64::INFINITY, 1.0).validate().is_err());
    }

    #[test]
    fn validation_is_idempotent() {
        let configs = [
            SweepConfig::linear(0.0, 10.0, 5.0),
            SweepConfig::linear(0.0, 10.0, -5.0),
            SweepConfig::from_delays(vec![2.0, 2.0, 1.0]),
            SweepConfig::linear(0.0, 1.0, 1.0).with_repeat_count(0),
        ];
        for config in &configs {
            let first = config.validate().is_ok();
            for _ in 0..3 {
                assert_eq!(config.validate().is_ok(), first);
            }
        }
    }

    #[test]
    fn plan_indexes_across_repeats_and_keeps_duplicates() {
        let config = SweepConfig::from_delays(vec![2.0, 2.0, 1.0]).with_repeat_count(2);
        let plan = config.plan();

        assert_eq!(
            plan.iter().map(|p| p.index).collect::<Vec<_>>(),
            (0..6).collect::<Vec<_>>()
        );
        assert_eq!(
            plan.iter().map(|p| p.delay).collect::<Vec<_>>(),
            vec![2.0, 2.0, 1.0, 2.0, 2.0, 1.0]
        );
        assert_eq!(plan[3].repeat, 1);
    }

    #[test]
    fn aggregation_policies() {
        assert_eq!(Aggregation::Mean.reduce(&[1.0, 2.0, 6.0]), Some(3.0));
        assert_eq!(Aggregation::Median.reduce(&[5.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(Aggregation::Median.reduce(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(Aggregation::Mean.reduce(&[]), None);
    }

    #[test]
    fn repeated_passes_count_towards_run_limit() {
        let huge = SweepConfig::linear(0.0, 999_998.0, 1.0).with_repeat_count(u32::MAX);
        assert!(matches!(huge.validate(), Err(DaqError::InvalidConfig(_))));

        let at_limit = SweepConfig::linear(0.0, 999_999.0, 1.0).with_repeat_count(10);
        at_limit.validate().unwrap();
        let over = SweepConfig::from_delays(vec![0.0; 1000]).with_repeat_count(10_001);
        assert!(matches!(over.validate(), Err(DaqError::InvalidConfig(_))));
    }

    #[test]
    fn deserializes_with_humantime_durations() {
        let config: SweepConfig = toml::from_str(
            r#"
            start = 0.0
            stop = 10.0
            step = 5.0
            settle_time = "20ms"
            samples_per_point = 2
            aggregation = "median"
            acquire_timeout = "500ms"
            point_timeout = "5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.settle_time, Duration::from_millis(20));
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.repeat_count, 1);
        assert_eq!(config.aggregation, Aggregation::Median);
        config.validate().unwrap();
    }
}
