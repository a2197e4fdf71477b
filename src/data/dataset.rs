//! Scan points and the run dataset.
//!
//! A [`Dataset`] is created when a run starts, grows one [`ScanPoint`] at a
//! time, and is sealed with the terminal run state. After sealing the
//! coordinator hands it out as `Arc<Dataset>`; nothing can modify it from
//! then on.

use super::buffer::Sample;
use crate::config::SweepConfig;
use crate::coordinator::RunState;
use crate::error::{ErrorKind, InstrumentFault};
use crate::instrument::{InstrumentId, Position3D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a point did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Instrument that failed.
    pub instrument: Option<InstrumentId>,
    /// Samples collected before the point failed.
    pub partial_count: usize,
    /// Last raw payload received, for malformed responses.
    pub last_raw: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl PointError {
    /// Record `fault` as the reason a point stopped after `partial_count`
    /// samples.
    pub fn from_fault(fault: &InstrumentFault, partial_count: usize) -> Self {
        Self {
            kind: fault.kind(),
            instrument: Some(fault.instrument().clone()),
            partial_count,
            last_raw: fault.raw_response().map(str::to_string),
            message: fault.to_string(),
        }
    }
}

/// Completeness flag of a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointStatus {
    /// Every expected sample was collected.
    Complete,
    /// The point failed; partial samples are kept.
    Error(PointError),
}

/// One delay of the sweep and what was measured there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Position in the run, counting across passes.
    pub index: usize,
    /// Delay the samples were taken at.
    pub delay: f64,
    /// Pass of the sweep this point belongs to.
    pub repeat: u32,
    /// Samples in acquisition order.
    pub samples: Vec<Sample>,
    /// Reduced value of a complete point.
    pub aggregate: Option<f64>,
    /// Complete or error.
    pub status: PointStatus,
}

impl ScanPoint {
    /// Whether the point holds all of its samples.
    pub fn is_complete(&self) -> bool {
        matches!(self.status, PointStatus::Complete)
    }

    /// Sample values in acquisition order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.value)
    }

    /// Failure details of an error point.
    pub fn error(&self) -> Option<&PointError> {
        match &self.status {
            PointStatus::Error(err) => Some(err),
            PointStatus::Complete => None,
        }
    }
}

/// Identification and context of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// When the dataset was sealed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Sweep the run executed.
    pub config: SweepConfig,
    /// Instruments leased by the run.
    pub instruments: Vec<InstrumentId>,
    /// Tip position when the run started, if a feedback controller took part.
    pub tip_position: Option<Position3D>,
}

/// Ordered points of one run, sealed with its terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    metadata: RunMetadata,
    points: Vec<ScanPoint>,
    partial: bool,
    terminal_state: Option<RunState>,
    failure: Option<String>,
}

impl Dataset {
    pub(crate) fn new(run_id: Uuid, config: SweepConfig, instruments: Vec<InstrumentId>) -> Self {
        Self {
            metadata: RunMetadata {
                run_id,
                started_at: Utc::now(),
                finished_at: None,
                config,
                instruments,
                tip_position: None,
            },
            points: Vec::new(),
            partial: false,
            terminal_state: None,
            failure: None,
        }
    }

    pub(crate) fn set_tip_position(&mut self, position: Position3D) {
        self.metadata.tip_position = Some(position);
    }

    /// Append the next point. Indices must arrive strictly increasing.
    pub(crate) fn push(&mut self, point: ScanPoint) {
        debug_assert!(self.terminal_state.is_none(), "dataset already sealed");
        debug_assert!(
            self.points.last().map_or(true, |last| last.index < point.index),
            "point index {} out of order",
            point.index
        );
        self.points.push(point);
    }

    /// Mark the dataset final.
    pub(crate) fn seal(&mut self, state: RunState, partial: bool, failure: Option<String>) {
        self.metadata.finished_at = Some(Utc::now());
        self.terminal_state = Some(state);
        self.partial = partial;
        self.failure = failure;
    }

    /// Run identification and context.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Points in index order, complete and error alike.
    pub fn points(&self) -> &[ScanPoint] {
        &self.points
    }

    /// Number of recorded points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no point was recorded.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True when the run ended before every planned point completed.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// State the run ended in, once sealed.
    pub fn terminal_state(&self) -> Option<RunState> {
        self.terminal_state
    }

    /// Reason a failed run stopped.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Points that hold all of their samples.
    pub fn complete_points(&self) -> impl Iterator<Item = &ScanPoint> {
        self.points.iter().filter(|p| p.is_complete())
    }

    /// `(delay, aggregate)` pairs of the complete points, for plotting.
    pub fn series(&self) -> Vec<(f64, f64)> {
        self.complete_points()
            .filter_map(|p| p.aggregate.map(|a| (p.delay, a)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(index: usize, delay: f64, aggregate: Option<f64>, status: PointStatus) -> ScanPoint {
        ScanPoint {
            index,
            delay,
            repeat: 0,
            samples: Vec::new(),
            aggregate,
            status,
        }
    }

    #[test]
    fn series_skips_error_points() {
        let mut dataset = Dataset::new(Uuid::nil(), SweepConfig::linear(0.0, 2.0, 1.0), vec![]);
        dataset.push(point(0, 0.0, Some(1.0), PointStatus::Complete));
        let fault = InstrumentFault::malformed(InstrumentId::new("lockin"), "??");
        dataset.push(point(
            1,
            1.0,
            None,
            PointStatus::Error(PointError::from_fault(&fault, 1)),
        ));
        dataset.seal(RunState::Failed, true, Some("lockin failed".into()));

        assert_eq!(dataset.series(), vec![(0.0, 1.0)]);
        assert!(dataset.is_partial());
        assert_eq!(dataset.terminal_state(), Some(RunState::Failed));
        let err = dataset.points()[1].error().unwrap();
        assert_eq!(err.partial_count, 1);
        assert_eq!(err.last_raw.as_deref(), Some("??"));
        assert!(dataset.metadata().finished_at.is_some());
    }

    #[test]
    fn serializes_status_tag() {
        let json = serde_json::to_value(point(0, 0.5, Some(2.0), PointStatus::Complete)).unwrap();
        assert_eq!(json["status"]["status"], "complete");
        assert_eq!(json["delay"], 0.5);
    }
}
