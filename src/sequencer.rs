//! Point-by-point sweep execution.
//!
//! The [`ScanSequencer`] walks the planned delays in order. For each point it
//! commands the delay, waits for the settle time, then collects
//! `samples_per_point` readings into the [`AcquisitionBuffer`]:
//!
//! ```text
//! Idle -> PointSetup -> Settling -> Acquiring -> PointComplete -> PointSetup ...
//!                                        |                         \-> SweepComplete
//!                                        v
//!                                      Error
//! ```
//!
//! Only one instrument operation is outstanding at a time, so the delay never
//! changes while an acquisition for the current point is in flight. Abort is
//! honoured before a point starts and during the settle wait; once
//! acquisition has begun the point runs to completion or error.

use crate::config::{PlannedPoint, SweepConfig};
use crate::coordinator::ControlSignal;
use crate::data::{AcquisitionBuffer, PointError, PointStatus, ScanPoint};
use crate::error::{AppResult, DaqError, InstrumentFault};
use crate::instrument::capabilities::FaultResult;
use crate::instrument::{InstrumentId, InstrumentSet};
use crate::observer::{EventBus, RunEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Phase of the point currently being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    /// Between points.
    Idle,
    /// Commanding the delay.
    PointSetup,
    /// Waiting out the settle time.
    Settling,
    /// Collecting samples.
    Acquiring,
    /// The point has all of its samples.
    PointComplete,
    /// No points left.
    SweepComplete,
    /// The point ran out of retries.
    Error,
}

/// Result of one [`ScanSequencer::advance`] call.
#[derive(Debug)]
pub enum Advance {
    /// The point collected all of its samples.
    Completed(ScanPoint),
    /// The point ran out of retries. The sequencer stays in
    /// [`SequencerState::Error`] until [`ScanSequencer::retry_point`] or
    /// [`ScanSequencer::skip_point`] is called.
    Failed {
        /// The point as recorded, with its partial samples.
        point: ScanPoint,
        /// Fault that exhausted the budget.
        fault: InstrumentFault,
    },
    /// Abort was observed before acquisition began. The point was not taken.
    Halted,
    /// Every planned point has been taken.
    SweepComplete,
}

/// Failures a single point may absorb before it escalates.
#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    fn new(budget: u32) -> Self {
        Self { remaining: budget }
    }

    fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Steps through the planned points of one run.
///
/// The sequencer owns the acquisition buffer and publishes a
/// [`RunEvent::PointPhase`] for every phase it enters. It never decides
/// whether a failed point is retried; that is up to the caller.
pub struct ScanSequencer {
    run_id: Uuid,
    config: SweepConfig,
    plan: Vec<PlannedPoint>,
    cursor: usize,
    state: SequencerState,
    reopen: bool,
    instruments: InstrumentSet,
    buffer: AcquisitionBuffer,
    events: EventBus,
}

impl ScanSequencer {
    /// The caller is expected to have validated `config`.
    pub fn new(run_id: Uuid, config: SweepConfig, instruments: InstrumentSet, events: EventBus) -> Self {
        let plan = config.plan();
        Self {
            run_id,
            config,
            plan,
            cursor: 0,
            state: SequencerState::Idle,
            reopen: false,
            instruments,
            buffer: AcquisitionBuffer::new(),
            events,
        }
    }

    /// Phase of the current point.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Points planned across all passes.
    pub fn total_points(&self) -> usize {
        self.plan.len()
    }

    /// Points already resolved (complete or skipped).
    pub fn points_done(&self) -> usize {
        self.cursor
    }

    /// Next point to be taken, if any.
    pub fn current_point(&self) -> Option<PlannedPoint> {
        self.plan.get(self.cursor).copied()
    }

    /// Run the next point to a resolution.
    pub async fn advance(
        &mut self,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> AppResult<Advance> {
        if self.state == SequencerState::Error {
            let index = self.current_point().map_or(self.cursor, |p| p.index);
            return Err(DaqError::PointUnresolved(index));
        }
        let Some(planned) = self.current_point() else {
            self.state = SequencerState::SweepComplete;
            return Ok(Advance::SweepComplete);
        };
        if abort_requested(control) {
            return Ok(Advance::Halted);
        }

        if self.reopen {
            self.buffer.reset(planned.index)?;
            self.reopen = false;
        } else {
            self.buffer.open(planned.index, self.config.samples_per_point)?;
        }

        let mut budget = RetryBudget::new(self.config.retry_budget);
        let mut last_raw: Option<String> = None;

        self.enter(SequencerState::PointSetup, planned.index);
        let delay = self.instruments.delay().clone();
        loop {
            let limit = self.config.acquire_timeout;
            match bounded(limit, delay.identity(), delay.set_delay(planned.delay)).await {
                Ok(()) => break,
                Err(fault) => {
                    note_raw(&fault, &mut last_raw);
                    if !budget.try_consume() {
                        return Ok(self.fail(planned, fault, last_raw));
                    }
                    warn!(index = planned.index, delay = planned.delay, %fault, "set_delay failed, retrying");
                }
            }
        }

        self.enter(SequencerState::Settling, planned.index);
        if !self.settle(control).await {
            debug!(index = planned.index, "abort during settle");
            self.state = SequencerState::Idle;
            return Ok(Advance::Halted);
        }

        self.enter(SequencerState::Acquiring, planned.index);
        let acquisition = self.instruments.acquisition().clone();
        let deadline = Instant::now() + self.config.point_timeout;
        while !self.buffer.is_complete(planned.index) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let fault = InstrumentFault::Timeout {
                    instrument: acquisition.identity(),
                    timeout_ms: millis(self.config.point_timeout),
                };
                return Ok(self.fail(planned, fault, last_raw));
            }

            let call_timeout = self.config.acquire_timeout.min(remaining);
            match bounded(call_timeout, acquisition.identity(), acquisition.acquire_one()).await {
                Ok(value) => {
                    let sample = self.buffer.stamp(planned.index, value);
                    self.buffer.push(sample)?;
                }
                Err(fault) => {
                    note_raw(&fault, &mut last_raw);
                    if !budget.try_consume() {
                        return Ok(self.fail(planned, fault, last_raw));
                    }
                    warn!(
                        index = planned.index,
                        collected = self.buffer.count(planned.index),
                        %fault,
                        "acquisition failed, retrying"
                    );
                }
            }
        }

        let samples = self.buffer.take(planned.index)?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let point = ScanPoint {
            index: planned.index,
            delay: planned.delay,
            repeat: planned.repeat,
            aggregate: self.config.aggregation.reduce(&values),
            samples,
            status: PointStatus::Complete,
        };
        self.enter(SequencerState::PointComplete, planned.index);
        self.cursor += 1;
        debug!(index = point.index, aggregate = ?point.aggregate, "point complete");
        Ok(Advance::Completed(point))
    }

    /// Clear the failed point's samples so the next `advance` re-runs it.
    pub fn retry_point(&mut self) -> AppResult<()> {
        let planned = self.failed_point()?;
        self.reopen = true;
        self.state = SequencerState::Idle;
        debug!(index = planned.index, "point queued for retry");
        Ok(())
    }

    /// Give up on the failed point and move on to the next one.
    pub fn skip_point(&mut self) -> AppResult<()> {
        let planned = self.failed_point()?;
        self.buffer.take(planned.index)?;
        self.cursor += 1;
        self.state = SequencerState::Idle;
        Ok(())
    }

    fn failed_point(&self) -> AppResult<PlannedPoint> {
        match (self.state, self.current_point()) {
            (SequencerState::Error, Some(planned)) => Ok(planned),
            _ => Err(DaqError::RunNotActive),
        }
    }

    fn enter(&mut self, state: SequencerState, index: usize) {
        self.state = state;
        self.events.publish(RunEvent::PointPhase {
            run_id: self.run_id,
            index,
            phase: state,
        });
    }

    fn fail(&mut self, planned: PlannedPoint, fault: InstrumentFault, last_raw: Option<String>) -> Advance {
        let samples = self.buffer.snapshot(planned.index);
        let mut error = PointError::from_fault(&fault, samples.len());
        if error.last_raw.is_none() {
            error.last_raw = last_raw;
        }
        warn!(
            index = planned.index,
            delay = planned.delay,
            partial = samples.len(),
            kind = ?error.kind,
            "point failed"
        );
        self.enter(SequencerState::Error, planned.index);
        Advance::Failed {
            point: ScanPoint {
                index: planned.index,
                delay: planned.delay,
                repeat: planned.repeat,
                samples,
                aggregate: None,
                status: PointStatus::Error(error),
            },
            fault,
        }
    }

    /// Wait out the settle time. Returns `false` if abort arrived first.
    async fn settle(&self, control: &mut watch::Receiver<ControlSignal>) -> bool {
        let settle_time = self.config.settle_time;
        if settle_time.is_zero() {
            return !abort_requested(control);
        }
        tokio::select! {
            _ = tokio::time::sleep(settle_time) => !abort_requested(control),
            _ = wait_for_abort(control) => false,
        }
    }
}

/// Run an instrument call, turning an elapsed `limit` into a timeout fault.
pub(crate) async fn bounded<T, F>(limit: Duration, instrument: InstrumentId, call: F) -> FaultResult<T>
where
    F: Future<Output = FaultResult<T>>,
{
    timeout(limit, call).await.unwrap_or_else(|_| {
        Err(InstrumentFault::Timeout {
            instrument,
            timeout_ms: millis(limit),
        })
    })
}

fn abort_requested(control: &watch::Receiver<ControlSignal>) -> bool {
    *control.borrow() == ControlSignal::Abort
}

async fn wait_for_abort(control: &mut watch::Receiver<ControlSignal>) {
    loop {
        if *control.borrow_and_update() == ControlSignal::Abort {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn note_raw(fault: &InstrumentFault, last_raw: &mut Option<String>) {
    if let Some(raw) = fault.raw_response() {
        *last_raw = Some(raw.to_string());
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
