//! Run lifecycle: validation, instrument ownership, tip safety and the sweep
//! loop.
//!
//! ```text
//! Idle -> Initializing -> Sweeping <-> Paused
//!                            |
//!                            v
//!                       Finalizing -> Completed | Aborted | Failed
//! ```
//!
//! [`RunCoordinator::start`] validates the configuration, resolves instrument
//! roles and leases every instrument before spawning the run task. Control
//! requests reach the task through a `watch` channel and are honoured at
//! point boundaries (pause) or at the sequencer's abort checks. Whatever the
//! exit path, the task switches the pulse output off, restores the STM bias,
//! re-enables feedback, releases the lease and seals the dataset.

use crate::config::SweepConfig;
use crate::data::Dataset;
use crate::error::{AppResult, DaqError, ErrorKind, InstrumentFault};
use crate::instrument::{InstrumentHandle, InstrumentSet};
use crate::observer::{EventBus, RunEvent};
use crate::resource::{ResourceLease, ResourceRegistry};
use crate::sequencer::{bounded, Advance, ScanSequencer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not started.
    Idle,
    /// Freezing the tip and preparing instruments.
    Initializing,
    /// Taking points.
    Sweeping,
    /// Holding between points until resumed or aborted.
    Paused,
    /// Returning instruments to a safe state.
    Finalizing,
    /// Every point was taken.
    Completed,
    /// Stopped on request.
    Aborted,
    /// Stopped by an error.
    Failed,
}

impl RunState {
    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Aborted | RunState::Failed
        )
    }
}

/// Operator request delivered to the run task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep sweeping.
    Run,
    /// Hold before the next point.
    Pause,
    /// Stop as soon as it is safe.
    Abort,
}

/// Everything a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Run identifier.
    pub run_id: Uuid,
    /// Terminal state.
    pub state: RunState,
    /// Sealed dataset, partial unless the run completed.
    pub dataset: Arc<Dataset>,
    /// Primary reason for a `Failed` run.
    pub failure: Option<String>,
    /// Classification of `failure`, when it has one.
    pub failure_kind: Option<ErrorKind>,
    /// Problems hit while returning the instruments to a safe state.
    pub finalize_errors: Vec<String>,
}

impl RunOutcome {
    /// Error kind describing how the run ended, if it did not complete.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.state {
            RunState::Aborted => Some(ErrorKind::AbortedByUser),
            _ => self.failure_kind,
        }
    }
}

/// Starts runs against a shared instrument registry.
#[derive(Debug, Clone)]
pub struct RunCoordinator {
    registry: ResourceRegistry,
    events: EventBus,
}

impl RunCoordinator {
    /// Coordinator with the default event channel capacity.
    pub fn new(registry: ResourceRegistry) -> Self {
        Self::with_event_capacity(registry, 256)
    }

    /// Coordinator whose event channel buffers `capacity` events.
    pub fn with_event_capacity(registry: ResourceRegistry, capacity: usize) -> Self {
        Self {
            registry,
            events: EventBus::new(capacity),
        }
    }

    /// Registry used for instrument leases.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Events of every run started by this coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Validate, lease and launch a run.
    ///
    /// Fails without side effects on invalid configuration, missing
    /// capabilities, or when any instrument is leased by another run.
    #[instrument(skip_all, fields(instruments = handles.len()))]
    pub fn start(&self, config: SweepConfig, handles: &[InstrumentHandle]) -> AppResult<RunHandle> {
        config.validate()?;
        let instruments = InstrumentSet::from_handles(handles)?;

        let run_id = Uuid::new_v4();
        let lease = self.registry.lease(run_id, instruments.ids())?;

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let dataset = Dataset::new(run_id, config.clone(), instruments.ids().to_vec());

        let run = RunTask {
            run_id,
            config,
            instruments,
            events: self.events.clone(),
            state: state_tx,
            control: control_rx,
            dataset,
            lease: Some(lease),
        };
        info!(%run_id, points = run.config.plan().len(), "starting run");
        let task = tokio::spawn(run.execute().instrument(info_span!("run", %run_id)));

        Ok(RunHandle {
            run_id,
            control: control_tx,
            state: state_rx,
            events: self.events.clone(),
            task,
        })
    }
}

/// Control surface of a running sweep.
///
/// Dropping the handle does not stop the run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    control: watch::Sender<ControlSignal>,
    state: watch::Receiver<RunState>,
    events: EventBus,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Identifier of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Events published from now on, for every run of the coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Finish the in-flight point, then hold before the next one.
    pub fn pause(&self) -> AppResult<()> {
        self.signal(|current| *current == ControlSignal::Run, ControlSignal::Pause)
    }

    /// Continue a paused run.
    pub fn resume(&self) -> AppResult<()> {
        self.signal(|current| *current == ControlSignal::Pause, ControlSignal::Run)
    }

    /// Stop as soon as it is safe. The dataset is kept and tagged partial.
    pub fn abort(&self) -> AppResult<()> {
        self.signal(|current| *current != ControlSignal::Abort, ControlSignal::Abort)
    }

    fn signal(&self, applies: impl Fn(&ControlSignal) -> bool, next: ControlSignal) -> AppResult<()> {
        if self.state().is_terminal() {
            return Err(DaqError::RunNotActive);
        }
        self.control.send_if_modified(|current| {
            if applies(current) {
                *current = next;
                true
            } else {
                false
            }
        });
        debug!(run_id = %self.run_id, signal = ?next, "control signal sent");
        Ok(())
    }

    /// Wait until the run reaches `wanted`. Fails if the run ends first.
    pub async fn wait_for_state(&self, wanted: RunState) -> AppResult<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == wanted || s.is_terminal())
            .await
            .map_err(|_| DaqError::RunNotActive)?;
        if *reached == wanted {
            Ok(())
        } else {
            Err(DaqError::RunNotActive)
        }
    }

    /// Wait for the run to end and collect its outcome.
    pub async fn wait(self) -> AppResult<RunOutcome> {
        self.task
            .await
            .map_err(|err| DaqError::RunTask(err.to_string()))
    }
}

/// Instrument settings changed during Initializing that Finalizing must undo.
#[derive(Debug, Default)]
struct TipBracket {
    feedback_disabled: bool,
    saved_bias: Option<f64>,
    output_armed: bool,
}

enum SweepEnd {
    Completed,
    Aborted,
    Failed {
        reason: String,
        kind: Option<ErrorKind>,
    },
}

impl SweepEnd {
    /// Failure raised by the engine itself rather than by an instrument
    /// fault. Only errors that carry a kind are classified.
    fn from_error(err: &DaqError) -> Self {
        SweepEnd::Failed {
            reason: err.to_string(),
            kind: err.kind(),
        }
    }

    fn from_fault(fault: &InstrumentFault) -> Self {
        SweepEnd::Failed {
            reason: fault.to_string(),
            kind: Some(fault.kind()),
        }
    }
}

struct RunTask {
    run_id: Uuid,
    config: SweepConfig,
    instruments: InstrumentSet,
    events: EventBus,
    state: watch::Sender<RunState>,
    control: watch::Receiver<ControlSignal>,
    dataset: Dataset,
    lease: Option<ResourceLease>,
}

impl RunTask {
    async fn execute(mut self) -> RunOutcome {
        self.transition(RunState::Initializing);
        let mut bracket = TipBracket::default();
        let initialized = self.initialize(&mut bracket).await;
        let abort_requested = *self.control.borrow() == ControlSignal::Abort;
        let end = match initialized {
            Ok(()) if abort_requested => SweepEnd::Aborted,
            Ok(()) => {
                self.transition(RunState::Sweeping);
                self.sweep().await
            }
            Err(fault) => {
                error!(%fault, "initialization failed");
                SweepEnd::from_fault(&fault)
            }
        };

        self.transition(RunState::Finalizing);
        let finalize_errors = self.finalize(&bracket).await;
        drop(self.lease.take());

        let (state, failure, failure_kind) = match end {
            SweepEnd::Completed => (RunState::Completed, None, None),
            SweepEnd::Aborted => (RunState::Aborted, None, None),
            SweepEnd::Failed { reason, kind } => (RunState::Failed, Some(reason), kind),
        };
        let partial = state != RunState::Completed;
        self.dataset.seal(state, partial, failure.clone());
        let dataset = Arc::new(self.dataset.clone());

        self.transition(state);
        self.events.publish(RunEvent::Finished {
            run_id: self.run_id,
            state,
            dataset: dataset.clone(),
        });
        info!(?state, points = dataset.len(), partial, "run finished");

        RunOutcome {
            run_id: self.run_id,
            state,
            dataset,
            failure,
            failure_kind,
            finalize_errors,
        }
    }

    fn transition(&self, to: RunState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(?from, ?to, "run state changed");
            self.events.publish(RunEvent::StateChanged {
                run_id: self.run_id,
                from,
                to,
            });
        }
    }

    async fn initialize(&mut self, bracket: &mut TipBracket) -> Result<(), InstrumentFault> {
        let limit = self.config.acquire_timeout;
        if let Some(feedback) = self.instruments.feedback().cloned() {
            let id = feedback.identity();
            let position = bounded(limit, id.clone(), feedback.get_position()).await?;
            info!(x = position.x, y = position.y, z = position.z, "tip position recorded");
            self.dataset.set_tip_position(position);

            bounded(limit, id.clone(), feedback.disable_feedback()).await?;
            bracket.feedback_disabled = true;

            if let Some(probe_bias) = self.config.probe_bias {
                let previous = bounded(limit, id.clone(), feedback.bias()).await?;
                bracket.saved_bias = Some(previous);
                bounded(limit, id, feedback.set_bias(probe_bias)).await?;
                info!(previous, probe_bias, "probe bias applied");
            }
        }

        let delay = self.instruments.delay().clone();
        bounded(limit, delay.identity(), delay.arm()).await?;
        bracket.output_armed = true;

        let acquisition = self.instruments.acquisition().clone();
        bounded(limit, acquisition.identity(), acquisition.prepare()).await
    }

    async fn sweep(&mut self) -> SweepEnd {
        let mut sequencer = ScanSequencer::new(
            self.run_id,
            self.config.clone(),
            self.instruments.clone(),
            self.events.clone(),
        );
        let total = sequencer.total_points();
        let mut point_retries = 0;

        loop {
            let pause_requested = *self.control.borrow() == ControlSignal::Pause;
            if pause_requested && !self.hold().await {
                return SweepEnd::Aborted;
            }

            let advance = match sequencer.advance(&mut self.control).await {
                Ok(advance) => advance,
                Err(err) => {
                    error!(%err, "sequencer error");
                    return SweepEnd::from_error(&err);
                }
            };

            match advance {
                Advance::Completed(point) => {
                    point_retries = 0;
                    self.dataset.push(point.clone());
                    self.events.publish(RunEvent::PointCompleted {
                        run_id: self.run_id,
                        point: Arc::new(point),
                        total,
                    });
                }
                Advance::Failed { point, fault } => {
                    let will_retry = point_retries < self.config.point_retries;
                    self.events.publish(RunEvent::PointFailed {
                        run_id: self.run_id,
                        point: Arc::new(point.clone()),
                        will_retry,
                    });
                    if will_retry {
                        point_retries += 1;
                        warn!(index = point.index, attempt = point_retries, %fault, "retrying point");
                        if let Err(err) = sequencer.retry_point() {
                            error!(%err, "could not reopen point");
                            return SweepEnd::from_error(&err);
                        }
                        continue;
                    }
                    error!(index = point.index, %fault, "point failed, stopping run");
                    self.dataset.push(point);
                    return SweepEnd::from_fault(&fault);
                }
                Advance::Halted => {
                    info!(completed = self.dataset.len(), "run aborted");
                    return SweepEnd::Aborted;
                }
                Advance::SweepComplete => return SweepEnd::Completed,
            }
        }
    }

    /// Stay paused until resumed. Returns `false` on abort.
    async fn hold(&mut self) -> bool {
        self.transition(RunState::Paused);
        loop {
            let signal = *self.control.borrow_and_update();
            match signal {
                ControlSignal::Run => break,
                ControlSignal::Abort => return false,
                ControlSignal::Pause => {}
            }
            if self.control.changed().await.is_err() {
                warn!("control handle dropped while paused, aborting");
                return false;
            }
        }
        self.transition(RunState::Sweeping);
        true
    }

    /// Undo the Initializing changes. The output goes off first, and bias
    /// goes back before feedback resumes.
    async fn finalize(&self, bracket: &TipBracket) -> Vec<String> {
        let mut errors = Vec::new();
        let limit = self.config.acquire_timeout;

        if bracket.output_armed {
            let delay = self.instruments.delay();
            match bounded(limit, delay.identity(), delay.disarm()).await {
                Ok(()) => info!("pulse output disabled"),
                Err(fault) => {
                    error!(%fault, "failed to disable pulse output");
                    errors.push(fault.to_string());
                }
            }
        }

        let Some(feedback) = self.instruments.feedback() else {
            return errors;
        };
        let id = feedback.identity();

        if let Some(bias) = bracket.saved_bias {
            match bounded(limit, id.clone(), feedback.set_bias(bias)).await {
                Ok(()) => info!(bias, "bias restored"),
                Err(fault) => {
                    error!(%fault, "failed to restore bias");
                    errors.push(fault.to_string());
                }
            }
        }
        if bracket.feedback_disabled {
            match bounded(limit, id, feedback.enable_feedback()).await {
                Ok(()) => info!("feedback re-enabled"),
                Err(fault) => {
                    error!(%fault, "failed to re-enable feedback");
                    errors.push(fault.to_string());
                }
            }
        }
        errors
    }
}
