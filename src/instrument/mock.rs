//! Mock instrument for tests and dry runs.
//!
//! A single [`MockInstrument`] implements every capability trait, so one
//! instance can stand in for the delay generator, the lock-in and the STM
//! controller at once. It provides:
//! - a deterministic pump-probe-like signal as a function of the current delay
//! - simulated latency per call
//! - fault injection keyed by acquisition call number or by delay value
//! - a call log for verifying command ordering

use super::capabilities::FaultResult;
use super::{Acquisition, DelayControl, FeedbackControl, Instrument, InstrumentId, Position3D};
use crate::error::InstrumentFault;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fault the mock should produce instead of a normal reply.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFault {
    /// Transport failure.
    CommFault,
    /// Instrument-side timeout.
    Timeout,
    /// Reply received but unparseable; carries the raw payload.
    Malformed(String),
    /// Sleep for the given duration, then answer normally.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct MockState {
    delay: Option<f64>,
    acquire_calls: usize,
    faults_by_call: HashMap<usize, MockFault>,
    faults_by_delay: Vec<(f64, VecDeque<MockFault>)>,
    set_delay_faults: VecDeque<MockFault>,
    prepare_faults: VecDeque<MockFault>,
    latency: Duration,
    armed: bool,
    feedback_enabled: bool,
    bias: f64,
    position: Option<Position3D>,
    call_log: Vec<String>,
}

/// Scriptable instrument implementing every capability.
#[derive(Debug)]
pub struct MockInstrument {
    id: InstrumentId,
    decay: f64,
    state: Mutex<MockState>,
}

impl MockInstrument {
    /// Mock with feedback on, 0.5 V bias and the tip 1.0 above the surface.
    pub fn new(id: impl Into<InstrumentId>) -> Self {
        Self {
            id: id.into(),
            decay: 5.0,
            state: Mutex::new(MockState {
                feedback_enabled: true,
                bias: 0.5,
                position: Some(Position3D {
                    x: 0.0,
                    y: 0.0,
                    z: 1.0,
                }),
                ..MockState::default()
            }),
        }
    }

    /// Set simulated latency applied to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    /// Set the decay constant of the synthetic signal.
    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    /// Fail the `call`-th acquisition (0-based, counted over the mock's lifetime).
    pub fn fail_acquire_call(&self, call: usize, fault: MockFault) {
        self.state().faults_by_call.insert(call, fault);
    }

    /// Fail the next `count` acquisitions made while the delay equals `delay`.
    pub fn fail_acquire_at_delay(&self, delay: f64, count: usize, fault: MockFault) {
        let faults = std::iter::repeat(fault).take(count).collect();
        self.state().faults_by_delay.push((delay, faults));
    }

    /// Fail the next `set_delay` call.
    pub fn fail_next_set_delay(&self, fault: MockFault) {
        self.state().set_delay_faults.push_back(fault);
    }

    /// Fail the next `prepare` call.
    pub fn fail_next_prepare(&self, fault: MockFault) {
        self.state().prepare_faults.push_back(fault);
    }

    /// Signal the mock reports at `delay`.
    pub fn signal_at(&self, delay: f64) -> f64 {
        (-delay.abs() / self.decay).exp()
    }

    /// Last delay set.
    pub fn current_delay(&self) -> Option<f64> {
        self.state().delay
    }

    /// Whether the pulse output is on.
    pub fn armed(&self) -> bool {
        self.state().armed
    }

    /// Whether the feedback loop is on.
    pub fn feedback_enabled(&self) -> bool {
        self.state().feedback_enabled
    }

    /// Current bias.
    pub fn current_bias(&self) -> f64 {
        self.state().bias
    }

    /// Get the call log.
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_call(&self, call: String) -> Duration {
        let mut state = self.state();
        state.call_log.push(call);
        state.latency
    }

    async fn simulate_latency(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn apply_fault(&self, fault: MockFault) -> FaultResult<()> {
        match fault {
            MockFault::CommFault => Err(InstrumentFault::comm(
                self.id.clone(),
                "injected communication fault",
            )),
            MockFault::Timeout => Err(InstrumentFault::Timeout {
                instrument: self.id.clone(),
                timeout_ms: 0,
            }),
            MockFault::Malformed(raw) => Err(InstrumentFault::malformed(self.id.clone(), raw)),
            MockFault::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    fn take_acquire_fault(&self) -> (Option<MockFault>, Option<f64>) {
        let mut state = self.state();
        let call = state.acquire_calls;
        state.acquire_calls += 1;
        let delay = state.delay;

        if let Some(fault) = state.faults_by_call.remove(&call) {
            return (Some(fault), delay);
        }
        let by_delay = delay.and_then(|current| {
            state
                .faults_by_delay
                .iter_mut()
                .find(|(d, faults)| *d == current && !faults.is_empty())
                .and_then(|(_, faults)| faults.pop_front())
        });
        (by_delay, delay)
    }
}

impl Instrument for MockInstrument {
    fn identity(&self) -> InstrumentId {
        self.id.clone()
    }
}

#[async_trait]
impl DelayControl for MockInstrument {
    async fn set_delay(&self, delay: f64) -> FaultResult<()> {
        let latency = self.log_call(format!("set_delay {}", delay));
        Self::simulate_latency(latency).await;

        let fault = self.state().set_delay_faults.pop_front();
        if let Some(fault) = fault {
            self.apply_fault(fault).await?;
        }
        self.state().delay = Some(delay);
        Ok(())
    }

    async fn arm(&self) -> FaultResult<()> {
        self.log_call("arm".to_string());
        self.state().armed = true;
        Ok(())
    }

    async fn disarm(&self) -> FaultResult<()> {
        self.log_call("disarm".to_string());
        self.state().armed = false;
        Ok(())
    }
}

#[async_trait]
impl Acquisition for MockInstrument {
    async fn prepare(&self) -> FaultResult<()> {
        self.log_call("prepare".to_string());
        let fault = self.state().prepare_faults.pop_front();
        match fault {
            Some(fault) => self.apply_fault(fault).await,
            None => Ok(()),
        }
    }

    async fn acquire_one(&self) -> FaultResult<f64> {
        let latency = self.log_call("acquire".to_string());
        Self::simulate_latency(latency).await;

        let (fault, delay) = self.take_acquire_fault();
        if let Some(fault) = fault {
            self.apply_fault(fault).await?;
        }
        match delay {
            Some(delay) => Ok(self.signal_at(delay)),
            None => Err(InstrumentFault::malformed(self.id.clone(), "NO DELAY")),
        }
    }
}

#[async_trait]
impl FeedbackControl for MockInstrument {
    async fn enable_feedback(&self) -> FaultResult<()> {
        self.log_call("enable_feedback".to_string());
        self.state().feedback_enabled = true;
        Ok(())
    }

    async fn disable_feedback(&self) -> FaultResult<()> {
        self.log_call("disable_feedback".to_string());
        self.state().feedback_enabled = false;
        Ok(())
    }

    async fn get_position(&self) -> FaultResult<Position3D> {
        self.log_call("get_position".to_string());
        self.state()
            .position
            .ok_or_else(|| InstrumentFault::malformed(self.id.clone(), ""))
    }

    async fn approach(&self) -> FaultResult<()> {
        self.log_call("approach".to_string());
        let mut state = self.state();
        if let Some(position) = state.position.as_mut() {
            position.z = 0.0;
        }
        Ok(())
    }

    async fn retract(&self) -> FaultResult<()> {
        self.log_call("retract".to_string());
        let mut state = self.state();
        if let Some(position) = state.position.as_mut() {
            position.z += 1.0;
        }
        Ok(())
    }

    async fn bias(&self) -> FaultResult<f64> {
        self.log_call("get_bias".to_string());
        Ok(self.state().bias)
    }

    async fn set_bias(&self, bias: f64) -> FaultResult<()> {
        self.log_call(format!("set_bias {}", bias));
        self.state().bias = bias;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn acquisition_follows_delay() {
        let mock = MockInstrument::new("mock");
        mock.set_delay(0.0).await.unwrap();
        assert_eq!(mock.acquire_one().await.unwrap(), 1.0);
        mock.set_delay(5.0).await.unwrap();
        let value = mock.acquire_one().await.unwrap();
        assert!((value - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failure_injection_is_consumed() {
        let mock = MockInstrument::new("mock");
        mock.set_delay(1.0).await.unwrap();
        mock.fail_acquire_call(0, MockFault::Malformed("garbage".into()));

        let err = mock.acquire_one().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert_eq!(err.raw_response(), Some("garbage"));
        assert!(mock.acquire_one().await.is_ok());
    }

    #[tokio::test]
    async fn delay_keyed_faults_only_fire_at_that_delay() {
        let mock = MockInstrument::new("mock");
        mock.fail_acquire_at_delay(10.0, 2, MockFault::CommFault);

        mock.set_delay(5.0).await.unwrap();
        assert!(mock.acquire_one().await.is_ok());

        mock.set_delay(10.0).await.unwrap();
        assert!(mock.acquire_one().await.is_err());
        assert!(mock.acquire_one().await.is_err());
        assert!(mock.acquire_one().await.is_ok());
    }

    #[tokio::test]
    async fn call_logging() {
        let mock = MockInstrument::new("mock");
        mock.set_delay(2.5).await.unwrap();
        mock.acquire_one().await.unwrap();
        mock.disable_feedback().await.unwrap();

        let log = mock.call_log();
        assert_eq!(log, vec!["set_delay 2.5", "acquire", "disable_feedback"]);
        assert!(!mock.feedback_enabled());
        mock.clear_log();
        assert!(mock.call_log().is_empty());
    }
}
