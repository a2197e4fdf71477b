//! Capability traits and the handles that carry them.

use super::{InstrumentId, Position3D};
use crate::error::InstrumentFault;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Result type returned by every adapter operation.
pub type FaultResult<T> = std::result::Result<T, InstrumentFault>;

/// Base trait shared by all adapters.
pub trait Instrument: Send + Sync {
    /// Identifier the instrument is leased and reported under.
    fn identity(&self) -> InstrumentId;
}

/// Capability for instruments that position the pump/probe delay.
#[async_trait]
pub trait DelayControl: Instrument {
    /// Set the delay in physical time units. Returns once the instrument has
    /// acknowledged the change.
    async fn set_delay(&self, delay: f64) -> FaultResult<()>;

    /// Enable the pulse output before the first point.
    async fn arm(&self) -> FaultResult<()> {
        Ok(())
    }

    /// Disable the pulse output once the run is over.
    async fn disarm(&self) -> FaultResult<()> {
        Ok(())
    }
}

/// Capability for instruments that produce the measured response signal.
#[async_trait]
pub trait Acquisition: Instrument {
    /// Called once during run initialisation.
    async fn prepare(&self) -> FaultResult<()> {
        Ok(())
    }

    /// Trigger and read back a single sample.
    async fn acquire_one(&self) -> FaultResult<f64>;
}

/// Capability for STM tip/feedback controllers.
#[async_trait]
pub trait FeedbackControl: Instrument {
    /// Hand the tip back to the feedback loop.
    async fn enable_feedback(&self) -> FaultResult<()>;
    /// Freeze the tip at its current height.
    async fn disable_feedback(&self) -> FaultResult<()>;
    /// Current tip position.
    async fn get_position(&self) -> FaultResult<Position3D>;
    /// Move the tip towards the sample.
    async fn approach(&self) -> FaultResult<()>;
    /// Move the tip away from the sample.
    async fn retract(&self) -> FaultResult<()>;
    /// Current sample bias in volts.
    async fn bias(&self) -> FaultResult<f64>;
    /// Set the sample bias in volts.
    async fn set_bias(&self, bias: f64) -> FaultResult<()>;
}

/// Capability set advertised by an [`InstrumentHandle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Implements [`DelayControl`].
    pub can_set_delay: bool,
    /// Implements [`Acquisition`].
    pub can_acquire: bool,
    /// Implements [`FeedbackControl`].
    pub can_control_feedback: bool,
}

/// Opaque identifier plus the capability proxies an instrument exposes.
#[derive(Clone)]
pub struct InstrumentHandle {
    id: InstrumentId,
    delay: Option<Arc<dyn DelayControl>>,
    acquisition: Option<Arc<dyn Acquisition>>,
    feedback: Option<Arc<dyn FeedbackControl>>,
}

impl fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl InstrumentHandle {
    /// Handle with no capabilities attached yet.
    pub fn new(id: impl Into<InstrumentId>) -> Self {
        Self {
            id: id.into(),
            delay: None,
            acquisition: None,
            feedback: None,
        }
    }

    /// Attach the delay capability.
    pub fn with_delay(mut self, adapter: Arc<dyn DelayControl>) -> Self {
        self.delay = Some(adapter);
        self
    }

    /// Attach the acquisition capability.
    pub fn with_acquisition(mut self, adapter: Arc<dyn Acquisition>) -> Self {
        self.acquisition = Some(adapter);
        self
    }

    /// Attach the feedback capability.
    pub fn with_feedback(mut self, adapter: Arc<dyn FeedbackControl>) -> Self {
        self.feedback = Some(adapter);
        self
    }

    /// Instrument identifier.
    pub fn id(&self) -> &InstrumentId {
        &self.id
    }

    /// Capabilities attached to the handle.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_set_delay: self.delay.is_some(),
            can_acquire: self.acquisition.is_some(),
            can_control_feedback: self.feedback.is_some(),
        }
    }

    /// Delay proxy, if attached.
    pub fn as_delay_control(&self) -> Option<Arc<dyn DelayControl>> {
        self.delay.clone()
    }

    /// Acquisition proxy, if attached.
    pub fn as_acquisition(&self) -> Option<Arc<dyn Acquisition>> {
        self.acquisition.clone()
    }

    /// Feedback proxy, if attached.
    pub fn as_feedback_control(&self) -> Option<Arc<dyn FeedbackControl>> {
        self.feedback.clone()
    }
}

impl From<String> for InstrumentId {
    fn from(id: String) -> Self {
        InstrumentId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockInstrument;

    #[tokio::test]
    async fn handle_advertises_only_attached_capabilities() {
        let stm = Arc::new(MockInstrument::new("stm"));
        let handle = InstrumentHandle::new("stm").with_feedback(stm);

        let caps = handle.capabilities();
        assert!(caps.can_control_feedback);
        assert!(!caps.can_set_delay);
        assert!(!caps.can_acquire);

        let feedback = handle
            .as_feedback_control()
            .expect("expected feedback proxy");
        feedback.disable_feedback().await.unwrap();
        assert!(handle.as_delay_control().is_none());
    }
}
