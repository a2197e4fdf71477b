//! Instrument adapters and capability-tagged handles.
//!
//! The sequencer never sees a concrete instrument type. It asks an
//! [`InstrumentSet`] for "the delay-capable instrument", "the
//! acquisition-capable instrument" and, optionally, "the feedback-capable
//! instrument". Concrete adapters (lock-in, waveform generator, RHK STM
//! controller, mocks) are wrapped into [`InstrumentHandle`]s that advertise
//! which capability traits they implement.

pub mod awg;
pub mod capabilities;
pub mod factory;
pub mod lockin;
pub mod mock;
pub mod rhk;
pub mod transport;

pub use capabilities::{
    Acquisition, Capabilities, DelayControl, FeedbackControl, Instrument, InstrumentHandle,
};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque instrument identifier, unique within a [`crate::resource::ResourceRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Tip position reported by a feedback controller, in scan coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    /// Lateral position along the fast scan axis.
    pub x: f64,
    /// Lateral position along the slow scan axis.
    pub y: f64,
    /// Tip height.
    pub z: f64,
}

/// Instruments resolved by role for one run.
///
/// The same physical instrument may fill several roles; its id then appears
/// once in [`InstrumentSet::ids`].
#[derive(Clone)]
pub struct InstrumentSet {
    delay: Arc<dyn DelayControl>,
    acquisition: Arc<dyn Acquisition>,
    feedback: Option<Arc<dyn FeedbackControl>>,
    ids: Vec<InstrumentId>,
}

impl fmt::Debug for InstrumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSet")
            .field("delay", &self.delay.identity())
            .field("acquisition", &self.acquisition.identity())
            .field("feedback", &self.feedback.as_ref().map(|fb| fb.identity()))
            .finish()
    }
}

impl InstrumentSet {
    /// Resolve roles from a list of handles.
    ///
    /// The first handle advertising a capability fills that role. Fails with
    /// [`DaqError::MissingCapability`] when no handle can set the delay or
    /// acquire samples. A feedback controller is optional.
    pub fn from_handles(handles: &[InstrumentHandle]) -> AppResult<Self> {
        let delay = handles
            .iter()
            .find_map(InstrumentHandle::as_delay_control)
            .ok_or(DaqError::MissingCapability("set_delay"))?;
        let acquisition = handles
            .iter()
            .find_map(InstrumentHandle::as_acquisition)
            .ok_or(DaqError::MissingCapability("acquire"))?;
        let feedback = handles.iter().find_map(InstrumentHandle::as_feedback_control);

        let mut ids: Vec<InstrumentId> = Vec::with_capacity(handles.len());
        for handle in handles {
            if !ids.contains(handle.id()) {
                ids.push(handle.id().clone());
            }
        }

        Ok(Self {
            delay,
            acquisition,
            feedback,
            ids,
        })
    }

    /// Instrument positioning the delay.
    pub fn delay(&self) -> &Arc<dyn DelayControl> {
        &self.delay
    }

    /// Instrument producing samples.
    pub fn acquisition(&self) -> &Arc<dyn Acquisition> {
        &self.acquisition
    }

    /// STM controller, when one takes part.
    pub fn feedback(&self) -> Option<&Arc<dyn FeedbackControl>> {
        self.feedback.as_ref()
    }

    /// Every distinct instrument taking part in the run.
    pub fn ids(&self) -> &[InstrumentId] {
        &self.ids
    }
}
