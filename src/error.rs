//! Custom error types for the sequencing engine.
//!
//! This module defines the primary error type, `DaqError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to report everything from configuration mistakes to instruments that
//! stop answering halfway through a sweep.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidConfig`**: A sweep or application configuration failed
//!   validation. Never retried; surfaced immediately at run start.
//! - **`ConfigLoad`**: Wraps errors from `figment` while reading a config file
//!   or the environment.
//! - **`Instrument`**: An [`InstrumentFault`] that escaped the per-point retry
//!   budget. The fault keeps the instrument identity and the raw payload.
//! - **`BusyResource`**: Another run already owns one of the requested
//!   instrument handles. Fails fast, no queuing.
//! - **`MissingCapability`**: The supplied instruments do not cover a role the
//!   sequencer needs (delay or acquisition).
//! - **`Buffer`**: A sample was rejected by the acquisition buffer.
//! - **`PointUnresolved`**: The sequencer was asked to move on while a point
//!   is still in error.
//! - **`RunNotActive`**: A control request reached a run that already ended.
//! - **`RunTask`**: The task driving a run panicked or was cancelled.
//!
//! Instrument-level problems are modelled separately as [`InstrumentFault`]
//! so the sequencer can classify them (retry vs. escalate) before they ever
//! become a `DaqError`.

use crate::instrument::InstrumentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification used in point status records and run outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration rejected by validation.
    InvalidConfig,
    /// Transport-level instrument failure.
    CommFault,
    /// Transport-level failure caused by an elapsed timeout.
    CommTimeout,
    /// A response arrived but could not be interpreted.
    MalformedResponse,
    /// Instrument handle owned by another run.
    BusyResource,
    /// Run stopped on request. Not an error.
    AbortedByUser,
}

impl ErrorKind {
    /// Whether faults of this kind are eligible for the per-point retry budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::CommFault | ErrorKind::CommTimeout | ErrorKind::MalformedResponse
        )
    }
}

/// Failure reported by an instrument adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentFault {
    /// The transport failed.
    #[error("communication fault on '{instrument}': {detail}")]
    CommFault {
        /// Instrument that failed.
        instrument: InstrumentId,
        /// Transport error text.
        detail: String,
    },

    /// No answer within the allowed time.
    #[error("'{instrument}' did not answer within {timeout_ms} ms")]
    Timeout {
        /// Instrument that did not answer.
        instrument: InstrumentId,
        /// The limit that elapsed.
        timeout_ms: u64,
    },

    /// An answer arrived but could not be interpreted.
    #[error("malformed response from '{instrument}': {raw:?}")]
    MalformedResponse {
        /// Instrument that answered.
        instrument: InstrumentId,
        /// The reply as received.
        raw: String,
    },
}

impl InstrumentFault {
    /// Communication fault with a description.
    pub fn comm(instrument: InstrumentId, detail: impl Into<String>) -> Self {
        InstrumentFault::CommFault {
            instrument,
            detail: detail.into(),
        }
    }

    /// Malformed response keeping the raw payload.
    pub fn malformed(instrument: InstrumentId, raw: impl Into<String>) -> Self {
        InstrumentFault::MalformedResponse {
            instrument,
            raw: raw.into(),
        }
    }

    /// Classification used for retries and point records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstrumentFault::CommFault { .. } => ErrorKind::CommFault,
            InstrumentFault::Timeout { .. } => ErrorKind::CommTimeout,
            InstrumentFault::MalformedResponse { .. } => ErrorKind::MalformedResponse,
        }
    }

    /// Instrument the fault came from.
    pub fn instrument(&self) -> &InstrumentId {
        match self {
            InstrumentFault::CommFault { instrument, .. }
            | InstrumentFault::Timeout { instrument, .. }
            | InstrumentFault::MalformedResponse { instrument, .. } => instrument,
        }
    }

    /// Raw payload of a malformed response, if any.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            InstrumentFault::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Primary error type for the crate. See the module docs for the hierarchy.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Instrument fault beyond recovery.
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentFault),

    /// Instrument leased by another run.
    #[error("Instrument '{0}' is owned by another active run")]
    BusyResource(InstrumentId),

    /// No supplied instrument fills a required role.
    #[error("No instrument provides the '{0}' capability")]
    MissingCapability(&'static str),

    /// Sample rejected by the acquisition buffer.
    #[error("Acquisition buffer rejected sample: {0}")]
    Buffer(#[from] crate::data::BufferError),

    /// A failed point must be retried or skipped first.
    #[error("Point {0} is in error; retry or abandon it first")]
    PointUnresolved(usize),

    /// The run already ended, or the point is not in error.
    #[error("Run is no longer active")]
    RunNotActive,

    /// The run task panicked or was cancelled.
    #[error("Run task ended abnormally: {0}")]
    RunTask(String),
}

impl DaqError {
    /// Classification, for errors that map onto an [`ErrorKind`].
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DaqError::InvalidConfig(_) | DaqError::ConfigLoad(_) => Some(ErrorKind::InvalidConfig),
            DaqError::Instrument(fault) => Some(fault.kind()),
            DaqError::BusyResource(_) => Some(ErrorKind::BusyResource),
            _ => None,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}
