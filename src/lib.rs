//! Sequencing engine for STM pump-probe delay sweeps.
//!
//! A run steps an optical delay through a planned list, waits for the system
//! to settle, and collects lock-in readings for every delay while the STM tip
//! is held frozen. The pieces:
//!
//! - [`instrument`]: capability traits, the mock instrument and TCP adapters
//!   for the lock-in amplifier, the arbitrary waveform generator and the
//!   RHK R9 STM controller
//! - [`sequencer`]: per-point state machine with retry budgets and timeouts
//! - [`coordinator`]: run lifecycle, pause/resume/abort, tip safety
//! - [`data`]: sample buffer and the resulting [`data::Dataset`]
//! - [`observer`]: broadcast progress events
//! - [`config`]: figment-backed configuration and sweep planning

pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod observer;
pub mod resource;
pub mod sequencer;

pub use config::{AppConfig, SweepConfig};
pub use coordinator::{RunCoordinator, RunHandle, RunOutcome, RunState};
pub use data::{Dataset, ScanPoint};
pub use error::{AppResult, DaqError, ErrorKind, InstrumentFault};
pub use instrument::{InstrumentHandle, InstrumentId};
pub use resource::ResourceRegistry;
