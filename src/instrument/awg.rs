//! Arbitrary waveform generator used as the delay source.
//!
//! Pump and probe pulses are loaded as arbitrary waveforms on two channels
//! sharing one period. Shifting the phase of the swept channel moves the
//! probe pulse relative to the pump, so a delay maps to a phase as
//! `phase_deg = delay / period * 360`.
//!
//! The waveforms themselves are loaded on the instrument beforehand. A run
//! only switches the swept channel's output on (`arm`) and off (`disarm`)
//! and moves its phase.

use super::capabilities::FaultResult;
use super::transport::Transport;
use super::{DelayControl, Instrument, InstrumentId};
use crate::error::InstrumentFault;
use async_trait::async_trait;
use tracing::{debug, info};

/// SCPI waveform generator whose swept channel phase realises the delay.
#[derive(Debug)]
pub struct WaveformDelayGenerator<T: Transport> {
    transport: T,
    channel: u8,
    period: f64,
}

impl<T: Transport> WaveformDelayGenerator<T> {
    /// `period` is the waveform period in the same time unit as the delays.
    pub fn new(transport: T, channel: u8, period: f64) -> Self {
        Self {
            transport,
            channel,
            period,
        }
    }

    /// Phase in degrees that realises `delay`.
    pub fn phase_for(&self, delay: f64) -> f64 {
        delay / self.period * 360.0
    }

    /// Delay realised by a phase in degrees.
    pub fn delay_for(&self, phase: f64) -> f64 {
        phase * self.period / 360.0
    }
}

impl<T: Transport> Instrument for WaveformDelayGenerator<T> {
    fn identity(&self) -> InstrumentId {
        self.transport.instrument().clone()
    }
}

#[async_trait]
impl<T: Transport> DelayControl for WaveformDelayGenerator<T> {
    async fn set_delay(&self, delay: f64) -> FaultResult<()> {
        let phase = self.phase_for(delay);
        self.transport
            .write(&format!("SOURce{}:PHASe:ARB {}", self.channel, phase))
            .await?;
        self.transport.write("*WAI").await?;

        let status = self.transport.query("SYST:ERR?").await?;
        if !status.trim_start().starts_with("+0") {
            return Err(InstrumentFault::malformed(self.identity(), status));
        }
        debug!(instrument = %self.identity(), delay, phase, "delay set");
        Ok(())
    }

    async fn arm(&self) -> FaultResult<()> {
        self.transport
            .write(&format!("OUTPut{} ON", self.channel))
            .await?;
        info!(instrument = %self.identity(), channel = self.channel, "output enabled");
        Ok(())
    }

    async fn disarm(&self) -> FaultResult<()> {
        self.transport
            .write(&format!("OUTPut{} OFF", self.channel))
            .await?;
        info!(instrument = %self.identity(), channel = self.channel, "output disabled");
        Ok(())
    }
}
