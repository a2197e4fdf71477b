//! RHK R9 STM controller as the feedback instrument.
//!
//! The R9 accepts comma-separated remote commands over TCP (port 12600 by
//! default) and answers every setter with `Done`. Freezing the Z PI
//! controller holds the tip height while the pulses are applied;
//! `Unlimit` hands the tip back to the feedback loop.

use super::capabilities::FaultResult;
use super::transport::Transport;
use super::{FeedbackControl, Instrument, InstrumentId, Position3D};
use crate::error::InstrumentFault;
use async_trait::async_trait;
use tracing::{debug, info};

const ACK: &str = "Done";

/// Read-back mismatch tolerated after a bias change, in volts.
const BIAS_TOLERANCE: f64 = 1e-6;

/// Remote-command adapter for the RHK R9.
#[derive(Debug)]
pub struct RhkController<T: Transport> {
    transport: T,
}

impl<T: Transport> RhkController<T> {
    /// Wrap a connected transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn set(&self, command: &str) -> FaultResult<()> {
        let reply = self.transport.query(command).await?;
        if reply.trim() != ACK {
            return Err(InstrumentFault::malformed(self.identity(), reply));
        }
        Ok(())
    }

    async fn get(&self, command: &str) -> FaultResult<f64> {
        let reply = self.transport.query(command).await?;
        reply
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| InstrumentFault::malformed(self.identity(), reply))
    }

    async fn tip_control(&self, mode: &str) -> FaultResult<()> {
        self.set(&format!("SetHWParameter, Z PI Controller 1, Tip Control, {mode}"))
            .await?;
        info!(instrument = %self.identity(), mode, "tip control set");
        Ok(())
    }

    /// Start a named procedure. The R9 acknowledges first and reports again
    /// once the procedure has run.
    async fn procedure(&self, name: &str) -> FaultResult<()> {
        let replies = self
            .transport
            .query_lines(&format!("StartProcedure, {name}"), 2)
            .await?;
        match replies.first() {
            Some(ack) if ack.trim() == ACK => {
                debug!(instrument = %self.identity(), procedure = name, finished = ?replies.get(1), "procedure done");
                Ok(())
            }
            other => Err(InstrumentFault::malformed(
                self.identity(),
                other.cloned().unwrap_or_default(),
            )),
        }
    }
}

impl<T: Transport> Instrument for RhkController<T> {
    fn identity(&self) -> InstrumentId {
        self.transport.instrument().clone()
    }
}

#[async_trait]
impl<T: Transport> FeedbackControl for RhkController<T> {
    async fn enable_feedback(&self) -> FaultResult<()> {
        self.tip_control("Unlimit").await
    }

    async fn disable_feedback(&self) -> FaultResult<()> {
        self.tip_control("Freeze").await
    }

    async fn get_position(&self) -> FaultResult<Position3D> {
        let x = self
            .get("GetSWParameter, Scan Area Window, Tip X in scan coordinates")
            .await?;
        let y = self
            .get("GetSWParameter, Scan Area Window, Tip Y in scan coordinates")
            .await?;
        let z = self.get("ReadChannelValue, z0-src").await?;
        Ok(Position3D { x, y, z })
    }

    /// One coarse step towards the sample.
    async fn approach(&self) -> FaultResult<()> {
        self.procedure("Pan Single Step In").await
    }

    /// One coarse step away from the sample.
    async fn retract(&self) -> FaultResult<()> {
        self.procedure("Pan Single Step Out").await
    }

    async fn bias(&self) -> FaultResult<f64> {
        self.get("GetSWParameter, STM Bias, Value").await
    }

    /// Set the bias and confirm it by reading it back.
    async fn set_bias(&self, bias: f64) -> FaultResult<()> {
        self.set(&format!("SetSWParameter, STM Bias, Value, {bias}"))
            .await?;
        let actual = self.bias().await?;
        if (actual - bias).abs() > BIAS_TOLERANCE {
            return Err(InstrumentFault::malformed(
                self.identity(),
                format!("bias reads {actual} after setting {bias}"),
            ));
        }
        info!(instrument = %self.identity(), bias, "STM bias set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::instrument::transport::testing::ScriptedTransport;

    fn replies(lines: &[&str]) -> Vec<FaultResult<String>> {
        lines.iter().map(|line| Ok(line.to_string())).collect()
    }

    #[tokio::test]
    async fn freeze_and_unlimit_tip_control() {
        let transport = ScriptedTransport::new("stm", replies(&["Done", "Done"]));
        let stm = RhkController::new(transport);

        stm.disable_feedback().await.unwrap();
        stm.enable_feedback().await.unwrap();
        assert_eq!(
            stm.transport.sent(),
            vec![
                "SetHWParameter, Z PI Controller 1, Tip Control, Freeze",
                "SetHWParameter, Z PI Controller 1, Tip Control, Unlimit",
            ]
        );
    }

    #[tokio::test]
    async fn set_bias_is_confirmed_by_read_back() {
        let transport = ScriptedTransport::new("stm", replies(&["Done", "0.01"]));
        let stm = RhkController::new(transport);

        stm.set_bias(0.01).await.unwrap();
        assert_eq!(
            stm.transport.sent(),
            vec![
                "SetSWParameter, STM Bias, Value, 0.01",
                "GetSWParameter, STM Bias, Value",
            ]
        );
    }

    #[tokio::test]
    async fn bias_that_did_not_take_is_a_fault() {
        let transport = ScriptedTransport::new("stm", replies(&["Done", "1.2"]));
        let stm = RhkController::new(transport);

        let fault = stm.set_bias(0.01).await.unwrap_err();
        assert_eq!(fault.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn rejected_command_keeps_reply() {
        let transport =
            ScriptedTransport::new("stm", replies(&["Error: Unknown parameter"]));
        let stm = RhkController::new(transport);

        let fault = stm.disable_feedback().await.unwrap_err();
        assert_eq!(fault.raw_response(), Some("Error: Unknown parameter"));
    }

    #[tokio::test]
    async fn position_reads_scan_offsets_and_height() {
        let transport = ScriptedTransport::new("stm", replies(&["1.5e-8", "-2e-9", "3.25e-10"]));
        let stm = RhkController::new(transport);

        let position = stm.get_position().await.unwrap();
        assert_eq!(
            position,
            Position3D {
                x: 1.5e-8,
                y: -2e-9,
                z: 3.25e-10
            }
        );
        assert_eq!(stm.transport.sent()[2], "ReadChannelValue, z0-src");
    }

    #[tokio::test]
    async fn coarse_steps_wait_for_both_replies() {
        let transport = ScriptedTransport::new("stm", replies(&["Done", "Done", "Done", "Done"]));
        let stm = RhkController::new(transport);

        stm.approach().await.unwrap();
        stm.retract().await.unwrap();
        assert_eq!(
            stm.transport.sent(),
            vec![
                "StartProcedure, Pan Single Step In",
                "StartProcedure, Pan Single Step Out",
            ]
        );
        assert!(stm.transport.replies.lock().unwrap().is_empty());
    }
}
