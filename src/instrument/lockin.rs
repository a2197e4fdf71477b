//! Lock-in amplifier acquisition adapter.
//!
//! Speaks the text protocol of Ethernet lock-ins such as the Signal Recovery
//! 7270: the `X.` command returns the in-phase output as a floating point
//! string, optionally followed by further fields.

use super::capabilities::FaultResult;
use super::transport::Transport;
use super::{Acquisition, Instrument, InstrumentId};
use crate::error::InstrumentFault;
use async_trait::async_trait;
use tracing::debug;

const READ_X: &str = "X.";

/// Parse a lock-in reply into a reading.
///
/// The first whitespace- or comma-separated token must be a finite float.
pub fn parse_reading(raw: &str) -> Option<f64> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Lock-in amplifier read through its `X.` command.
#[derive(Debug)]
pub struct LockInAmplifier<T: Transport> {
    transport: T,
}

impl<T: Transport> LockInAmplifier<T> {
    /// Wrap a connected transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: Transport> Instrument for LockInAmplifier<T> {
    fn identity(&self) -> InstrumentId {
        self.transport.instrument().clone()
    }
}

#[async_trait]
impl<T: Transport> Acquisition for LockInAmplifier<T> {
    /// The first reading after configuration reflects the output buffer, not
    /// the current signal. Read it once and throw it away.
    async fn prepare(&self) -> FaultResult<()> {
        let stale = self.transport.query(READ_X).await?;
        debug!(instrument = %self.identity(), stale = %stale, "discarded buffered lock-in reading");
        Ok(())
    }

    async fn acquire_one(&self) -> FaultResult<f64> {
        let raw = self.transport.query(READ_X).await?;
        parse_reading(&raw).ok_or_else(|| InstrumentFault::malformed(self.identity(), raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::instrument::transport::testing::ScriptedTransport;

    #[test]
    fn parses_first_token() {
        assert_eq!(parse_reading("1.25E-3"), Some(1.25e-3));
        assert_eq!(parse_reading("  -4.0  0.3\r"), Some(-4.0));
        assert_eq!(parse_reading("2.0,0.1"), Some(2.0));
        assert_eq!(parse_reading(""), None);
        assert_eq!(parse_reading("OVERLOAD"), None);
        assert_eq!(parse_reading("NaN"), None);
    }

    #[tokio::test]
    async fn prepare_discards_one_reading() {
        let transport = ScriptedTransport::new(
            "lockin",
            vec![Ok("9.99".to_string()), Ok("0.5".to_string())],
        );
        let lockin = LockInAmplifier::new(transport);

        lockin.prepare().await.unwrap();
        assert_eq!(lockin.acquire_one().await.unwrap(), 0.5);
        assert_eq!(lockin.transport.sent(), vec!["X.", "X."]);
    }

    #[tokio::test]
    async fn garbage_reply_is_malformed_with_raw_payload() {
        let transport = ScriptedTransport::new("lockin", vec![Ok("?".to_string())]);
        let lockin = LockInAmplifier::new(transport);

        let fault = lockin.acquire_one().await.unwrap_err();
        assert_eq!(fault.kind(), ErrorKind::MalformedResponse);
        assert_eq!(fault.raw_response(), Some("?"));
    }
}
