//! Build instrument handles from configuration.

use super::awg::WaveformDelayGenerator;
use super::lockin::LockInAmplifier;
use super::mock::MockInstrument;
use super::rhk::RhkController;
use super::transport::TcpTransport;
use super::{InstrumentHandle, InstrumentId};
use crate::config::{DriverKind, InstrumentDefinition};
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use tracing::info;

/// AWG output channel used when the definition names none.
const DEFAULT_AWG_CHANNEL: u8 = 1;

/// Connect every configured instrument, in definition order.
pub async fn build_handles(definitions: &[InstrumentDefinition]) -> AppResult<Vec<InstrumentHandle>> {
    let mut handles = Vec::with_capacity(definitions.len());
    for definition in definitions {
        handles.push(build_handle(definition).await?);
    }
    Ok(handles)
}

/// Connect one instrument and attach the capabilities its driver provides.
pub async fn build_handle(definition: &InstrumentDefinition) -> AppResult<InstrumentHandle> {
    let id = InstrumentId::new(definition.id.as_str());
    let handle = match definition.driver {
        DriverKind::Mock => {
            let mut mock = MockInstrument::new(id.clone());
            if let Some(latency) = definition.latency {
                mock = mock.with_latency(latency);
            }
            let mock = Arc::new(mock);
            InstrumentHandle::new(id)
                .with_delay(mock.clone())
                .with_acquisition(mock.clone())
                .with_feedback(mock)
        }
        DriverKind::LockIn => {
            let transport =
                TcpTransport::connect(id.clone(), address(definition)?, definition.timeout).await?;
            InstrumentHandle::new(id).with_acquisition(Arc::new(LockInAmplifier::new(transport)))
        }
        DriverKind::Rhk => {
            let transport =
                TcpTransport::connect(id.clone(), address(definition)?, definition.timeout).await?;
            InstrumentHandle::new(id).with_feedback(Arc::new(RhkController::new(transport)))
        }
        DriverKind::Awg => {
            let period = definition.period.ok_or_else(|| {
                DaqError::InvalidConfig(format!("AWG instrument '{}' needs a period", definition.id))
            })?;
            let channel = definition.channel.unwrap_or(DEFAULT_AWG_CHANNEL);
            let transport =
                TcpTransport::connect(id.clone(), address(definition)?, definition.timeout).await?;
            InstrumentHandle::new(id).with_delay(Arc::new(WaveformDelayGenerator::new(
                transport, channel, period,
            )))
        }
    };
    info!(instrument = %handle.id(), driver = ?definition.driver, "instrument ready");
    Ok(handle)
}

fn address(definition: &InstrumentDefinition) -> AppResult<&str> {
    definition.address.as_deref().ok_or_else(|| {
        DaqError::InvalidConfig(format!("instrument '{}' needs an address", definition.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn definition(id: &str, driver: DriverKind) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.to_string(),
            driver,
            address: None,
            channel: None,
            period: None,
            timeout: None,
            latency: None,
        }
    }

    #[tokio::test]
    async fn mock_definition_provides_every_capability() {
        let handle = build_handle(&definition("sim", DriverKind::Mock)).await.unwrap();
        let caps = handle.capabilities();
        assert!(caps.can_set_delay && caps.can_acquire && caps.can_control_feedback);
    }

    #[tokio::test]
    async fn lock_in_definition_connects_and_only_acquires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut lockin = definition("lockin", DriverKind::LockIn);
        lockin.address = Some(listener.local_addr().unwrap().to_string());

        let handle = build_handle(&lockin).await.unwrap();
        let caps = handle.capabilities();
        assert!(caps.can_acquire);
        assert!(!caps.can_set_delay);
    }

    #[tokio::test]
    async fn rhk_definition_only_controls_feedback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut stm = definition("stm", DriverKind::Rhk);
        stm.address = Some(listener.local_addr().unwrap().to_string());

        let handle = build_handle(&stm).await.unwrap();
        let caps = handle.capabilities();
        assert!(caps.can_control_feedback);
        assert!(!caps.can_acquire && !caps.can_set_delay);
    }

    #[tokio::test]
    async fn unreachable_instrument_is_a_comm_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut awg = definition("awg", DriverKind::Awg);
        awg.address = Some(address);
        awg.period = Some(100.0);
        let err = build_handle(&awg).await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(_)));
    }
}
