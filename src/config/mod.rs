//! Configuration system
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `PUMPPROBE_` (nested keys separated
//!    by `__`, e.g. `PUMPPROBE_SWEEP__SAMPLES_PER_POINT=4`)
//! 2. A TOML file (default: `config/pumpprobe.toml`)
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "STM pump-probe"
//! log_level = "info"
//!
//! [sweep]
//! start = 0.0
//! stop = 10.0
//! step = 5.0
//! settle_time = "10ms"
//! samples_per_point = 2
//! aggregation = "mean"
//! acquire_timeout = "500ms"
//! point_timeout = "5s"
//!
//! [[instruments]]
//! id = "awg"
//! driver = "awg"
//! address = "192.168.0.10:5025"
//! channel = 2
//! period = 100.0
//!
//! [[instruments]]
//! id = "lockin"
//! driver = "lock_in"
//! address = "192.168.0.20:50000"
//! ```

pub mod sweep;

pub use sweep::{Aggregation, PlannedPoint, SweepConfig};

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pumpprobe.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// The delay sweep to run.
    pub sweep: SweepConfig,
    /// Instruments `pumpprobe run` connects to.
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name shown in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
    /// Capacity of the run event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Instrument driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// In-process mock providing every capability.
    Mock,
    /// Arbitrary waveform generator over raw-socket SCPI.
    Awg,
    /// Ethernet lock-in amplifier.
    LockIn,
    /// RHK R9 STM controller, providing tip feedback and bias.
    Rhk,
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Driver used to talk to the instrument.
    pub driver: DriverKind,
    /// `host:port` for socket-based drivers.
    #[serde(default)]
    pub address: Option<String>,
    /// Output channel (waveform generator).
    #[serde(default)]
    pub channel: Option<u8>,
    /// Waveform period in delay units (waveform generator).
    #[serde(default)]
    pub period: Option<f64>,
    /// Per-command timeout for socket-based drivers.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Simulated per-call latency (mock).
    #[serde(default, with = "humantime_serde")]
    pub latency: Option<Duration>,
}

fn default_name() -> String {
    "pumpprobe".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl AppConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it.
    ///
    /// # Errors
    ///
    /// [`DaqError::ConfigLoad`] if the file cannot be read or does not match
    /// the schema, [`DaqError::InvalidConfig`] if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PUMPPROBE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - The sweep is valid
    /// - Instrument IDs are unique
    /// - Each instrument has the fields its driver needs
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.application.event_capacity == 0 {
            return Err(DaqError::InvalidConfig(
                "event_capacity must be > 0".to_string(),
            ));
        }

        self.sweep.validate()?;

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(DaqError::InvalidConfig(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            instrument.validate()?;
        }
        Ok(())
    }
}

impl InstrumentDefinition {
    fn validate(&self) -> AppResult<()> {
        if self.id.is_empty() {
            return Err(DaqError::InvalidConfig(
                "instrument 'id' cannot be empty".to_string(),
            ));
        }
        match self.driver {
            DriverKind::Mock => {}
            DriverKind::LockIn | DriverKind::Rhk => self.require_address()?,
            DriverKind::Awg => {
                self.require_address()?;
                match self.period {
                    Some(period) if period.is_finite() && period > 0.0 => {}
                    _ => {
                        return Err(DaqError::InvalidConfig(format!(
                            "AWG instrument '{}': 'period' must be a positive number",
                            self.id
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn require_address(&self) -> AppResult<()> {
        match self.address.as_deref() {
            Some(address) if !address.is_empty() => Ok(()),
            _ => Err(DaqError::InvalidConfig(format!(
                "instrument '{}': 'address' cannot be empty",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        log_level = "debug"

        [sweep]
        start = 0.0
        stop = 10.0
        step = 5.0
        settle_time = "0s"
        samples_per_point = 2
        aggregation = "mean"
        acquire_timeout = "200ms"
        point_timeout = "2s"

        [[instruments]]
        id = "sim"
        driver = "mock"

        [[instruments]]
        id = "awg"
        driver = "awg"
        address = "127.0.0.1:5025"
        channel = 2
        period = 100.0
    "#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_validates_file() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "pumpprobe");
        assert_eq!(config.sweep.delays(), vec![0.0, 5.0, 10.0]);
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.instruments[1].driver, DriverKind::Awg);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let file = write_config(&format!(
            "{}\n[[instruments]]\nid = \"sim\"\ndriver = \"mock\"\n",
            SAMPLE
        ));
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn awg_without_period_is_rejected() {
        let file = write_config(&SAMPLE.replace("period = 100.0", ""));
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(DaqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rhk_needs_an_address() {
        let file = write_config(&format!(
            "{}\n[[instruments]]\nid = \"stm\"\ndriver = \"rhk\"\n",
            SAMPLE
        ));
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("'address' cannot be empty"));
    }

    #[test]
    fn missing_required_sweep_field_is_a_load_error() {
        let file = write_config(&SAMPLE.replace("aggregation = \"mean\"", ""));
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(DaqError::ConfigLoad(_))
        ));
    }
}
