//! Engine configuration
//!
//! One explicit struct passed into constructors; no global lookups.
//! Loaded from a TOML file by the binary and validated once at
//! construction; an invalid configuration prevents the engine from
//! starting at all.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::constants::{CONTROL_PORT_OFFSET, DEFAULT_WATERMARK_PACKETS};
use crate::error::Error;
use crate::pacing::PacingStrategy;
use crate::regulate::DecibelTargets;

fn default_watermark() -> i32 {
    DEFAULT_WATERMARK_PACKETS
}

fn default_pacing() -> PacingStrategy {
    PacingStrategy::Stable
}

/// Complete startup configuration for one engine instance
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// DAC hostname or address
    pub dac_host: String,

    /// UDP port the DAC accepts data frames on; the control port is
    /// this plus 100
    pub data_port: u16,

    /// Transmitter channels this instance addresses (ids 0..32)
    pub transmitters: BTreeSet<u8>,

    /// Decibel targets for regulation, per chunk class
    #[serde(default)]
    pub decibel_targets: DecibelTargets,

    /// Identifier of the audio input source, reported to the supervisor
    pub input_source: String,

    /// Loopback TCP port of the supervising comms manager; `None` runs
    /// without supervision (maintenance sessions)
    #[serde(default)]
    pub supervisor_port: Option<u16>,

    /// Pacing strategy; see the pacing module for the trade-off
    #[serde(default = "default_pacing")]
    pub pacing: PacingStrategy,

    /// Target jitter-buffer depth in packets
    #[serde(default = "default_watermark")]
    pub watermark_packets: i32,
}

impl EngineConfig {
    /// Control port derived from the data port
    pub fn control_port(&self) -> u16 {
        self.data_port + CONTROL_PORT_OFFSET
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.dac_host.trim().is_empty() {
            return Err(Error::Config("dac_host must not be empty".into()));
        }
        if self.data_port == 0 {
            return Err(Error::Config("data_port must not be 0".into()));
        }
        if self.data_port.checked_add(CONTROL_PORT_OFFSET).is_none() {
            return Err(Error::Config(format!(
                "data_port {} leaves no room for the control port offset",
                self.data_port
            )));
        }
        if self.transmitters.is_empty() {
            return Err(Error::Config("at least one transmitter is required".into()));
        }
        if let Some(&ch) = self.transmitters.iter().find(|&&ch| ch >= 32) {
            return Err(Error::Config(format!("transmitter id {ch} out of range (0..32)")));
        }
        if self.watermark_packets <= 0 {
            return Err(Error::Config("watermark_packets must be positive".into()));
        }
        if self.supervisor_port == Some(0) {
            return Err(Error::Config("supervisor_port must not be 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            dac_host: "10.0.0.40".into(),
            data_port: 2000,
            transmitters: BTreeSet::from([0, 1]),
            decibel_targets: DecibelTargets::default(),
            input_source: "playlist-a".into(),
            supervisor_port: Some(9300),
            pacing: PacingStrategy::Stable,
            watermark_packets: 25,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().control_port(), 2100);
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut c = valid();
        c.dac_host = " ".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.data_port = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.data_port = u16::MAX - 10;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.transmitters.clear();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.transmitters.insert(32);
        assert!(c.validate().is_err());

        let mut c = valid();
        c.watermark_packets = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_toml_defaults() {
        let raw = r#"
            dac_host = "dac.local"
            data_port = 4000
            transmitters = [2]
            input_source = "suite-7"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pacing, PacingStrategy::Stable);
        assert_eq!(config.watermark_packets, DEFAULT_WATERMARK_PACKETS);
        assert!(config.supervisor_port.is_none());
    }

    #[test]
    fn test_toml_pacing_selection() {
        let raw = r#"
            dac_host = "dac.local"
            data_port = 4000
            transmitters = [2]
            input_source = "suite-7"
            pacing = "aggressive"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pacing, PacingStrategy::Aggressive);
    }
}
