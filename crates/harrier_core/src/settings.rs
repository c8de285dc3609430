use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BAUDS: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];
const BITS: [u8; 4] = [5, 6, 7, 8];
const PARITIES: [&str; 3] = ["N", "E", "O"];
const STOPS: [f32; 2] = [1.0, 2.0];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {} not found", .0.display())]
    Missing(PathBuf),
    #[error("configuration error: {0}")]
    Invalid(String),
}

/// GPS serial port parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_bits")]
    pub bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stops")]
    pub stops: f32,
}

fn default_baud() -> u32 {
    4800
}

fn default_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stops() -> f32 {
    1.0
}

/// On-disk configuration (`~/harrier.conf`).
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub receiver: ReceiverSection,
    pub gps: GpsConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanSection {
    /// Automatic scan delay (seconds); absent means remote-triggered only.
    pub delay: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReceiverSection {
    /// SDR device index.
    pub index: Option<u32>,
    /// Tuner gain (dB).
    pub gain: Option<f64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::Missing(path.to_path_buf()))?;
        let config: ConfigFile =
            toml::from_str(&text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.gps.validate()?;
        Ok(config)
    }
}

impl GpsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !BAUDS.contains(&self.baud) {
            return Err(ConfigError::Invalid(format!(
                "baud \"{}\" is not one of {:?}",
                self.baud, BAUDS
            )));
        }
        if !BITS.contains(&self.bits) {
            return Err(ConfigError::Invalid(format!(
                "bits \"{}\" is not one of {:?}",
                self.bits, BITS
            )));
        }
        if !PARITIES.contains(&self.parity.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "parity \"{}\" is not one of {:?}",
                self.parity, PARITIES
            )));
        }
        if !STOPS.contains(&self.stops) {
            return Err(ConfigError::Invalid(format!(
                "stops \"{}\" is not one of {:?}",
                self.stops, STOPS
            )));
        }
        Ok(())
    }
}

/// Runtime settings.
///
/// Shared read-only across threads; only the orchestrator writes, in
/// response to remote `set` commands.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database file.
    pub file: PathBuf,
    /// Centre frequency (MHz).
    pub freq: f64,
    /// Tuner gain (dB); None leaves the tuner in automatic.
    pub gain: Option<f64>,
    /// Automatic scan delay (seconds); None means remote-triggered only.
    pub delay: Option<f64>,
    /// Survey name grouping this session's captures.
    pub survey: String,
    /// SDR device index.
    pub recv_index: u32,
    pub gps: GpsConfig,
    pub test: bool,
}

impl Settings {
    /// The payload for the remote viewer's `settings` reply.
    pub fn payload(&self) -> SettingsPayload {
        SettingsPayload {
            frequency: self.freq,
            gain: self.gain,
            delay: self.delay,
            survey: self.survey.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsPayload {
    pub frequency: f64,
    pub gain: Option<f64>,
    pub delay: Option<f64>,
    pub survey: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ConfigFile = toml::from_str("[gps]\nport = \"/dev/ttyUSB0\"\n").unwrap();
        config.gps.validate().unwrap();
        assert_eq!(config.gps.baud, 4800);
        assert_eq!(config.gps.bits, 8);
        assert_eq!(config.gps.parity, "N");
        assert_eq!(config.gps.stops, 1.0);
        assert!(config.scan.delay.is_none());
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            [scan]
            delay = 30.0

            [receiver]
            index = 0
            gain = 19.7

            [gps]
            port = "/dev/ttyAMA0"
            baud = 9600
        "#;
        let config: ConfigFile = toml::from_str(text).unwrap();
        assert_eq!(config.scan.delay, Some(30.0));
        assert_eq!(config.receiver.gain, Some(19.7));
        assert_eq!(config.gps.baud, 9600);
    }

    #[test]
    fn invalid_baud_is_rejected() {
        let config: ConfigFile =
            toml::from_str("[gps]\nport = \"/dev/ttyUSB0\"\nbaud = 1234\n").unwrap();
        assert!(config.gps.validate().is_err());
    }

    #[test]
    fn missing_file_is_distinguished_from_invalid() {
        let error = ConfigFile::load(Path::new("/nonexistent/harrier.conf")).unwrap_err();
        assert!(matches!(error, ConfigError::Missing(_)));
    }
}
