//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/probe.toml` (base configuration)
//! 2. Environment variables prefixed with `PROBE_DAQ_`, nested keys separated
//!    by `__` (e.g. `PROBE_DAQ_SERIAL__PORT=/dev/ttyUSB1`)
//!
//! # Example
//! ```no_run
//! use probe_daq::config::ProbeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProbeConfig::load()?;
//! config.validate()?;
//! println!("Polling {} parameters on {}", config.parameters.len(), config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::SchedulerSettings;
use crate::error::{AppResult, ProbeError};
use crate::protocol::{Dialect, CHANNELS_PER_BOX};
use crate::registry::{ParameterBinding, ParameterRegistry};
use crate::transport::SerialTransport;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/probe.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial line settings
    pub serial: SerialConfig,
    /// Reply dialect of the deployed box firmware
    #[serde(default)]
    pub protocol: Dialect,
    /// Polling timing and bounded-mode target
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Parameter bindings
    #[serde(default)]
    pub parameters: Vec<ParameterBinding>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Serial line configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port: String,
    /// Baud rate (8N1, no flow control)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Write timeout in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Per-box reply timeout in milliseconds
    #[serde(default = "default_box_timeout")]
    pub box_timeout_ms: u64,
    /// Pause between ticks in milliseconds
    #[serde(default = "default_inter_tick_delay")]
    pub inter_tick_delay_ms: u64,
    /// Samples per parameter in bounded mode
    #[serde(default = "default_target_count")]
    pub target_count: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            box_timeout_ms: default_box_timeout(),
            inter_tick_delay_ms: default_inter_tick_delay(),
            target_count: default_target_count(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "probe-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_write_timeout() -> u64 {
    100
}

fn default_box_timeout() -> u64 {
    90
}

fn default_inter_tick_delay() -> u64 {
    60
}

fn default_target_count() -> usize {
    10
}

impl ProbeConfig {
    /// Load configuration from `config/probe.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBE_DAQ_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ProbeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ProbeError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.serial.port.trim().is_empty() {
            return Err(ProbeError::Configuration(
                "serial.port must not be empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ProbeError::Configuration(
                "serial.baud_rate must be positive".to_string(),
            ));
        }

        if self.acquisition.box_timeout_ms == 0 {
            return Err(ProbeError::Configuration(
                "acquisition.box_timeout_ms must be positive".to_string(),
            ));
        }
        if self.acquisition.target_count == 0 {
            return Err(ProbeError::Configuration(
                "acquisition.target_count must be at least 1".to_string(),
            ));
        }

        if let Dialect::FixedOffset {
            offsets,
            field_width,
        } = &self.protocol
        {
            if *field_width == 0 || offsets.iter().any(|&o| o == 0) {
                return Err(ProbeError::Configuration(format!(
                    "Fixed-offset layout needs {} one-indexed offsets and a positive field width",
                    CHANNELS_PER_BOX
                )));
            }
        }

        // Duplicate names, empty channel lists and inverted limits
        self.registry().map(|_| ())
    }

    /// Build the parameter registry from `parameters`.
    pub fn registry(&self) -> AppResult<ParameterRegistry> {
        ParameterRegistry::new(self.parameters.clone())
    }

    /// Scheduler timing and dialect.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings::new(self.protocol.clone())
            .with_box_timeout(Duration::from_millis(self.acquisition.box_timeout_ms))
            .with_inter_tick_delay(Duration::from_millis(self.acquisition.inter_tick_delay_ms))
    }

    /// Unopened transport for the configured serial line.
    pub fn serial_transport(&self) -> SerialTransport {
        SerialTransport::new(&self.serial.port, self.serial.baud_rate)
            .with_write_timeout(Duration::from_millis(self.serial.write_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "line-3 gauge"
log_level = "debug"

[serial]
port = "/dev/ttyUSB0"
baud_rate = 19200

[protocol]
kind = "tagged"

[acquisition]
box_timeout_ms = 150
inter_tick_delay_ms = 8
target_count = 5

[[parameters]]
name = "bore"
box = 1
channels = [1]
lower = -0.05
upper = 0.05

[[parameters]]
name = "flatness"
box = 2
channels = [1, 2, 3]
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = ProbeConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "line-3 gauge");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.write_timeout_ms, 100);
        assert_eq!(config.protocol, Dialect::Tagged);
        assert_eq!(config.parameters.len(), 2);
        config.validate().unwrap();

        let settings = config.scheduler_settings();
        assert_eq!(settings.box_timeout, Duration::from_millis(150));
        assert_eq!(settings.inter_tick_delay, Duration::from_millis(8));

        let registry = config.registry().unwrap();
        assert_eq!(registry.all_boxes().len(), 2);
        assert_eq!(config.serial_transport().baud_rate(), 19200);
    }

    #[test]
    fn test_defaults_for_minimal_file() {
        let file = write_config("[serial]\nport = \"COM3\"\n");
        let config = ProbeConfig::load_from(file.path()).unwrap();

        assert_eq!(config.protocol, Dialect::fixed_offset());
        assert_eq!(config.acquisition.box_timeout_ms, 90);
        assert_eq!(config.acquisition.inter_tick_delay_ms, 60);
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.parameters.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_fixed_offset_layout_from_file() {
        let file = write_config(
            "[serial]\nport = \"COM3\"\n[protocol]\nkind = \"fixed_offset\"\noffsets = [1, 9, 17, 25]\n",
        );
        let config = ProbeConfig::load_from(file.path()).unwrap();
        assert_eq!(
            config.protocol,
            Dialect::FixedOffset {
                offsets: [1, 9, 17, 25],
                field_width: 8,
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let file = write_config(SAMPLE);
        let base = ProbeConfig::load_from(file.path()).unwrap();

        let mut config = base.clone();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ProbeError::Configuration(_))));

        let mut config = base.clone();
        config.acquisition.target_count = 0;
        assert!(matches!(config.validate(), Err(ProbeError::Configuration(_))));

        let mut config = base.clone();
        config.parameters.push(config.parameters[0].clone());
        assert!(matches!(config.validate(), Err(ProbeError::Configuration(_))));

        let mut config = base;
        config.protocol = Dialect::FixedOffset {
            offsets: [0, 16, 28, 40],
            field_width: 8,
        };
        assert!(matches!(config.validate(), Err(ProbeError::Configuration(_))));
    }

    #[test]
    fn test_missing_serial_section_fails() {
        let file = write_config("[application]\nname = \"x\"\n");
        assert!(ProbeConfig::load_from(file.path()).is_err());
    }
}
