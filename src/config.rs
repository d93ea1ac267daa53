//! Configuration System using Figment
//!
//! Strongly-typed session settings. Configuration is loaded from:
//! 1. `config/cn0503.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `CN0503_`, using `__` between nested keys
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use cn0503::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Baud rate: {}", settings.serial.baud_rate);
//! # Ok::<(), cn0503::error::Cn0503Error>(())
//! ```

use crate::error::{AppResult, Cn0503Error};
use crate::model::device::MAX_COLUMNS;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/cn0503.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialSettings,
    /// Wire protocol pacing and queue bounds
    #[serde(default)]
    pub protocol: ProtocolSettings,
    /// Streaming buffer settings
    #[serde(default)]
    pub streaming: StreamingSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Default port (e.g. "/dev/ttyUSB0", "COM4")
    #[serde(default)]
    pub port: Option<String>,
    /// Link speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout policy in milliseconds. Ports are polled at least every 100 ms
    /// regardless; this also bounds how long a send waits for queue space.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Wire protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Delay between queries of a configuration read
    #[serde(default = "default_inter_command_delay")]
    pub inter_command_delay_ms: u64,
    /// Delay between characters of a slow (character-paced) send
    #[serde(default = "default_slow_char_delay")]
    pub slow_char_delay_ms: u64,
    /// Pause after each encoded command or config-file line
    #[serde(default = "default_command_settle")]
    pub command_settle_ms: u64,
    /// Bound of the inbound line queue
    #[serde(default = "default_inbound_capacity")]
    pub inbound_queue_capacity: usize,
    /// Bound of the outbound queue
    #[serde(default = "default_outbound_capacity")]
    pub outbound_queue_capacity: usize,
    /// Maximum bytes per received line
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// Streaming buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Ring buffer bound; a full buffer holds one sample less than this per column
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,
    /// Default number of columns in CODE mode
    #[serde(default = "default_code_mode_columns")]
    pub code_mode_columns: usize,
}

// Default value functions
fn default_name() -> String {
    "CN0503".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_inter_command_delay() -> u64 {
    20
}

fn default_slow_char_delay() -> u64 {
    20
}

fn default_command_settle() -> u64 {
    50
}

fn default_inbound_capacity() -> usize {
    800
}

fn default_outbound_capacity() -> usize {
    300
}

fn default_max_line_bytes() -> usize {
    255
}

fn default_max_data_points() -> usize {
    200
}

fn default_code_mode_columns() -> usize {
    8
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            inter_command_delay_ms: default_inter_command_delay(),
            slow_char_delay_ms: default_slow_char_delay(),
            command_settle_ms: default_command_settle(),
            inbound_queue_capacity: default_inbound_capacity(),
            outbound_queue_capacity: default_outbound_capacity(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            max_data_points: default_max_data_points(),
            code_mode_columns: default_code_mode_columns(),
        }
    }
}

impl SerialSettings {
    /// Port read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ProtocolSettings {
    /// Delay between configuration queries
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    /// Delay between characters of a slow send
    pub fn slow_char_delay(&self) -> Duration {
        Duration::from_millis(self.slow_char_delay_ms)
    }

    /// Pause after each command
    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }
}

impl Settings {
    /// Load settings from `config/cn0503.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `CN0503_`.
    /// Example: `CN0503_SERIAL__BAUD_RATE=9600`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CN0503_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(Cn0503Error::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(Cn0503Error::Configuration(
                "baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.protocol.inbound_queue_capacity == 0 || self.protocol.outbound_queue_capacity == 0
        {
            return Err(Cn0503Error::Configuration(
                "Queue capacities must be greater than 0".to_string(),
            ));
        }

        if self.protocol.max_line_bytes == 0 {
            return Err(Cn0503Error::Configuration(
                "max_line_bytes must be greater than 0".to_string(),
            ));
        }

        if self.streaming.max_data_points < 2 {
            return Err(Cn0503Error::Configuration(format!(
                "Invalid max_data_points {}. Must be at least 2",
                self.streaming.max_data_points
            )));
        }

        if !(1..=MAX_COLUMNS).contains(&self.streaming.code_mode_columns) {
            return Err(Cn0503Error::Configuration(format!(
                "Invalid code_mode_columns {}. Must be 1-{}",
                self.streaming.code_mode_columns, MAX_COLUMNS
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_match_wire_contract() {
        let settings = Settings::default();
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.protocol.inter_command_delay(), Duration::from_millis(20));
        assert_eq!(settings.protocol.slow_char_delay(), Duration::from_millis(20));
        assert_eq!(settings.protocol.inbound_queue_capacity, 800);
        assert_eq!(settings.protocol.outbound_queue_capacity, 300);
        assert_eq!(settings.protocol.max_line_bytes, 255);
        assert_eq!(settings.streaming.max_data_points, 200);
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [serial]
            port = "/dev/ttyUSB1"

            [streaming]
            max_data_points = 50
            "#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.serial.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.streaming.max_data_points, 50);
        assert_eq!(settings.streaming.code_mode_columns, 8);
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("CN0503_SERIAL__BAUD_RATE", "9600");
        let result = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("CN0503_SERIAL__BAUD_RATE");

        assert_eq!(result.unwrap().serial.baud_rate, 9600);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(matches!(
            settings.validate(),
            Err(Cn0503Error::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_code_mode_columns() {
        let mut settings = Settings::default();
        settings.streaming.code_mode_columns = 17;
        assert!(settings.validate().is_err());
        settings.streaming.code_mode_columns = 0;
        assert!(settings.validate().is_err());
    }
}
