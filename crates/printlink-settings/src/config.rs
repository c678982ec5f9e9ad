//! Configuration file handling for PrintLink
//!
//! Configuration is organized into sections:
//! - Connection defaults (port, baud rate, handshake timeout)
//! - Printer identity and macro variables
//! - G-code snippets injected on connect, pause, resume and cancel
//! - Engine timing
//!
//! Files are JSON or TOML, picked by extension. Every section and field
//! has a default, so partial files load.

use crate::error::{SettingsError, SettingsResult};
use printlink_core::settings::{keys, replace_bracketed};
use printlink_core::SettingsSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// On-disk format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> SettingsResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Self::Json),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Self::Toml),
            other => Err(SettingsError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Connection defaults used when the command line does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Last used serial port, `None` to pick the first one found
    pub port: Option<String>,
    /// Baud rate for the serial link
    pub baud_rate: u32,
    /// How long to wait for the handshake in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 250_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Printer identity and the values available to `[name]` macros
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterSettings {
    pub name: String,
    /// Poll heater temperatures while connected
    pub monitor_temperature: bool,
    /// Extra named values, e.g. `temperature = "205"` for `M109 S[temperature]`
    pub variables: BTreeMap<String, String>,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            name: "Printer".to_string(),
            monitor_temperature: true,
            variables: BTreeMap::new(),
        }
    }
}

/// G-code snippets the engine injects at lifecycle points
///
/// Multi-line snippets may use real newlines or the two characters `\n`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcodeSettings {
    pub connect_gcode: String,
    pub pause_gcode: String,
    pub resume_gcode: String,
    pub cancel_gcode: String,
}

impl GcodeSettings {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            keys::CONNECT_GCODE => Some(&self.connect_gcode),
            keys::PAUSE_GCODE => Some(&self.pause_gcode),
            keys::RESUME_GCODE => Some(&self.resume_gcode),
            keys::CANCEL_GCODE => Some(&self.cancel_gcode),
            _ => None,
        }
    }
}

/// Engine timing in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Pause after opening the port while the board boots
    pub settle_delay_ms: u64,
    /// Silence before an unacknowledged line is resent
    pub ack_silence_timeout_ms: u64,
    /// Time since the last write before an unacknowledged line is resent
    pub ack_total_timeout_ms: u64,
    pub queue_ack_timeout_ms: u64,
    pub queue_silence_timeout_ms: u64,
    pub motion_min_wait_ms: u64,
    pub motion_safety_factor: f64,
    pub motion_backlog: usize,
    pub temperature_poll_interval_ms: u64,
    pub sd_poll_interval_ms: u64,
    pub idle_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            ack_silence_timeout_ms: 10_000,
            ack_total_timeout_ms: 30_000,
            queue_ack_timeout_ms: 30_000,
            queue_silence_timeout_ms: 5_000,
            motion_min_wait_ms: 5_000,
            motion_safety_factor: 1.5,
            motion_backlog: 16,
            temperature_poll_interval_ms: 2_000,
            sd_poll_interval_ms: 10_000,
            idle_interval_ms: 20,
        }
    }
}

/// Complete PrintLink configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub printer: PrinterSettings,
    pub gcode: GcodeSettings,
    pub timing: TimingSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from a `.json` or `.toml` file
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)?;

        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str(&content)?,
            ConfigFormat::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to a `.json` or `.toml` file, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        let format = ConfigFormat::from_path(path)?;

        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "connection.connect_timeout_ms",
                "must be > 0",
            ));
        }

        if matches!(&self.connection.port, Some(port) if port.trim().is_empty()) {
            return Err(SettingsError::invalid("connection.port", "must not be blank"));
        }

        let timing = &self.timing;
        let nonzero = [
            ("timing.ack_silence_timeout_ms", timing.ack_silence_timeout_ms),
            ("timing.ack_total_timeout_ms", timing.ack_total_timeout_ms),
            ("timing.queue_ack_timeout_ms", timing.queue_ack_timeout_ms),
            ("timing.temperature_poll_interval_ms", timing.temperature_poll_interval_ms),
            ("timing.idle_interval_ms", timing.idle_interval_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::invalid(*key, "must be > 0"));
        }

        if timing.ack_silence_timeout_ms > timing.ack_total_timeout_ms {
            return Err(SettingsError::invalid(
                "timing.ack_silence_timeout_ms",
                "must not exceed ack_total_timeout_ms",
            ));
        }

        if timing.motion_safety_factor.is_nan() || timing.motion_safety_factor < 1.0 {
            return Err(SettingsError::invalid(
                "timing.motion_safety_factor",
                "must be >= 1.0",
            ));
        }

        if timing.motion_backlog == 0 {
            return Err(SettingsError::invalid("timing.motion_backlog", "must be > 0"));
        }

        if let Some(name) = self
            .printer
            .variables
            .keys()
            .find(|name| name.is_empty() || name.contains(['[', ']']))
        {
            return Err(SettingsError::invalid(
                format!("printer.variables.{}", name),
                "names must be non-empty and free of brackets",
            ));
        }

        Ok(())
    }

    /// Set a named value: one of the G-code snippets, or a macro variable
    pub fn set_value(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match key {
            keys::CONNECT_GCODE => self.gcode.connect_gcode = value,
            keys::PAUSE_GCODE => self.gcode.pause_gcode = value,
            keys::RESUME_GCODE => self.gcode.resume_gcode = value,
            keys::CANCEL_GCODE => self.gcode.cancel_gcode = value,
            _ => {
                self.printer.variables.insert(key.to_string(), value);
            }
        }
    }
}

impl SettingsSource for Config {
    fn value(&self, key: &str) -> Option<String> {
        match self.gcode.get(key) {
            Some(snippet) => Some(snippet.to_string()).filter(|s| !s.is_empty()),
            None => self.printer.variables.get(key).cloned(),
        }
    }

    fn replace_macro_values(&self, gcode: &str) -> String {
        replace_bracketed(gcode, |name| self.printer.variables.get(name).cloned())
    }
}

/// Default location of the configuration file, `<config dir>/printlink/config.toml`
pub fn default_config_path() -> SettingsResult<PathBuf> {
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| SettingsError::ConfigDirectory("no config or home directory".into()))?;
    Ok(base.join("printlink").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 250_000);
        assert_eq!(config.timing.ack_total_timeout_ms, 30_000);
        assert!(config.printer.monitor_temperature);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/b.json")).ok(),
            Some(ConfigFormat::Json)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("b.TOML")).ok(),
            Some(ConfigFormat::Toml)
        );
        assert!(matches!(
            ConfigFormat::from_path(Path::new("b.yaml")),
            Err(SettingsError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
        assert!(ConfigFormat::from_path(Path::new("config")).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::new();
        config.connection.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.timing.ack_silence_timeout_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.timing.motion_safety_factor = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.connection.port = Some("  ".into());
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.set_value("bad]name", "1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_source_lookup() {
        let mut config = Config::new();
        config.set_value(keys::CANCEL_GCODE, "M104 S0\\nM140 S0");
        config.set_value("temperature", "205");

        assert_eq!(
            config.value(keys::CANCEL_GCODE).as_deref(),
            Some("M104 S0\\nM140 S0")
        );
        assert_eq!(config.value(keys::PAUSE_GCODE), None);
        assert_eq!(config.value("temperature").as_deref(), Some("205"));
        assert_eq!(config.value("missing"), None);
    }

    #[test]
    fn test_macro_values_use_variables() {
        let mut config = Config::new();
        config.set_value("temperature", "205");
        config.set_value(keys::PAUSE_GCODE, "G91");

        assert_eq!(config.replace_macro_values("M109 S[temperature]"), "M109 S205");
        // snippets are not variables
        assert_eq!(
            config.replace_macro_values("[pause_gcode]"),
            "[pause_gcode]"
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyACM0"

            [gcode]
            cancel_gcode = "M104 S0"
            "#,
        )
        .expect("parse");
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud_rate, 250_000);
        assert_eq!(config.gcode.cancel_gcode, "M104 S0");
        assert_eq!(config.timing, TimingSettings::default());
    }

    #[test]
    fn test_default_path_is_under_printlink() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("printlink/config.toml"));
        }
    }
}
