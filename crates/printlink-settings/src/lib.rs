//! PrintLink Settings Crate
//!
//! Handles the configuration file: connection defaults, printer macros,
//! engine timing, and the named settings the engine reads through
//! [`printlink_core::SettingsSource`].

pub mod config;
pub mod error;

pub use config::{
    default_config_path, Config, ConfigFormat, ConnectionSettings, GcodeSettings, PrinterSettings,
    TimingSettings,
};
pub use error::{SettingsError, SettingsResult};
