//! # PrintLink
//!
//! Streams G-code to RepRap-style FDM printers over a serial line.
//!
//! ## Architecture
//!
//! PrintLink is organized as a workspace with multiple crates:
//!
//! 1. **printlink-core** - Errors, events, printer data model, clock
//! 2. **printlink-communication** - Transport, line protocol, streaming engine
//! 3. **printlink-settings** - Configuration file and named settings
//! 4. **printlink** - Command line sender that wires the crates together

use anyhow::Context;
use printlink_communication::{
    list_ports, ConnectionConfig, JsonJobStore, PrintSession, PrinterConnection,
};
use printlink_settings::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use printlink_communication as communication;
pub use printlink_core as core;
pub use printlink_settings as settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Version plus build date, shown by `--version`
pub const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")");

/// Initialize logging with the default configuration
///
/// Honours `RUST_LOG`; `info` when unset. Output goes to stderr so the
/// printer's replies on stdout stay clean.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Engine timing derived from the configuration file
pub fn connection_config(config: &Config) -> ConnectionConfig {
    let timing = &config.timing;
    let ms = Duration::from_millis;
    ConnectionConfig {
        settle_delay: ms(timing.settle_delay_ms),
        ack_silence_timeout: ms(timing.ack_silence_timeout_ms),
        ack_total_timeout: ms(timing.ack_total_timeout_ms),
        queue_ack_timeout: ms(timing.queue_ack_timeout_ms),
        queue_silence_timeout: ms(timing.queue_silence_timeout_ms),
        motion_min_wait: ms(timing.motion_min_wait_ms),
        motion_safety_factor: timing.motion_safety_factor,
        motion_backlog: timing.motion_backlog,
        temperature_poll_interval: ms(timing.temperature_poll_interval_ms),
        sd_poll_interval: ms(timing.sd_poll_interval_ms),
        idle_interval: ms(timing.idle_interval_ms),
        monitor_temperature: config.printer.monitor_temperature,
        ..ConnectionConfig::default()
    }
}

/// Where finished and canceled jobs are recorded, next to the config file
pub fn job_history_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name("jobs.json")
}

/// Build a serial session from `config`, recording jobs at `history`
pub fn build_session(config: Config, history: PathBuf) -> PrintSession {
    let builder = PrinterConnection::builder()
        .config(connection_config(&config))
        .settings(Arc::new(config))
        .job_store(Arc::new(JsonJobStore::new(history)));
    PrintSession::build(builder)
}

/// Port to use: the explicit one, then the configured one, then the first one found
pub fn resolve_port(explicit: Option<&str>, config: &Config) -> anyhow::Result<String> {
    if let Some(port) = explicit.or(config.connection.port.as_deref()) {
        return Ok(port.to_string());
    }
    let ports = list_ports()?;
    ports
        .into_iter()
        .next()
        .map(|info| info.port_name)
        .context("No printer port found; pass --port")
}
