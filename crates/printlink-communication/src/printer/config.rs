//! Engine timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and intervals the printer link runs on
///
/// The defaults are tuned for RepRap firmware on USB serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Pause after opening the port so the board can finish booting
    pub settle_delay: Duration,
    /// How often the connection watchdog checks handshake progress
    pub watchdog_interval: Duration,
    /// Silence that, together with `ack_total_timeout`, forces a resend
    pub ack_silence_timeout: Duration,
    /// Time since the last write that, with silence, forces a resend
    pub ack_total_timeout: Duration,
    /// Ack wait after which queued lines are sent anyway
    pub queue_ack_timeout: Duration,
    /// Silence required before queued lines bypass a pending ack
    pub queue_silence_timeout: Duration,
    /// Minimum wait before an unacknowledged move is resent
    pub motion_min_wait: Duration,
    /// Multiplier on the slowest recent move's estimated time
    pub motion_safety_factor: f64,
    /// Number of recent program lines considered for motion timing
    pub motion_backlog: usize,
    /// Interval between temperature polls
    pub temperature_poll_interval: Duration,
    /// After this long an unanswered temperature poll is sent again
    pub temperature_stale_after: Duration,
    /// Minimum interval between SD progress polls
    pub sd_poll_interval: Duration,
    /// Longest the program waits for an `M114` answer
    pub position_wait_timeout: Duration,
    /// Bound on joining the reader and connect workers
    pub join_timeout: Duration,
    /// Sleep between reader passes when nothing arrived
    pub reader_idle_sleep: Duration,
    /// Interval of the session's idle ticker
    pub idle_interval: Duration,
    /// Poll heater temperatures while connected
    pub monitor_temperature: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            watchdog_interval: Duration::from_millis(100),
            ack_silence_timeout: Duration::from_secs(10),
            ack_total_timeout: Duration::from_secs(30),
            queue_ack_timeout: Duration::from_secs(30),
            queue_silence_timeout: Duration::from_secs(5),
            motion_min_wait: Duration::from_secs(5),
            motion_safety_factor: 1.5,
            motion_backlog: 16,
            temperature_poll_interval: Duration::from_secs(2),
            temperature_stale_after: Duration::from_secs(60),
            sd_poll_interval: Duration::from_secs(10),
            position_wait_timeout: Duration::from_secs(60),
            join_timeout: Duration::from_secs(5),
            reader_idle_sleep: Duration::from_millis(1),
            idle_interval: Duration::from_millis(20),
            monitor_temperature: true,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for simulated printers: no settle delay, fast ticks
    pub fn simulated() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            watchdog_interval: Duration::from_millis(5),
            idle_interval: Duration::from_millis(2),
            ..Self::default()
        }
    }
}
