//! Event type definitions for the event bus.
//!
//! This module defines every notification the printer link emits,
//! organized by category. Events are cloneable and serializable so they
//! can be logged or replayed.

use serde::{Deserialize, Serialize};

use crate::data::{CommunicationState, DetailedPrintingState, FirmwareType, Position};

/// Root event enum for all printer link events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// Session lifecycle events
    Connection(ConnectionEvent),
    /// Heater, fan and motion state
    Machine(MachineEvent),
    /// Raw and filtered line traffic
    Communication(CommunicationEvent),
    /// Print job lifecycle
    Job(JobEvent),
    /// Error and diagnostic events
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Communication(_) => EventCategory::Communication,
            AppEvent::Job(_) => EventCategory::Job,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Communication(e) => e.description(),
            AppEvent::Job(e) => e.description(),
            AppEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Session lifecycle events.
    Connection,
    /// Heater, fan and motion events.
    Machine,
    /// Line traffic events.
    Communication,
    /// Print job events.
    Job,
    /// Error and diagnostic events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Communication => write!(f, "Communication"),
            EventCategory::Job => write!(f, "Job"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Session lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The communication state changed. Fired after all bookkeeping for
    /// the new state is done.
    StateChanged {
        /// State before the transition.
        previous: CommunicationState,
        /// State after the transition.
        current: CommunicationState,
    },
    /// Handshake completed.
    ConnectionSucceeded {
        /// Port the session runs on.
        port: String,
    },
    /// Connection attempt failed or the session was torn down.
    ConnectionFailed {
        /// Port of the failed session, if one was chosen.
        port: Option<String>,
        /// Short human-readable reason.
        reason: String,
    },
    /// Firmware identification changed.
    FirmwareVersionRead {
        /// Firmware family.
        firmware: FirmwareType,
        /// Reported version.
        version: String,
    },
    /// ATX power supply was switched.
    AtxPowerChanged {
        /// Whether the supply is now on.
        on: bool,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::StateChanged { previous, current } => {
                format!("Communication state: {} -> {}", previous, current)
            }
            ConnectionEvent::ConnectionSucceeded { port } => format!("Connected to {}", port),
            ConnectionEvent::ConnectionFailed { port, reason } => match port {
                Some(port) => format!("Connection to {} failed: {}", port, reason),
                None => format!("Connection failed: {}", reason),
            },
            ConnectionEvent::FirmwareVersionRead { firmware, version } => {
                format!("Firmware {} {}", firmware, version)
            }
            ConnectionEvent::AtxPowerChanged { on } => {
                format!("ATX power {}", if *on { "on" } else { "off" })
            }
        }
    }
}

/// Heater, fan and motion events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineEvent {
    /// An extruder temperature report changed.
    ExtruderTemperatureRead {
        /// Extruder index.
        extruder: usize,
        /// Reported temperature in °C.
        celsius: f64,
    },
    /// An extruder target was set.
    ExtruderTemperatureSet {
        /// Extruder index.
        extruder: usize,
        /// Target temperature in °C.
        celsius: f64,
    },
    /// The bed temperature report changed.
    BedTemperatureRead {
        /// Reported temperature in °C.
        celsius: f64,
    },
    /// The bed target was set.
    BedTemperatureSet {
        /// Target temperature in °C.
        celsius: f64,
    },
    /// Part cooling fan speed was set.
    FanSpeedSet {
        /// Speed, 0 to 255.
        speed: u8,
    },
    /// The firmware reported its position.
    PositionRead {
        /// Reported position.
        position: Position,
    },
    /// The commanded destination moved.
    DestinationChanged {
        /// New destination.
        destination: Position,
    },
    /// The detailed printing phase changed.
    PrintingStateChanged {
        /// New phase.
        state: DetailedPrintingState,
    },
}

impl MachineEvent {
    fn description(&self) -> String {
        match self {
            MachineEvent::ExtruderTemperatureRead { extruder, celsius } => {
                format!("Extruder {} at {:.1}°C", extruder, celsius)
            }
            MachineEvent::ExtruderTemperatureSet { extruder, celsius } => {
                format!("Extruder {} target {:.1}°C", extruder, celsius)
            }
            MachineEvent::BedTemperatureRead { celsius } => format!("Bed at {:.1}°C", celsius),
            MachineEvent::BedTemperatureSet { celsius } => format!("Bed target {:.1}°C", celsius),
            MachineEvent::FanSpeedSet { speed } => format!("Fan speed {}", speed),
            MachineEvent::PositionRead { position } => format!("Position {}", position),
            MachineEvent::DestinationChanged { destination } => {
                format!("Destination {}", destination)
            }
            MachineEvent::PrintingStateChanged { state } => format!("Printing state {:?}", state),
        }
    }
}

/// Line traffic events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommunicationEvent {
    /// Every line read from the printer, before any filtering.
    RawLineReceived {
        /// The line, tagged with elapsed print time while printing.
        line: String,
    },
    /// Every line written to the printer, exactly as framed.
    RawLineSent {
        /// The line, tagged with elapsed print time while printing.
        line: String,
    },
    /// A received line no handler suppressed.
    LineReceived {
        /// The line.
        line: String,
    },
    /// A written line no handler suppressed.
    LineSent {
        /// The line without framing.
        line: String,
    },
}

impl CommunicationEvent {
    fn description(&self) -> String {
        match self {
            CommunicationEvent::RawLineReceived { line } => format!("<< {}", line.trim_end()),
            CommunicationEvent::RawLineSent { line } => format!(">> {}", line.trim_end()),
            CommunicationEvent::LineReceived { line } => format!("Received: {}", line),
            CommunicationEvent::LineSent { line } => format!("Sent: {}", line),
        }
    }
}

/// Print job lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// A print started streaming.
    PrintStarted {
        /// Display name of the job.
        name: String,
    },
    /// A print ran to completion. Fires once per job.
    PrintFinished {
        /// Display name of the job, if one was recorded.
        name: Option<String>,
    },
    /// A print was canceled.
    PrintCanceled {
        /// Display name of the job, if one was recorded.
        name: Option<String>,
    },
    /// The firmware confirmed an SD card file deletion.
    SdFileDeleted,
}

impl JobEvent {
    fn description(&self) -> String {
        match self {
            JobEvent::PrintStarted { name } => format!("Print started: {}", name),
            JobEvent::PrintFinished { name } => {
                format!("Print finished: {}", name.as_deref().unwrap_or("(unnamed)"))
            }
            JobEvent::PrintCanceled { name } => {
                format!("Print canceled: {}", name.as_deref().unwrap_or("(unnamed)"))
            }
            JobEvent::SdFileDeleted => "SD file deleted".to_string(),
        }
    }
}

/// Recoverable trouble; the engine keeps running after each of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// No acknowledgement arrived in time, so the last line was resent.
    AckTimeout {
        /// How long the writer waited, in milliseconds.
        waited_ms: u64,
    },
    /// The printer asked for a line the ledger no longer holds.
    ProtocolDesync {
        /// Line number the printer asked for.
        requested: usize,
        /// Oldest line number still held; resending restarts here.
        oldest_retained: usize,
    },
    /// A job record could not be written. The print carries on.
    JobRecordFailed {
        /// Why the store refused it.
        reason: String,
    },
}

impl ErrorEvent {
    fn description(&self) -> String {
        match self {
            ErrorEvent::AckTimeout { waited_ms } => {
                format!("No ok after {} ms, resent last line", waited_ms)
            }
            ErrorEvent::ProtocolDesync {
                requested,
                oldest_retained,
            } => format!(
                "Resend of line {} not possible, resuming from {}",
                requested, oldest_retained
            ),
            ErrorEvent::JobRecordFailed { reason } => {
                format!("Job history not saved: {}", reason)
            }
        }
    }
}
