//! Data models for the printer link
//!
//! This module provides:
//! - The communication state and its derived projections
//! - The detailed printing phase reported while streaming
//! - Firmware identification
//! - Positions, movement modes and heater temperatures
//! - Print job records

pub mod job;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest number of extruders tracked per printer
pub const MAX_EXTRUDERS: usize = 16;

/// High-level state of the link to the printer
///
/// Exactly one value is live per session. Every "is connected", "is
/// printing" style query is a projection of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommunicationState {
    /// No port is open
    #[default]
    Disconnected,
    /// Port is open and the handshake is in progress
    AttemptingToConnect,
    /// The last connection attempt failed
    FailedToConnect,
    /// Handshake complete, idle
    Connected,
    /// A print was requested and its program is loading
    PreparingToPrint,
    /// Streaming a program from the host
    Printing,
    /// The printer is playing a file from its own SD card
    PrintingFromSd,
    /// A print is paused
    Paused,
    /// The last print ran to completion
    FinishedPrint,
    /// Teardown in progress
    Disconnecting,
    /// The link failed while a session was live
    ConnectionLost,
}

impl CommunicationState {
    /// Whether a session is established with the firmware
    pub fn is_connected(self) -> bool {
        match self {
            CommunicationState::Disconnected
            | CommunicationState::AttemptingToConnect
            | CommunicationState::ConnectionLost
            | CommunicationState::FailedToConnect => false,

            CommunicationState::Disconnecting
            | CommunicationState::Connected
            | CommunicationState::PreparingToPrint
            | CommunicationState::Printing
            | CommunicationState::PrintingFromSd
            | CommunicationState::Paused
            | CommunicationState::FinishedPrint => true,
        }
    }

    /// Whether lines of a print are flowing
    pub fn is_printing(self) -> bool {
        matches!(
            self,
            CommunicationState::Printing | CommunicationState::PrintingFromSd
        )
    }

    /// Whether a print is paused
    pub fn is_paused(self) -> bool {
        self == CommunicationState::Paused
    }

    /// Whether a print is underway in any form
    pub fn is_print_active(self) -> bool {
        matches!(
            self,
            CommunicationState::Printing
                | CommunicationState::PrintingFromSd
                | CommunicationState::PreparingToPrint
                | CommunicationState::Paused
        )
    }

    /// Human-readable status line
    pub fn verbose(self) -> &'static str {
        match self {
            CommunicationState::Disconnected => "Not Connected",
            CommunicationState::Disconnecting => "Disconnecting",
            CommunicationState::AttemptingToConnect => "Connecting...",
            CommunicationState::ConnectionLost => "Connection Lost",
            CommunicationState::FailedToConnect => "Unable to Connect",
            CommunicationState::Connected => "Connected",
            CommunicationState::PreparingToPrint => "Preparing To Print",
            CommunicationState::Printing => "Printing",
            CommunicationState::PrintingFromSd => "Printing From SD Card",
            CommunicationState::Paused => "Paused",
            CommunicationState::FinishedPrint => "Finished Print",
        }
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the printer is busy with while a program streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetailedPrintingState {
    /// A `G28` was sent
    HomingAxis,
    /// A blocking bed heat (`M190`) was sent
    HeatingBed,
    /// A blocking extruder heat (`M109`) was sent
    HeatingExtruder,
    /// Any other line
    #[default]
    Printing,
}

impl DetailedPrintingState {
    /// Classify the phase a line puts the printer in
    pub fn from_line(line: &str) -> Self {
        if line.starts_with("G28") {
            DetailedPrintingState::HomingAxis
        } else if line.starts_with("M190") {
            DetailedPrintingState::HeatingBed
        } else if line.starts_with("M109") {
            DetailedPrintingState::HeatingExtruder
        } else {
            DetailedPrintingState::Printing
        }
    }

    /// Status line, filled with the relevant heater target
    pub fn describe(self, target_bed: f64, target_extruder: f64) -> String {
        match self {
            DetailedPrintingState::HomingAxis => "Homing Axis".to_string(),
            DetailedPrintingState::HeatingBed => {
                format!("Waiting for Bed to Heat to {}°", target_bed)
            }
            DetailedPrintingState::HeatingExtruder => {
                format!("Waiting for Extruder to Heat to {}°", target_extruder)
            }
            DetailedPrintingState::Printing => "Currently Printing:".to_string(),
        }
    }
}

/// Firmware family announced in the `M115` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareType {
    /// Not yet identified
    #[default]
    Unknown,
    /// Repetier firmware
    Repetier,
    /// Marlin firmware
    Marlin,
    /// Sprinter firmware
    Sprinter,
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareType::Unknown => write!(f, "Unknown"),
            FirmwareType::Repetier => write!(f, "Repetier"),
            FirmwareType::Marlin => write!(f, "Marlin"),
            FirmwareType::Sprinter => write!(f, "Sprinter"),
        }
    }
}

/// Everything learned about the firmware during a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Firmware family
    pub firmware_type: FirmwareType,
    /// Reported version string
    pub version: Option<String>,
    /// Device code, when the version was reported as `code^version`
    pub device_code: Option<String>,
    /// Firmware accepts SD prints addressed by URI
    pub uri_gcode_send: bool,
}

/// Absolute or relative interpretation of coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementMode {
    /// `G90` / `M82`
    #[default]
    Absolute,
    /// `G91` / `M83`
    Relative,
}

/// Cartesian position in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
}

impl Position {
    /// Create a position from its coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The origin
    pub fn zero() -> Self {
        Self::default()
    }

    /// Component-wise sum
    pub fn offset_by(self, other: Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Actual and target temperatures for every heater
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureState {
    /// Last reported extruder temperatures, indexed by extruder
    pub actual_extruder: [f64; MAX_EXTRUDERS],
    /// Requested extruder temperatures, indexed by extruder
    pub target_extruder: [f64; MAX_EXTRUDERS],
    /// Last reported bed temperature
    pub actual_bed: f64,
    /// Requested bed temperature
    pub target_bed: f64,
}

impl Default for TemperatureState {
    fn default() -> Self {
        Self {
            actual_extruder: [0.0; MAX_EXTRUDERS],
            target_extruder: [0.0; MAX_EXTRUDERS],
            actual_bed: 0.0,
            target_bed: 0.0,
        }
    }
}

impl TemperatureState {
    /// Clamp an extruder index into the tracked range
    pub fn clamp_index(extruder: usize) -> usize {
        extruder.min(MAX_EXTRUDERS - 1)
    }

    /// Last reported temperature of an extruder
    pub fn actual_extruder(&self, extruder: usize) -> f64 {
        self.actual_extruder[Self::clamp_index(extruder)]
    }

    /// Requested temperature of an extruder
    pub fn target_extruder(&self, extruder: usize) -> f64 {
        self.target_extruder[Self::clamp_index(extruder)]
    }
}
