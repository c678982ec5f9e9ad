//! Error handling for PrintLink
//!
//! Provides error types for each layer of the printer link:
//! - Connection errors (port discovery, handshake, link loss)
//! - Protocol errors (resend bookkeeping, acknowledgement timeouts)
//! - Job errors (program loading, job record persistence)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Terminal failures of a connection attempt or of a live session.
/// The `Display` text doubles as the short reason surfaced through
/// `connection_failure_message`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Named port is not enumerable or is already open elsewhere
    #[error("{port} {reason}")]
    PortUnavailable {
        /// The name of the port that was requested.
        port: String,
        /// Why the port cannot be used.
        reason: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Baud rate not supported
    #[error("Unsupported Baud Rate {baud}")]
    UnsupportedBaudRate {
        /// The unsupported baud rate.
        baud: u32,
    },

    /// The printer answered the handshake with undecodable data
    #[error("Invalid printer response")]
    InvalidResponse {
        /// The port the garbage was read from.
        port: String,
    },

    /// The handshake ended without a session
    #[error("{reason}")]
    HandshakeFailed {
        /// The port the handshake ran on.
        port: String,
        /// The failure reported by the connection.
        reason: String,
    },

    /// I/O failure on an established link
    #[error("Connection Lost - {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// The connection attempt was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// An operation required a connected printer
    #[error("Printer not connected")]
    NotConnected,

    /// Connect was requested while a session is live
    #[error("You can only connect when not currently connected")]
    AlreadyConnected,
}

impl ConnectionError {
    /// Port missing from the enumerated port list
    pub fn port_not_found(port: impl Into<String>) -> Self {
        ConnectionError::PortUnavailable {
            port: port.into(),
            reason: "not found".to_string(),
        }
    }

    /// Port held open by another process or session
    pub fn port_in_use(port: impl Into<String>) -> Self {
        ConnectionError::PortUnavailable {
            port: port.into(),
            reason: "in use".to_string(),
        }
    }
}

/// Protocol error type
///
/// Soft protocol faults. These are logged and recovered from by the
/// writer pipeline, they never tear a session down.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Firmware asked for a line the resend ledger no longer holds
    #[error("Resend of line {requested} requested but oldest retained line is {oldest_retained}")]
    ProtocolDesync {
        /// The line number the firmware asked for.
        requested: usize,
        /// The oldest line number still held by the ledger.
        oldest_retained: usize,
    },

    /// Firmware asked for a line that was never sent
    #[error("Resend of line {requested} requested but last line sent is {last_sent}")]
    ResendAhead {
        /// The line number the firmware asked for.
        requested: usize,
        /// The newest line number sent.
        last_sent: usize,
    },

    /// No acknowledgement arrived in time
    #[error("No acknowledgement after {waited_ms}ms")]
    AckTimeout {
        /// How long the writer waited, in milliseconds.
        waited_ms: u64,
    },

    /// A status report could not be parsed
    #[error("Malformed status line: {line}")]
    MalformedStatus {
        /// The offending line.
        line: String,
    },
}

/// Job error type
///
/// Failures around print job sequencing and bookkeeping.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Persisting a job record failed
    #[error("Failed to commit print job record: {reason}")]
    JobRecordCommitFailure {
        /// The reason the commit failed.
        reason: String,
    },

    /// The program to print could not be loaded
    #[error("No program loaded: {reason}")]
    NoProgramLoaded {
        /// The reason loading failed.
        reason: String,
    },

    /// The printer is not in a state that can start a print
    #[error("Cannot start a print while {state}")]
    NotReady {
        /// The current state name.
        state: String,
    },
}

/// Main error type for PrintLink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Job error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a job error
    pub fn is_job_error(&self) -> bool {
        matches!(self, Error::Job(_))
    }

    /// Check if this error ends a connection attempt or session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_unavailable_messages() {
        let missing = ConnectionError::port_not_found("/dev/ttyUSB0");
        assert_eq!(missing.to_string(), "/dev/ttyUSB0 not found");

        let busy = ConnectionError::port_in_use("COM3");
        assert_eq!(busy.to_string(), "COM3 in use");
    }

    #[test]
    fn test_failure_reason_strings() {
        let invalid = ConnectionError::InvalidResponse {
            port: "COM3".to_string(),
        };
        assert_eq!(invalid.to_string(), "Invalid printer response");
        assert_eq!(ConnectionError::Cancelled.to_string(), "Cancelled");

        let lost = ConnectionError::ConnectionLost {
            reason: "device removed".to_string(),
        };
        assert_eq!(lost.to_string(), "Connection Lost - device removed");
    }

    #[test]
    fn test_error_classification() {
        let err: Error = ConnectionError::NotConnected.into();
        assert!(err.is_connection_error());
        assert!(err.is_terminal());

        let err: Error = ProtocolError::AckTimeout { waited_ms: 31_000 }.into();
        assert!(err.is_protocol_error());
        assert!(!err.is_terminal());

        let err: Error = JobError::JobRecordCommitFailure {
            reason: "disk full".to_string(),
        }
        .into();
        assert!(err.is_job_error());
        assert!(!err.is_terminal());
    }
}
