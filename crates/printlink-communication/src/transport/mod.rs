//! Byte transports the printer link runs over
//!
//! A [`TransportFactory`] discovers and opens ports; a [`Transport`] is one
//! open handle. The engine only ever talks to these traits, so the serial
//! implementation and the scripted one used by tests are interchangeable.

pub mod scripted;
pub mod serial;

use printlink_core::Result;
use std::io;

pub use scripted::{ScriptedPort, ScriptedTransportFactory};
pub use serial::{list_ports, SerialPortInfo, SerialTransport, SerialTransportFactory};

/// One open byte stream to a printer
///
/// Reads must not block for long: the reader loop holds the transport
/// while reading, and writers wait for it.
pub trait Transport: Send {
    /// Read whatever is available. `Ok(0)` means nothing arrived yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Port name this transport was opened on
    fn name(&self) -> String;

    /// Release the underlying handle
    fn close(&mut self) -> io::Result<()>;

    /// Drive the DTR line
    fn set_dtr(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }

    /// Drive the RTS line
    fn set_rts(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Port discovery and opening
pub trait TransportFactory: Send + Sync {
    /// Names of the ports that can currently be opened
    fn available_ports(&self) -> Vec<String>;

    /// Whether the port is already held open by someone else
    fn is_port_in_use(&self, port: &str) -> bool;

    /// Open a port
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>>;

    /// Whether the port is present in the enumerated list
    fn is_port_available(&self, port: &str) -> bool {
        self.available_ports()
            .iter()
            .any(|name| name.eq_ignore_ascii_case(port))
    }
}

/// Whether an I/O error means the device went away
pub fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::NotFound
    )
}

/// Whether an I/O error only means "nothing yet"
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
