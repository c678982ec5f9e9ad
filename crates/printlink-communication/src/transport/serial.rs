//! Serial ports backed by the `serialport` crate.
//!
//! Reads use a 10 ms timeout so the reader loop can notice a stale
//! generation between reads; a timeout reads as zero bytes.

use super::{Transport, TransportFactory};
use parking_lot::Mutex;
use printlink_core::{ConnectionError, Error, Result};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// A port a printer may be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// OS name, `/dev/ttyACM0` or `COM3`
    pub port_name: String,
    pub description: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    /// USB vendor and product ids
    pub usb_ids: Option<(u16, u16)>,
}

impl From<&serialport::SerialPortInfo> for SerialPortInfo {
    fn from(port: &serialport::SerialPortInfo) -> Self {
        let (description, manufacturer, serial_number, usb_ids) = match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => (
                format!(
                    "{} {}",
                    usb.manufacturer.as_deref().unwrap_or("USB"),
                    usb.product.as_deref().unwrap_or("serial device")
                ),
                usb.manufacturer.clone(),
                usb.serial_number.clone(),
                Some((usb.vid, usb.pid)),
            ),
            serialport::SerialPortType::BluetoothPort => {
                ("Bluetooth serial".to_string(), None, None, None)
            }
            serialport::SerialPortType::PciPort => ("PCI serial".to_string(), None, None, None),
            _ => ("Serial port".to_string(), None, None, None),
        };
        Self {
            port_name: port.port_name.clone(),
            description,
            manufacturer,
            serial_number,
            usb_ids,
        }
    }
}

/// Serial ports that look like a USB printer board, in OS order
///
/// Keeps `COM<n>`, `/dev/ttyUSB*`, `/dev/ttyACM*` and the macOS
/// `/dev/cu.usbserial-*` / `/dev/cu.usbmodem*` call-out devices.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Serial port enumeration failed: {}", e);
        Error::other(format!("Cannot list serial ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(SerialPortInfo::from)
        .collect())
}

fn is_printer_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// Open serial port
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn serialport::SerialPort>,
    open_ports: Arc<Mutex<HashSet<String>>>,
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn name(&self) -> String {
        self.port_name.clone()
    }

    fn close(&mut self) -> io::Result<()> {
        self.open_ports.lock().remove(&self.port_name);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(io::Error::from)
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.write_request_to_send(level).map_err(io::Error::from)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.open_ports.lock().remove(&self.port_name);
    }
}

/// [`TransportFactory`] backed by the `serialport` crate
///
/// Tracks the ports it has opened so a second open of the same port is
/// reported as "in use" instead of failing deep inside the OS call.
#[derive(Debug, Default, Clone)]
pub struct SerialTransportFactory {
    open_ports: Arc<Mutex<HashSet<String>>>,
}

impl SerialTransportFactory {
    /// Create a factory with no ports open
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportFactory for SerialTransportFactory {
    fn available_ports(&self) -> Vec<String> {
        match list_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn is_port_in_use(&self, port: &str) -> bool {
        self.open_ports.lock().contains(port)
    }

    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn Transport>> {
        if baud_rate == 0 {
            return Err(ConnectionError::UnsupportedBaudRate { baud: baud_rate }.into());
        }

        let opened = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open();

        match opened {
            Ok(handle) => {
                self.open_ports.lock().insert(port.to_string());
                tracing::info!("Opened serial port {} at {} baud", port, baud_rate);
                Ok(Box::new(SerialTransport {
                    port_name: port.to_string(),
                    port: handle,
                    open_ports: self.open_ports.clone(),
                }))
            }
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", port, e);
                let error = match e.kind {
                    serialport::ErrorKind::InvalidInput => {
                        ConnectionError::UnsupportedBaudRate { baud: baud_rate }
                    }
                    _ => ConnectionError::FailedToOpen {
                        port: port.to_string(),
                        reason: e.to_string(),
                    },
                };
                Err(error.into())
            }
        }
    }
}
