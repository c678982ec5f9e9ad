//! In-memory transport for simulated printers
//!
//! A [`ScriptedPort`] records every line written to it and hands scripted
//! replies back to the reader. Replies can be pushed directly or produced by
//! a responder closure that sees each written line, which is enough to
//! simulate firmware that acknowledges, asks for resends or stays silent.

use super::{Transport, TransportFactory};
use parking_lot::Mutex;
use printlink_core::{ConnectionError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;

/// Produces the reply lines for one written line
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

#[derive(Default)]
struct PortState {
    incoming: VecDeque<u8>,
    written: Vec<String>,
    partial_write: String,
    responder: Option<Responder>,
    open: bool,
    unplugged: bool,
    control_lines: Vec<(&'static str, bool)>,
}

/// Shared handle to a simulated serial port
#[derive(Clone)]
pub struct ScriptedPort {
    name: String,
    state: Arc<Mutex<PortState>>,
}

impl ScriptedPort {
    /// Create a port with no scripted replies
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(PortState::default())),
        }
    }

    /// Port name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue raw text for the reader
    pub fn push_incoming(&self, text: &str) {
        self.state.lock().incoming.extend(text.as_bytes());
    }

    /// Install a responder called for every complete written line
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Reply `ok` to every written line
    pub fn auto_ok(&self) {
        self.set_responder(|_| vec!["ok".to_string()]);
    }

    /// Every complete line written so far, without line terminators
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Forget the written lines
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Whether a transport currently holds the port open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Make every further read and write fail as if the cable was pulled
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    /// DTR/RTS changes in the order they were made
    pub fn control_lines(&self) -> Vec<(&'static str, bool)> {
        self.state.lock().control_lines.clone()
    }

    fn take_incoming(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let count = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn accept_write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.partial_write.push_str(&String::from_utf8_lossy(data));

        let mut replies = Vec::new();
        while let Some(end) = state.partial_write.find('\n') {
            let line: String = state.partial_write.drain(..=end).collect();
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if let Some(responder) = state.responder.clone() {
                replies.extend(responder(&line));
            }
            state.written.push(line);
        }
        for reply in replies {
            state.incoming.extend(reply.as_bytes());
            state.incoming.push_back(b'\n');
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScriptedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedPort")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

struct ScriptedTransport {
    port: ScriptedPort,
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.take_incoming(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.accept_write(data)
    }

    fn name(&self) -> String {
        self.port.name.clone()
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.state.lock().open = false;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.state.lock().control_lines.push(("DTR", level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.state.lock().control_lines.push(("RTS", level));
        Ok(())
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.port.state.lock().open = false;
    }
}

/// [`TransportFactory`] over a fixed set of scripted ports
#[derive(Default)]
pub struct ScriptedTransportFactory {
    ports: Mutex<HashMap<String, ScriptedPort>>,
    held_elsewhere: Mutex<HashSet<String>>,
}

impl ScriptedTransportFactory {
    /// Create a factory with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a port enumerable and return its handle
    pub fn add_port(&self, name: &str) -> ScriptedPort {
        let port = ScriptedPort::new(name);
        self.ports.lock().insert(name.to_string(), port.clone());
        port
    }

    /// Report a port as opened by another process
    pub fn hold_elsewhere(&self, name: &str) {
        self.held_elsewhere.lock().insert(name.to_string());
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn available_ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn is_port_in_use(&self, port: &str) -> bool {
        self.held_elsewhere.lock().contains(port)
            || self.ports.lock().get(port).is_some_and(|p| p.is_open())
    }

    fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn Transport>> {
        let handle = self
            .ports
            .lock()
            .get(port)
            .cloned()
            .ok_or_else(|| ConnectionError::port_not_found(port))?;
        handle.state.lock().open = true;
        Ok(Box::new(ScriptedTransport { port: handle }))
    }
}
