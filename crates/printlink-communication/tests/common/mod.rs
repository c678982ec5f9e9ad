//! Simulated printer rig shared by the integration tests
#![allow(dead_code, unused_imports)]

pub use printlink_communication::JobStore;

use parking_lot::Mutex;
use printlink_communication::printer::{ConnectionConfig, MemoryJobStore, PrinterConnection};
use printlink_communication::{PrintSession, ScriptedPort, ScriptedTransportFactory};
use printlink_core::{AppEvent, EventFilter, FirmwareType, ManualClock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

pub const PORT: &str = "sim0";
pub const BAUD: u32 = 250_000;
pub const WAIT: Duration = Duration::from_secs(5);

pub const FIRMWARE_REPLY: &str = "FIRMWARE_NAME:Marlin 2.1.2 SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Test EXTRUDER_COUNT:1";

/// Acknowledge everything and answer `M115` like Marlin
pub fn marlin(line: &str) -> Vec<String> {
    if line.contains("M115") {
        vec![FIRMWARE_REPLY.to_string(), "ok".to_string()]
    } else {
        vec!["ok".to_string()]
    }
}

pub struct Rig {
    pub session: PrintSession,
    pub factory: Arc<ScriptedTransportFactory>,
    pub port: ScriptedPort,
    pub clock: Arc<ManualClock>,
    pub jobs: Arc<MemoryJobStore>,
    events: Arc<Mutex<Vec<AppEvent>>>,
}

impl Rig {
    pub fn new(settings: &[(&str, &str)]) -> Self {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let port = factory.add_port(PORT);
        port.set_responder(marlin);

        let clock = Arc::new(ManualClock::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let settings: HashMap<String, String> = settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = ConnectionConfig {
            monitor_temperature: false,
            ..ConnectionConfig::simulated()
        };

        let connection = PrinterConnection::builder()
            .config(config)
            .clock(clock.clone())
            .transports(factory.clone())
            .settings(Arc::new(settings))
            .job_store(jobs.clone())
            .build();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        connection
            .bus()
            .subscribe(EventFilter::All, move |event| sink.lock().push(event));

        Self {
            session: PrintSession::start(connection),
            factory,
            port,
            clock,
            jobs,
            events,
        }
    }

    /// A rig that has completed the handshake
    pub async fn connected(settings: &[(&str, &str)]) -> Self {
        let rig = Self::new(settings);
        rig.session
            .connect_and_wait(PORT, BAUD, WAIT)
            .await
            .expect("handshake");
        let settled = wait_until(|| {
            rig.link().queued_command_count() == 0
                && rig.link().firmware().firmware_type == FirmwareType::Marlin
        })
        .await;
        assert!(settled, "handshake traffic did not settle");
        rig
    }

    /// Stop the session and release the port
    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }

    pub fn link(&self) -> &Arc<PrinterConnection> {
        self.session.connection()
    }

    pub fn events(&self) -> Vec<AppEvent> {
        self.events.lock().clone()
    }

    pub fn count_events(&self, matches: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }

    /// Stop answering; the writer stalls on the next unacknowledged line
    pub fn silence(&self) {
        self.port.set_responder(|_| Vec::new());
    }

    /// Sequence numbers of the framed lines written, in order
    pub fn sequences(&self) -> Vec<usize> {
        self.port
            .written()
            .iter()
            .filter_map(|line| line.strip_prefix('N'))
            .filter_map(|rest| rest.split(' ').next()?.parse().ok())
            .collect()
    }

    /// Written commands with any `N..` / `*..` framing removed
    pub fn commands(&self) -> Vec<String> {
        self.port.written().iter().map(|line| unframe(line)).collect()
    }

    pub fn position_of(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }

    /// Load `lines` as a program file and start printing it
    pub async fn start_program(&self, lines: &[String]) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".gcode")
            .tempfile()
            .expect("temp file");
        for line in lines {
            writeln!(file, "{}", line).expect("write program");
        }
        file.flush().expect("flush");
        self.link()
            .start_print(file.path(), Some("test print".to_string()))
            .await
            .expect("start print");
        file
    }

    /// Wait until the writer stops making progress
    pub async fn settle(&self) {
        let mut last = self.port.written().len();
        loop {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let now = self.port.written().len();
            if now == last {
                return;
            }
            last = now;
        }
    }
}

pub fn unframe(line: &str) -> String {
    match (line.strip_prefix('N'), line.rfind('*')) {
        (Some(rest), Some(star)) if rest.contains(' ') => {
            let body_start = line.find(' ').map(|i| i + 1).unwrap_or(0);
            line[body_start..star].to_string()
        }
        _ => line.to_string(),
    }
}

/// `count` distinct non-motion program lines
pub fn program(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("M117 L{}", i)).collect()
}

pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
