//! # PrintLink Communication
//!
//! Talks to RepRap-style FDM printers over a serial line.
//!
//! - [`transport`]: serial ports and the scripted transport used by tests
//! - [`protocol`]: checksum framing, the resend ledger and reply parsers
//! - [`printer`]: the streaming engine, [`PrinterConnection`]
//! - [`session`]: a connection bundled with the ticker that drives it
//!
//! ```rust,ignore
//! use printlink_communication::{PrintSession, PrinterConnection};
//! use std::time::Duration;
//!
//! let session = PrintSession::start(PrinterConnection::builder().build());
//! session.connect_and_wait("/dev/ttyUSB0", 250_000, Duration::from_secs(10)).await?;
//! session.connection().start_print("cube.gcode", None).await?;
//! ```

pub mod printer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use printer::{
    Axis, ConnectionConfig, FileProgramLoader, GcodeProgram, JobStore, JsonJobStore,
    LevelingTransform, MemoryJobStore, PlaneLeveling, PrinterConnection,
    PrinterConnectionBuilder, ProgramLoader,
};
pub use protocol::{frame_line, ChecksumLedger, LineCallbacks, Matcher};
pub use session::PrintSession;
pub use transport::{
    list_ports, ScriptedPort, ScriptedTransportFactory, SerialPortInfo, SerialTransportFactory,
    Transport, TransportFactory,
};
