//! Print streaming engine
//!
//! [`PrinterConnection`] drives one printer: the connect handshake, the
//! checksum-framed program stream with resend recovery, out-of-band
//! commands, temperature and SD polling, pause/resume/cancel and job
//! records.

pub mod config;
pub mod connection;
mod control;
pub mod job;
pub mod leveling;
pub mod macros;
pub mod program;
mod reader;
mod state;
pub mod transforms;
mod writer;

pub use config::ConnectionConfig;
pub use connection::{Axis, PrinterConnection, PrinterConnectionBuilder};
pub use job::{FileProgramLoader, JobStore, JsonJobStore, MemoryJobStore, ProgramLoader};
pub use leveling::{LevelingTransform, PlaneLeveling};
pub use macros::{expand_printer_macro, RESTORE_E_POSITION, RESTORE_XYZ_POSITION};
pub use program::{GcodeProgram, ProgramLine};
pub use transforms::MotionTracker;
