//! Engine state and the communication state machine
//!
//! Everything the reader, writer and public API mutate lives in one
//! [`EngineState`] behind the connection's single mutex. Logic that needs
//! it runs on an [`EngineCtx`], a borrow of the locked state plus the
//! connection it belongs to. Events produced while the lock is held are
//! collected in the outbox and published after it is released, so listeners
//! always observe fully updated state.

use super::config::ConnectionConfig;
use super::connection::PrinterConnection;
use super::leveling::LevelingTransform;
use super::program::GcodeProgram;
use super::transforms::MotionTracker;
use crate::protocol::{ChecksumLedger, LineCallbacks, Matcher};
use printlink_core::event_bus::{ConnectionEvent, ErrorEvent, JobEvent, MachineEvent};
use printlink_core::{
    AppEvent, Clock, CommunicationState, DetailedPrintingState, FirmwareInfo, PrintJobRecord,
    Stopwatch, TemperatureState,
};
use std::sync::Arc;
use tracing::{info, warn};

/// What to do with a line read from the printer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadAction {
    /// Firmware (re)started
    Start,
    /// Acknowledgement
    Ok,
    /// Idle keep-alive
    Wait,
    Temperatures,
    SdProgress,
    Position,
    Extensions,
    Resend,
    FirmwareName,
    /// SD print completion marker; registered only while printing from SD
    DonePrintingSdFile,
    /// SD delete confirmation; registered only while a delete is in flight
    FileDeleteConfirmed,
}

/// Bookkeeping for a line written to the printer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteAction {
    ExtruderTarget,
    BedTarget,
    FanSpeed,
    FanOff,
    AbsoluteMovement,
    RelativeMovement,
    AbsoluteExtrusion,
    RelativeExtrusion,
    AtxPowerOn,
    AtxPowerOff,
}

pub(crate) const DONE_PRINTING_FILE: &str = "Done printing file";
pub(crate) const FILE_DELETED: &str = "File deleted:";

fn read_callbacks() -> LineCallbacks<ReadAction> {
    let mut table = LineCallbacks::new();
    let starts_with = [
        ("start", ReadAction::Start),
        ("ok", ReadAction::Ok),
        ("wait", ReadAction::Wait),
        ("T:", ReadAction::Temperatures),
        ("ok T:", ReadAction::Temperatures),
        ("ok T0:", ReadAction::Temperatures),
        ("SD printing byte", ReadAction::SdProgress),
        ("Sd printing byte", ReadAction::SdProgress),
        ("X:", ReadAction::Position),
        ("ok X:", ReadAction::Position),
        ("C:", ReadAction::Position),
        ("ok C:", ReadAction::Position),
        ("EXTENSIONS:", ReadAction::Extensions),
    ];
    for (key, action) in starts_with {
        table.add(Matcher::starts_with(key), action);
    }
    for (key, action) in [
        ("Resend:", ReadAction::Resend),
        ("RS:", ReadAction::Resend),
        ("FIRMWARE_NAME:", ReadAction::FirmwareName),
    ] {
        table.add(Matcher::contains(key), action);
    }
    table
}

fn write_callbacks() -> LineCallbacks<WriteAction> {
    let mut table = LineCallbacks::new();
    let starts_with = [
        ("M104", WriteAction::ExtruderTarget),
        ("M109", WriteAction::ExtruderTarget),
        ("M140", WriteAction::BedTarget),
        ("M190", WriteAction::BedTarget),
        ("M106", WriteAction::FanSpeed),
        ("M107", WriteAction::FanOff),
        ("G90", WriteAction::AbsoluteMovement),
        ("G91", WriteAction::RelativeMovement),
        ("M82", WriteAction::AbsoluteExtrusion),
        ("M83", WriteAction::RelativeExtrusion),
        ("M80", WriteAction::AtxPowerOn),
        ("M81", WriteAction::AtxPowerOff),
    ];
    for (key, action) in starts_with {
        table.add(Matcher::starts_with(key), action);
    }
    table
}

/// All mutable engine state
pub(crate) struct EngineState {
    pub state: CommunicationState,
    pub pre_pause_state: CommunicationState,
    pub printing_state: DetailedPrintingState,
    pub failure_message: String,
    pub port_name: Option<String>,
    pub baud_rate: u32,

    pub firmware: FirmwareInfo,
    pub temperatures: TemperatureState,
    pub fan_speed: u8,
    pub atx_power_on: bool,
    pub last_reported_position: printlink_core::Position,
    pub motion: MotionTracker,
    pub leveling: Option<Arc<dyn LevelingTransform>>,
    pub monitor_temperature: bool,

    pub program: GcodeProgram,
    pub cursor: usize,
    pub last_remaining_seconds: u64,
    pub ledger: ChecksumLedger,
    pub resend_cursor: usize,
    pub queue: Vec<String>,
    pub force_immediate_writes: bool,
    pub print_canceled: bool,
    pub print_name: Option<String>,
    pub active_job: Option<PrintJobRecord>,
    pub sd_bytes_printed: u64,
    pub sd_total_bytes: u64,

    pub read_callbacks: LineCallbacks<ReadAction>,
    pub write_callbacks: LineCallbacks<WriteAction>,

    pub ack_wait: Stopwatch,
    pub since_last_read: Stopwatch,
    pub since_last_write: Stopwatch,
    pub print_clock: Stopwatch,
    pub temperature_wait: Stopwatch,
    pub temperature_poll: Stopwatch,
    pub sd_wait: Stopwatch,
    pub position_wait: Stopwatch,

    pub outbox: Vec<AppEvent>,
}

impl EngineState {
    pub fn new(clock: Arc<dyn Clock>, config: &ConnectionConfig) -> Self {
        let stopwatch = || Stopwatch::new(Arc::clone(&clock));
        Self {
            state: CommunicationState::Disconnected,
            pre_pause_state: CommunicationState::Printing,
            printing_state: DetailedPrintingState::Printing,
            failure_message: String::new(),
            port_name: None,
            baud_rate: 0,
            firmware: FirmwareInfo::default(),
            temperatures: TemperatureState::default(),
            fan_speed: 0,
            atx_power_on: false,
            last_reported_position: printlink_core::Position::zero(),
            motion: MotionTracker::new(),
            leveling: None,
            monitor_temperature: config.monitor_temperature,
            program: GcodeProgram::new(),
            cursor: 0,
            last_remaining_seconds: 0,
            ledger: ChecksumLedger::new(),
            resend_cursor: 0,
            queue: Vec::new(),
            force_immediate_writes: false,
            print_canceled: false,
            print_name: None,
            active_job: None,
            sd_bytes_printed: 0,
            sd_total_bytes: 0,
            read_callbacks: read_callbacks(),
            write_callbacks: write_callbacks(),
            ack_wait: stopwatch(),
            since_last_read: stopwatch(),
            since_last_write: stopwatch(),
            print_clock: stopwatch(),
            temperature_wait: stopwatch(),
            temperature_poll: stopwatch(),
            sd_wait: stopwatch(),
            position_wait: stopwatch(),
            outbox: Vec::new(),
        }
    }

    /// Printing from the host-side program (not from SD)
    pub fn is_printing_locally(&self) -> bool {
        self.state == CommunicationState::Printing
    }

    pub fn print_is_finished(&self) -> bool {
        self.state == CommunicationState::FinishedPrint
    }
}

/// Locked engine state together with its connection
pub(crate) struct EngineCtx<'a> {
    pub st: &'a mut EngineState,
    pub link: &'a PrinterConnection,
}

impl EngineCtx<'_> {
    pub fn emit(&mut self, event: AppEvent) {
        self.st.outbox.push(event);
    }

    /// Move the state machine, doing the bookkeeping each transition needs
    /// before `StateChanged` is queued
    pub fn set_state(&mut self, new_state: CommunicationState) {
        if new_state == CommunicationState::Connected {
            self.st.temperature_wait.stop();
        }

        let previous = self.st.state;
        if previous == new_state {
            return;
        }

        match previous {
            CommunicationState::Printing | CommunicationState::PrintingFromSd => match new_state {
                CommunicationState::Paused => {
                    self.st.pre_pause_state = previous;
                    self.st.print_clock.stop();
                }
                CommunicationState::FinishedPrint => {
                    self.close_active_job(true);
                    self.st.state = new_state;
                    self.st.print_clock.stop();
                    let name = self.st.print_name.clone();
                    self.emit(AppEvent::Job(JobEvent::PrintFinished { name }));
                }
                _ => self.st.print_clock.reset(),
            },
            CommunicationState::Paused => {
                if new_state == CommunicationState::Printing {
                    self.st.print_clock.start();
                }
            }
            _ => {
                if !self.st.print_clock.is_running() && new_state == CommunicationState::Printing {
                    self.st.print_clock.restart();
                }
            }
        }

        self.st.state = new_state;
        info!("Communication state: {} -> {}", previous, new_state);
        self.emit(AppEvent::Connection(ConnectionEvent::StateChanged {
            previous,
            current: new_state,
        }));
    }

    /// Set the detailed phase, announcing changes
    pub fn set_printing_state(&mut self, printing_state: DetailedPrintingState) {
        if self.st.printing_state != printing_state {
            self.st.printing_state = printing_state;
            self.emit(AppEvent::Machine(MachineEvent::PrintingStateChanged {
                state: printing_state,
            }));
        }
    }

    /// Close and persist the open job record, if any
    pub fn close_active_job(&mut self, complete: bool) {
        if let Some(mut job) = self.st.active_job.take() {
            job.finish(complete);
            self.commit_job(&job);
        }
    }

    /// Persist a job record; failure never interrupts the print
    pub fn commit_job(&mut self, job: &PrintJobRecord) {
        if let Err(e) = self.link.job_store().commit(job) {
            warn!("{}", e);
            self.emit(AppEvent::Error(ErrorEvent::JobRecordFailed {
                reason: e.to_string(),
            }));
        }
    }

    /// Mark the link failed and tell listeners why
    pub fn fail_connection(&mut self, reason: String, final_state: CommunicationState) {
        self.set_state(final_state);
        warn!("Connection failed: {}", reason);
        self.st.failure_message = reason.clone();
        let port = self.st.port_name.clone();
        self.emit(AppEvent::Connection(ConnectionEvent::ConnectionFailed {
            port,
            reason,
        }));
    }
}
