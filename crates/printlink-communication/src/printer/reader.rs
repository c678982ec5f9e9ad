//! Read path: the reader loop and per-line handling
//!
//! One blocking reader runs per session and is bound to the session
//! generation it was started for; when the generation moves on it stops at
//! the next line boundary. Each pass also advances the program, so the
//! print keeps flowing at the pace replies arrive.

use super::connection::PrinterConnection;
use super::state::{EngineCtx, ReadAction, DONE_PRINTING_FILE};
use crate::protocol::parse::{
    parse_firmware, parse_position, parse_resend, parse_sd_progress, parse_temperatures,
};
use crate::transport::{is_disconnect, is_transient};
use printlink_core::event_bus::{
    CommunicationEvent, ConnectionEvent, ErrorEvent, JobEvent, MachineEvent,
};
use printlink_core::settings::keys;
use printlink_core::{
    AppEvent, CommunicationState, ConnectionError, ProtocolError, TemperatureState,
};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Handshake replies with more unknown bytes than this are rejected
const MAX_INVALID_MARKERS: usize = 3;

const READ_BUFFER_SIZE: usize = 1024;

/// Decode serial bytes; anything outside ASCII becomes `?` and carriage
/// returns end lines
fn decode(bytes: &[u8], into: &mut String) {
    into.extend(bytes.iter().map(|&b| match b {
        b'\r' => '\n',
        b if b.is_ascii() => b as char,
        _ => '?',
    }));
}

fn invalid_markers(text: &str) -> usize {
    text.matches('?').count()
}

impl PrinterConnection {
    /// Start the reader for `generation`
    pub(crate) fn spawn_reader(self: &Arc<Self>, generation: u64) {
        let link = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || link.read_loop(generation));
        *self.reader_slot().lock() = Some(handle);
    }

    fn read_loop(&self, generation: u64) {
        debug!("Reader started for session {}", generation);
        let mut pending = String::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        self.with_state(|ctx| ctx.st.since_last_read.restart());

        while self.is_current_generation(generation) {
            self.with_state(|ctx| {
                if ctx.st.is_printing_locally() {
                    ctx.write_next_program_line();
                }
            });

            let read = {
                let mut transport = self.transport_slot().lock();
                match transport.as_mut() {
                    Some(transport) => transport.read(&mut buf),
                    None => break,
                }
            };

            match read {
                Ok(0) => std::thread::sleep(self.config().reader_idle_sleep),
                Ok(n) => {
                    decode(&buf[..n], &mut pending);
                    self.with_state(|ctx| {
                        ctx.process_incoming(&mut pending, generation);
                        ctx.st.since_last_read.restart();
                    });
                }
                Err(e) if is_transient(&e) => std::thread::sleep(self.config().reader_idle_sleep),
                Err(e) if is_disconnect(&e) => {
                    error!("Error reading from printer: {}", e);
                    self.with_state(|ctx| {
                        if ctx.link.is_current_generation(generation) {
                            let reason = ConnectionError::ConnectionLost {
                                reason: e.to_string(),
                            };
                            ctx.abort_locked(reason.to_string(), true);
                        }
                    });
                    break;
                }
                Err(e) => {
                    warn!("Error reading from printer: {}", e);
                    std::thread::sleep(self.config().reader_idle_sleep);
                }
            }
        }
        debug!("Reader for session {} has exited", generation);
    }
}

impl EngineCtx<'_> {
    /// Consume every complete line in `pending`
    pub fn process_incoming(&mut self, pending: &mut String, generation: u64) {
        loop {
            if !self.link.is_current_generation(generation) {
                return;
            }

            let Some(end) = pending.find('\n') else {
                if self.st.state == CommunicationState::AttemptingToConnect
                    && invalid_markers(pending) > MAX_INVALID_MARKERS
                {
                    self.reject_handshake();
                }
                return;
            };

            let line: String = pending.drain(..=end).collect();
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            self.handle_line(line);

            if self.st.state == CommunicationState::AttemptingToConnect {
                if invalid_markers(line) <= MAX_INVALID_MARKERS {
                    self.set_state(CommunicationState::Connected);
                    let connect_gcode = self.link.settings().value_or_empty(keys::CONNECT_GCODE);
                    self.send_line_now(&connect_gcode);
                } else {
                    self.reject_handshake();
                }
            }
        }
    }

    fn reject_handshake(&mut self) {
        let reason = ConnectionError::InvalidResponse {
            port: self.st.port_name.clone().unwrap_or_default(),
        };
        self.abort_locked(reason.to_string(), false);
    }

    /// Announce, dispatch and forward one received line
    fn handle_line(&mut self, line: &str) {
        let shown = if self.st.state.is_printing() {
            format!("{} [{:.3}]", line, self.st.print_clock.elapsed_secs_f64())
        } else {
            line.to_string()
        };
        trace!("<< {}", shown);
        self.emit(AppEvent::Communication(CommunicationEvent::RawLineReceived {
            line: shown,
        }));

        let mut forward = true;
        for action in self.st.read_callbacks.matching(line) {
            forward &= self.run_read_action(action, line);
        }
        if forward {
            self.emit(AppEvent::Communication(CommunicationEvent::LineReceived {
                line: line.to_string(),
            }));
        }
    }

    /// Returns false when the line should not be forwarded
    fn run_read_action(&mut self, action: ReadAction, line: &str) -> bool {
        match action {
            ReadAction::Start | ReadAction::Ok => {
                self.st.ack_wait.stop();
                false
            }
            ReadAction::Wait => false,
            ReadAction::Temperatures => {
                self.read_temperatures(line);
                true
            }
            ReadAction::SdProgress => {
                match parse_sd_progress(line) {
                    Some((printed, total)) => {
                        self.st.sd_bytes_printed = printed;
                        self.st.sd_total_bytes = total;
                    }
                    None => warn!(
                        "{}",
                        ProtocolError::MalformedStatus {
                            line: line.to_string()
                        }
                    ),
                }
                self.st.sd_wait.stop();
                true
            }
            ReadAction::Position => {
                self.read_position(line);
                true
            }
            ReadAction::Extensions => {
                if line.contains("URI_GCODE_SEND") {
                    self.st.firmware.uri_gcode_send = true;
                }
                true
            }
            ReadAction::Resend => {
                self.read_resend(line);
                true
            }
            ReadAction::FirmwareName => {
                self.read_firmware(line);
                true
            }
            ReadAction::DonePrintingSdFile => {
                self.done_printing_sd();
                true
            }
            ReadAction::FileDeleteConfirmed => {
                self.st
                    .read_callbacks
                    .remove(super::state::FILE_DELETED, &ReadAction::FileDeleteConfirmed);
                self.st.ack_wait.stop();
                self.emit(AppEvent::Job(JobEvent::SdFileDeleted));
                true
            }
        }
    }

    fn read_temperatures(&mut self, line: &str) {
        let report = parse_temperatures(line);
        if report.extruders.is_empty() && report.bed.is_none() {
            warn!(
                "{}",
                ProtocolError::MalformedStatus {
                    line: line.to_string()
                }
            );
        }

        for (extruder, celsius) in report.extruders {
            let extruder = TemperatureState::clamp_index(extruder);
            if self.st.temperatures.actual_extruder[extruder] != celsius {
                self.st.temperatures.actual_extruder[extruder] = celsius;
                self.emit(AppEvent::Machine(MachineEvent::ExtruderTemperatureRead {
                    extruder,
                    celsius,
                }));
            }
        }
        if let Some(celsius) = report.bed {
            if self.st.temperatures.actual_bed != celsius {
                self.st.temperatures.actual_bed = celsius;
                self.emit(AppEvent::Machine(MachineEvent::BedTemperatureRead { celsius }));
            }
        }
        self.st.temperature_wait.stop();
    }

    fn read_position(&mut self, line: &str) {
        let position = parse_position(line);
        self.st.last_reported_position = position;
        if position != self.st.motion.destination() {
            self.st.motion.set_destination(position);
            self.emit(AppEvent::Machine(MachineEvent::DestinationChanged {
                destination: position,
            }));
        }
        self.emit(AppEvent::Machine(MachineEvent::PositionRead { position }));
        self.st.position_wait.stop();
        self.st.position_wait.reset();
    }

    fn read_resend(&mut self, line: &str) {
        let Some(sequence) = parse_resend(line) else {
            warn!(
                "{}",
                ProtocolError::MalformedStatus {
                    line: line.to_string()
                }
            );
            return;
        };
        match self.st.ledger.resend_index(sequence) {
            Ok(index) => {
                debug!("Firmware requested resend from line {}", sequence);
                self.st.resend_cursor = index;
            }
            Err((Some(oldest), e)) => {
                warn!("{}", e);
                self.emit(AppEvent::Error(ErrorEvent::ProtocolDesync {
                    requested: sequence,
                    oldest_retained: oldest + 1,
                }));
                self.st.resend_cursor = oldest;
            }
            Err((None, e)) => warn!("{}, ignoring", e),
        }
    }

    fn read_firmware(&mut self, line: &str) {
        let report = parse_firmware(line);
        let firmware = &mut self.st.firmware;

        let mut changed = false;
        if let Some(firmware_type) = report.firmware_type {
            changed |= firmware.firmware_type != firmware_type;
            firmware.firmware_type = firmware_type;
        }
        if report.version.is_some() && report.version != firmware.version {
            firmware.version = report.version;
            changed = true;
        }
        if report.device_code.is_some() {
            firmware.device_code = report.device_code;
        }
        if report.uri_gcode_send {
            firmware.uri_gcode_send = true;
        }

        if changed {
            let event = ConnectionEvent::FirmwareVersionRead {
                firmware: firmware.firmware_type,
                version: firmware.version.clone().unwrap_or_default(),
            };
            self.emit(AppEvent::Connection(event));
        }
    }

    /// The firmware finished its SD print
    pub fn done_printing_sd(&mut self) {
        self.st
            .read_callbacks
            .remove(DONE_PRINTING_FILE, &ReadAction::DonePrintingSdFile);
        self.set_state(CommunicationState::FinishedPrint);
        self.st.print_name = None;
        self.turn_off_bed_and_extruders();
        self.release_motors();
    }
}
