//! Write path: queue, program tick and framing
//!
//! Three sources compete for the wire: the program at the cursor (with
//! pause/resume/cancel lines injected ahead of it), replays requested by the
//! firmware, and the out-of-band queue of polls and user commands. The
//! program is checksum framed and gated on acknowledgements; the queue is
//! sent raw whenever no acknowledgement is outstanding.

use super::macros::expand_printer_macro;
use super::state::{EngineCtx, WriteAction};
use super::transforms::is_move;
use crate::protocol::frame_line;
use crate::protocol::parse::{first_number_after, format_number};
use crate::transport::is_transient;
use printlink_core::event_bus::{CommunicationEvent, ConnectionEvent, ErrorEvent, MachineEvent};
use printlink_core::{
    AppEvent, CommunicationState, ConnectionError, DetailedPrintingState, MovementMode,
    ProtocolError, TemperatureState,
};
use std::io;
use tracing::{debug, error, trace, warn};

/// Private marker injected after the pause macro; never transmitted
pub(crate) const PAUSE_SENTINEL: &str = "MH_PAUSE";

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or("").trim()
}

impl EngineCtx<'_> {
    /// Put bytes on the wire and run the write-side bookkeeping
    ///
    /// `unframed` is the plain command for write callbacks and `LineSent`;
    /// replays pass `None`.
    pub fn write_to_printer(&mut self, raw: &str, unframed: Option<&str>) {
        let state = self.st.state;
        if !(state.is_connected() || state == CommunicationState::AttemptingToConnect) {
            return;
        }

        let shown = raw.trim_end_matches(['\r', '\n']);
        let shown = if state.is_printing() {
            format!("{} [{:.3}]", shown, self.st.print_clock.elapsed_secs_f64())
        } else {
            shown.to_string()
        };
        trace!(">> {}", shown);
        self.emit(AppEvent::Communication(CommunicationEvent::RawLineSent {
            line: shown,
        }));

        if let Some(line) = unframed {
            for action in self.st.write_callbacks.matching(line) {
                self.run_write_action(action, line);
            }
            self.emit(AppEvent::Communication(CommunicationEvent::LineSent {
                line: line.to_string(),
            }));
        }

        let result = {
            let mut transport = self.link.transport_slot().lock();
            match transport.as_mut() {
                Some(transport) => transport.write(raw.as_bytes()),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        };
        match result {
            Ok(()) => {
                self.st.since_last_write.restart();
                self.st.ack_wait.restart();
            }
            Err(e) if is_transient(&e) => warn!("Timed out writing to printer: {}", e),
            Err(e) => {
                error!("Error writing to printer: {}", e);
                let reason = ConnectionError::ConnectionLost {
                    reason: e.to_string(),
                };
                self.abort_locked(reason.to_string(), true);
            }
        }
    }

    fn run_write_action(&mut self, action: WriteAction, line: &str) {
        match action {
            WriteAction::ExtruderTarget => {
                if let Some(celsius) = first_number_after("S", line) {
                    let extruder = first_number_after("T", line)
                        .map(|t| TemperatureState::clamp_index(t.max(0.0) as usize))
                        .unwrap_or(0);
                    if self.st.temperatures.target_extruder[extruder] != celsius {
                        self.st.temperatures.target_extruder[extruder] = celsius;
                        self.emit(AppEvent::Machine(MachineEvent::ExtruderTemperatureSet {
                            extruder,
                            celsius,
                        }));
                    }
                }
            }
            WriteAction::BedTarget => {
                if let Some(celsius) = first_number_after("S", line) {
                    if self.st.temperatures.target_bed != celsius {
                        self.st.temperatures.target_bed = celsius;
                        self.emit(AppEvent::Machine(MachineEvent::BedTemperatureSet { celsius }));
                    }
                }
            }
            WriteAction::FanSpeed => {
                let speed = first_number_after("S", line)
                    .map(|s| s.clamp(0.0, 255.0) as u8)
                    .unwrap_or(255);
                self.record_fan_speed(speed);
            }
            WriteAction::FanOff => self.record_fan_speed(0),
            WriteAction::AbsoluteMovement => self.st.motion.set_movement_mode(MovementMode::Absolute),
            WriteAction::RelativeMovement => self.st.motion.set_movement_mode(MovementMode::Relative),
            WriteAction::AbsoluteExtrusion => self.st.motion.set_extruder_mode(MovementMode::Absolute),
            WriteAction::RelativeExtrusion => self.st.motion.set_extruder_mode(MovementMode::Relative),
            WriteAction::AtxPowerOn => self.record_atx_power(true),
            WriteAction::AtxPowerOff => self.record_atx_power(false),
        }
    }

    fn record_fan_speed(&mut self, speed: u8) {
        if self.st.fan_speed != speed {
            self.st.fan_speed = speed;
            self.emit(AppEvent::Machine(MachineEvent::FanSpeedSet { speed }));
        }
    }

    fn record_atx_power(&mut self, on: bool) {
        self.st.atx_power_on = on;
        self.emit(AppEvent::Connection(ConnectionEvent::AtxPowerChanged { on }));
    }

    /// Transform, frame, record and send one line
    pub fn write_checksum_line(&mut self, line: &str) {
        self.set_printing_state(DetailedPrintingState::from_line(line));

        let line = self.st.motion.apply_extrusion_ratio(line);
        let line = self.st.motion.apply_feed_rate_ratio(&line);
        self.track_destination(&line);
        let line = self.apply_leveling(line);

        let framed = frame_line(self.st.ledger.next_sequence(), &line);
        self.st.ledger.add(framed.clone());
        self.st.resend_cursor = self.st.ledger.count();
        self.write_to_printer(&format!("{}\r\n", framed), Some(&line));
    }

    fn track_destination(&mut self, line: &str) {
        if let Some(destination) = self.st.motion.track_destination(line) {
            self.emit(AppEvent::Machine(MachineEvent::DestinationChanged { destination }));
        }
    }

    /// Run the leveling transform; lines beyond the first are sent after it
    fn apply_leveling(&mut self, line: String) -> String {
        let Some(leveling) = self.st.leveling.clone() else {
            return line;
        };
        let mut lines = leveling.apply(
            &line,
            self.st.motion.destination(),
            self.st.motion.movement_mode(),
        );
        if lines.is_empty() {
            return line;
        }
        let first = lines.remove(0);
        if !lines.is_empty() {
            self.send_lines_now(&lines);
        }
        first
    }

    /// Send a command as soon as the protocol allows
    ///
    /// Forced immediate writes go straight to the wire. Otherwise, while the
    /// host program is printing, the command is spliced in right after the
    /// cursor, and in any other state it is queued.
    pub fn send_line_now(&mut self, text: &str) {
        let text = text.replace("\\n", "\n");
        if text.contains('\n') {
            let lines: Vec<&str> = text.split('\n').collect();
            self.send_lines_now(&lines);
            return;
        }

        let line = strip_comment(&text);
        if line.is_empty() {
            return;
        }

        if self.st.force_immediate_writes {
            self.write_to_printer(&format!("{}\r\n", line), Some(line));
        } else if self.st.is_printing_locally() {
            let next = self.st.cursor + 1;
            let duplicate = self
                .st
                .program
                .text(next)
                .is_some_and(|existing| existing.contains(line));
            if !duplicate {
                self.st.program.insert(next, line);
            }
        } else if self.st.queue.last().map(String::as_str) != Some(line) {
            self.st.queue.push(line.to_string());
        }
    }

    /// Send several commands, keeping their order
    pub fn send_lines_now<S: AsRef<str>>(&mut self, lines: &[S]) {
        let lines: Vec<&str> = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty())
            .collect();
        if self.st.is_printing_locally() && !self.st.force_immediate_writes {
            for line in lines.into_iter().rev() {
                self.send_line_now(line);
            }
        } else {
            for line in lines {
                self.send_line_now(line);
            }
        }
    }

    /// Insert a snippet into the program at `index`
    ///
    /// Named settings are substituted first; each line is stripped of its
    /// comment, uppercased and macro-expanded. Returns the index just past
    /// the inserted lines.
    pub fn inject_gcode(&mut self, code: &str, index: usize) -> usize {
        let code = self
            .link
            .settings()
            .replace_macro_values(code)
            .replace("\\n", "\n");

        let mut added = 0;
        for raw in code.split('\n').rev() {
            let line = strip_comment(raw).to_uppercase();
            if line.is_empty() {
                continue;
            }
            let line = expand_printer_macro(&line, &self.st.motion);
            self.st.program.insert(index, line);
            added += 1;
        }
        index + added
    }

    /// Drop the program and restart line numbering on the printer
    pub fn clear_queued_gcode(&mut self) {
        self.st.program.clear();
        self.st.cursor = 0;
        self.st.last_remaining_seconds = 0;

        self.st.ledger.clear();
        self.write_checksum_line("M110 S1");
        self.st.resend_cursor = self.st.ledger.count();
    }

    /// Advance the program by at most one line
    pub fn write_next_program_line(&mut self) {
        let link = self.link;
        let config = link.config();
        let len = self.st.program.len();
        let cursor = self.st.cursor;

        if self.st.ack_wait.is_running() {
            let silent = self.st.since_last_read.elapsed() > config.ack_silence_timeout
                && self.st.since_last_write.elapsed() > config.ack_total_timeout;

            if cursor > 0 && cursor + 1 < len {
                let expected = (self.st.program.max_seconds_before(cursor, config.motion_backlog)
                    * config.motion_safety_factor)
                    .max(config.motion_min_wait.as_secs_f64());
                let last = self.st.program.text(cursor - 1).unwrap_or("");
                let was_move_without_ok =
                    is_move(last) && self.st.ack_wait.elapsed_secs_f64() > expected;

                if !(silent || was_move_without_ok) {
                    return;
                }
                // assumes the newest line is the only one unacknowledged
                let waited_ms = self.st.ack_wait.elapsed().as_millis() as u64;
                warn!("{}, resending last line", ProtocolError::AckTimeout { waited_ms });
                self.emit(AppEvent::Error(ErrorEvent::AckTimeout { waited_ms }));
                self.st.resend_cursor = self.st.resend_cursor.saturating_sub(1);
            } else if cursor >= len && !silent {
                return;
            }
        }

        if self.st.resend_cursor < self.st.ledger.count() {
            self.replay_next();
            return;
        }

        let mut pause_requested = false;
        if cursor < len {
            if self.st.position_wait.is_running()
                && self.st.position_wait.elapsed() < config.position_wait_timeout
            {
                return;
            }

            let text = self.st.program.text(cursor).unwrap_or("").to_string();
            if text.contains("M114") {
                self.st.position_wait.restart();
            }

            let line = strip_comment(&text).to_uppercase();
            if !line.is_empty() {
                if line == PAUSE_SENTINEL {
                    pause_requested = true;
                } else if line == "M226" || line == "@PAUSE" {
                    self.request_pause(Some(cursor + 1));
                } else {
                    self.write_checksum_line(&line);
                }
            }
            self.st.cursor += 1;
        } else if self.st.print_canceled {
            self.set_state(CommunicationState::Connected);
            self.release_motors();
            self.turn_off_bed_and_extruders();
            self.st.print_canceled = false;
        } else if cursor == len {
            self.set_state(CommunicationState::FinishedPrint);
            self.st.print_name = None;
            self.release_motors();
            self.turn_off_bed_and_extruders();
        } else if !self.st.state.is_paused() {
            self.set_state(CommunicationState::Connected);
        }

        if pause_requested {
            self.do_pause();
        }
    }

    fn replay_next(&mut self) {
        let index = self.st.resend_cursor;
        match self.st.ledger.get(index).map(str::to_string) {
            Some(framed) => {
                debug!("Resending {}", framed);
                self.st.resend_cursor += 1;
                self.write_to_printer(&format!("{}\r\n", framed), None);
            }
            None => {
                let oldest = self.st.ledger.oldest_retained();
                let (requested, oldest_retained) = (index + 1, oldest + 1);
                warn!(
                    "{}",
                    ProtocolError::ProtocolDesync {
                        requested,
                        oldest_retained,
                    }
                );
                self.emit(AppEvent::Error(ErrorEvent::ProtocolDesync {
                    requested,
                    oldest_retained,
                }));
                self.st.resend_cursor = oldest;
            }
        }
    }

    fn write_next_queued_line(&mut self) {
        let line = self.st.queue.remove(0);
        self.track_destination(&line);
        let line = self.apply_leveling(line);
        self.write_to_printer(&format!("{}\r\n", line), Some(&line));
    }

    /// Periodic housekeeping: polls, program tick and queue drain
    pub fn on_idle(&mut self) {
        let link = self.link;
        let config = link.config();

        if !self.st.temperature_poll.is_running() {
            self.st.temperature_poll.start();
        }
        if self.st.temperature_poll.elapsed() > config.temperature_poll_interval {
            if self.st.monitor_temperature
                && (!self.st.temperature_wait.is_running()
                    || self.st.temperature_wait.elapsed() > config.temperature_stale_after)
            {
                self.st.temperature_wait.restart();
                self.send_line_now("M105");
            }

            if self.st.state == CommunicationState::PrintingFromSd
                && (!self.st.sd_wait.is_running()
                    || self.st.sd_wait.elapsed() > config.sd_poll_interval)
            {
                self.st.sd_wait.restart();
                self.send_line_now("M27");
            }

            self.st.temperature_poll.restart();
        }

        if self.st.is_printing_locally() {
            self.write_next_program_line();
        }

        let waited_too_long = self.st.ack_wait.elapsed() > config.queue_ack_timeout
            && self.st.since_last_read.elapsed() > config.queue_silence_timeout;
        while !self.st.queue.is_empty() && (!self.st.ack_wait.is_running() || waited_too_long) {
            self.write_next_queued_line();
            let state = self.st.state;
            if !(state.is_connected() || state == CommunicationState::AttemptingToConnect) {
                break;
            }
        }
    }

    pub fn release_motors(&mut self) {
        self.send_line_now("M84");
    }

    /// Set an extruder target, sending it when connected
    pub fn set_target_extruder_temperature(&mut self, extruder: usize, celsius: f64) {
        let extruder = TemperatureState::clamp_index(extruder);
        if self.st.temperatures.target_extruder[extruder] != celsius {
            self.st.temperatures.target_extruder[extruder] = celsius;
            self.emit(AppEvent::Machine(MachineEvent::ExtruderTemperatureSet {
                extruder,
                celsius,
            }));
            if self.st.state.is_connected() {
                self.send_line_now(&format!("M104 T{} S{}", extruder, format_number(celsius)));
            }
        }
    }

    pub fn set_target_bed_temperature(&mut self, celsius: f64) {
        if self.st.temperatures.target_bed != celsius {
            self.st.temperatures.target_bed = celsius;
            self.emit(AppEvent::Machine(MachineEvent::BedTemperatureSet { celsius }));
            if self.st.state.is_connected() {
                self.send_line_now(&format!("M140 S{}", format_number(celsius)));
            }
        }
    }

    pub fn set_fan_speed(&mut self, speed: u8) {
        self.record_fan_speed(speed);
        if self.st.state.is_connected() {
            self.send_line_now(&format!("M106 S{}", speed));
        }
    }

    /// Zero every heater target; the off commands are always sent when
    /// connected
    pub fn turn_off_bed_and_extruders(&mut self) {
        let heated: Vec<usize> = (1..self.st.temperatures.target_extruder.len())
            .filter(|&i| self.st.temperatures.target_extruder[i] != 0.0)
            .collect();
        for extruder in std::iter::once(0).chain(heated) {
            if self.st.temperatures.target_extruder[extruder] != 0.0 {
                self.st.temperatures.target_extruder[extruder] = 0.0;
                self.emit(AppEvent::Machine(MachineEvent::ExtruderTemperatureSet {
                    extruder,
                    celsius: 0.0,
                }));
            }
            if self.st.state.is_connected() {
                self.send_line_now(&format!("M104 T{} S0", extruder));
            }
        }

        if self.st.temperatures.target_bed != 0.0 {
            self.st.temperatures.target_bed = 0.0;
            self.emit(AppEvent::Machine(MachineEvent::BedTemperatureSet { celsius: 0.0 }));
        }
        if self.st.state.is_connected() {
            self.send_line_now("M140 S0");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("G1 X1 ; move"), "G1 X1");
        assert_eq!(strip_comment("  ; only a comment"), "");
        assert_eq!(strip_comment("M105"), "M105");
    }
}
