//! Pause, resume, cancel and SD card control

use super::state::{EngineCtx, ReadAction, DONE_PRINTING_FILE, FILE_DELETED};
use super::writer::PAUSE_SENTINEL;
use crate::protocol::Matcher;
use printlink_core::event_bus::JobEvent;
use printlink_core::settings::keys;
use printlink_core::{AppEvent, CommunicationState, JobError};
use tracing::info;

/// What the caller still has to do after [`EngineCtx::stop_print`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    Done,
    /// A handshake was in progress; the transport must be torn down
    AbandonConnect,
}

impl EngineCtx<'_> {
    /// Pause at program `index` (default: the cursor)
    ///
    /// SD prints pause in firmware. Host prints get the pause snippet, a
    /// private pause marker, the resume snippet and a return to the current
    /// position spliced in; the state flips to `Paused` when the marker is
    /// reached. Without a pause snippet the pause takes effect at once.
    pub fn request_pause(&mut self, index: Option<usize>) {
        if !self.st.state.is_printing() {
            return;
        }
        if self.st.state == CommunicationState::PrintingFromSd {
            self.set_state(CommunicationState::Paused);
            self.send_line_now("M25");
            return;
        }

        let index = index.unwrap_or(self.st.cursor);
        let settings = self.link.settings();
        let pause = settings.value_or_empty(keys::PAUSE_GCODE);
        let resume = settings.value_or_empty(keys::RESUME_GCODE);
        let restore = self.st.motion.restore_position_line();

        if pause.trim().is_empty() {
            let after = self.inject_gcode(&resume, index);
            self.inject_gcode(&restore, after);
            self.do_pause();
        } else {
            let after = self.inject_gcode(&pause, index);
            let after = self.inject_gcode(PAUSE_SENTINEL, after);
            let after = self.inject_gcode(&resume, after);
            self.inject_gcode(&restore, after);
        }
    }

    pub fn do_pause(&mut self) {
        if self.st.state.is_printing() {
            self.set_state(CommunicationState::Paused);
        }
    }

    pub fn resume(&mut self) {
        if !self.st.state.is_paused() {
            return;
        }
        if self.st.pre_pause_state == CommunicationState::PrintingFromSd {
            self.set_state(CommunicationState::PrintingFromSd);
            self.send_line_now("M24");
        } else {
            self.set_state(CommunicationState::Printing);
        }
    }

    /// Drop the rest of the program and run the cancel snippet
    fn cancel_print(&mut self) {
        self.clear_queued_gcode();
        let cancel = self.link.settings().value_or_empty(keys::CANCEL_GCODE);
        if !cancel.trim().is_empty() {
            let cursor = self.st.cursor;
            self.inject_gcode(&cancel, cursor);
        }
        self.st.print_canceled = true;
    }

    fn mark_active_print_canceled(&mut self) {
        self.close_active_job(false);
        let name = self.st.print_name.clone();
        info!("Print canceled: {}", name.as_deref().unwrap_or("unnamed"));
        self.emit(AppEvent::Job(JobEvent::PrintCanceled { name }));
    }

    fn cancel_sd_print(&mut self) {
        self.clear_queued_gcode();
        self.set_state(CommunicationState::Connected);
        self.send_line_now("M25");
        self.send_line_now("M26");
        self.done_printing_sd();
    }

    /// Stop whatever is running
    pub fn stop_print(&mut self) -> StopOutcome {
        match self.st.state {
            CommunicationState::PrintingFromSd => self.cancel_sd_print(),
            CommunicationState::Printing => {
                self.cancel_print();
                self.mark_active_print_canceled();
            }
            CommunicationState::Paused => {
                if self.st.pre_pause_state == CommunicationState::PrintingFromSd {
                    self.cancel_sd_print();
                    self.set_state(CommunicationState::Connected);
                } else {
                    self.cancel_print();
                    self.mark_active_print_canceled();
                    // run the cancel snippet
                    self.set_state(CommunicationState::Printing);
                }
            }
            CommunicationState::AttemptingToConnect => {
                self.set_state(CommunicationState::FailedToConnect);
                return StopOutcome::AbandonConnect;
            }
            CommunicationState::PreparingToPrint => {
                self.set_state(CommunicationState::Connected);
            }
            _ => {}
        }
        StopOutcome::Done
    }

    fn check_can_print(&self) -> Result<(), JobError> {
        let state = self.st.state;
        if !state.is_connected() || state.is_print_active() || state == CommunicationState::Disconnecting {
            return Err(JobError::NotReady {
                state: state.verbose().to_string(),
            });
        }
        Ok(())
    }

    /// Start a print of a file already on the printer's card
    ///
    /// `file` is sent as given; callers pass the lowercased 8.3 name for
    /// plain SD prints.
    pub fn start_sd_print(&mut self, file: &str) -> Result<(), JobError> {
        self.check_can_print()?;
        self.st.sd_bytes_printed = 0;
        self.st.sd_total_bytes = 0;
        self.clear_queued_gcode();
        self.set_state(CommunicationState::PrintingFromSd);
        self.st.print_name = Some(file.to_string());

        self.send_line_now(&format!("M23 {}", file));
        self.send_line_now("M24");

        if !self
            .st
            .read_callbacks
            .contains(DONE_PRINTING_FILE, &ReadAction::DonePrintingSdFile)
        {
            self.st.read_callbacks.add(
                Matcher::starts_with(DONE_PRINTING_FILE),
                ReadAction::DonePrintingSdFile,
            );
        }
        Ok(())
    }

    pub fn delete_file_from_sd_card(&mut self, file: &str) {
        if !self
            .st
            .read_callbacks
            .contains(FILE_DELETED, &ReadAction::FileDeleteConfirmed)
        {
            self.st.read_callbacks.add(
                Matcher::starts_with(FILE_DELETED),
                ReadAction::FileDeleteConfirmed,
            );
        }
        self.send_line_now(&format!("M30 {}", file.to_lowercase()));
    }

    /// Clear a finished print so a new one can start
    pub fn reset_to_ready_state(&mut self) -> Result<(), JobError> {
        if self.st.state != CommunicationState::FinishedPrint {
            return Err(JobError::NotReady {
                state: self.st.state.verbose().to_string(),
            });
        }
        self.set_state(CommunicationState::Connected);
        Ok(())
    }
}
