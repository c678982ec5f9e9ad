mod common;

use common::*;
use printlink_core::event_bus::{ConnectionEvent, JobEvent};
use printlink_core::{AppEvent, CommunicationState};
use std::time::Duration;

/// Start a long print and stall it on the unacknowledged fifth line, then
/// stop answering altogether
async fn stalled_print(rig: &Rig) -> tempfile::NamedTempFile {
    rig.port.set_responder(|line| {
        if unframe(line) == "M117 L5" {
            Vec::new()
        } else {
            marlin(line)
        }
    });
    let file = rig.start_program(&program(50)).await;
    assert!(wait_until(|| rig.position_of("M117 L5").is_some()).await);
    rig.settle().await;
    rig.silence();
    assert_eq!(rig.link().state(), CommunicationState::Printing);
    file
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_runs_cancel_gcode_then_returns_to_connected() {
    let rig = Rig::connected(&[("cancel_gcode", "M104 S0 ; heater off")]).await;
    rig.port.clear_written();
    let _file = stalled_print(&rig).await;

    rig.link().stop().await;
    assert_eq!(rig.link().total_program_lines(), 1);
    assert_eq!(
        rig.count_events(|e| matches!(
            e,
            AppEvent::Job(JobEvent::PrintCanceled { name }) if name.as_deref() == Some("test print")
        )),
        1
    );

    assert!(wait_until(|| rig.position_of("M104 S0").is_some()).await);
    let restart = rig.position_of("M110 S1").map(|first| {
        rig.commands()[first + 1..]
            .iter()
            .position(|c| c == "M110 S1")
            .map(|i| first + 1 + i)
    });
    let renumbered = restart.flatten().expect("numbering restarted on cancel");
    assert_eq!(rig.commands()[renumbered + 1], "M104 S0");

    // the cancel line is unacknowledged, so the print is still winding down
    rig.settle().await;
    assert_eq!(rig.link().state(), CommunicationState::Printing);

    rig.port.set_responder(marlin);
    rig.port.push_incoming("ok\n");
    assert!(wait_until(|| rig.link().state() == CommunicationState::Connected).await);
    assert!(wait_until(|| rig.position_of("M84").is_some()).await);

    let jobs = rig.jobs.records();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_closed());
    assert!(!jobs[0].print_complete);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_resume_splice_macros_in_order() {
    let rig = Rig::connected(&[
        ("pause_gcode", "M117 PAUSING"),
        ("resume_gcode", "M117 RESUMING"),
    ])
    .await;
    rig.port.clear_written();
    let _file = stalled_print(&rig).await;

    rig.link().request_pause();
    assert_eq!(rig.link().state(), CommunicationState::Printing);
    rig.port.set_responder(marlin);
    rig.port.push_incoming("ok\n");

    assert!(wait_until(|| rig.link().state() == CommunicationState::Paused).await);
    rig.settle().await;
    let paused_at = rig.position_of("M117 PAUSING").expect("pause gcode sent");
    assert_eq!(paused_at, rig.commands().len() - 1);
    assert!(rig.position_of("M117 RESUMING").is_none());

    rig.link().resume();
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);

    let commands = rig.commands();
    assert!(!commands.iter().any(|c| c.contains("MH_PAUSE")));
    let resumed_at = rig.position_of("M117 RESUMING").expect("resume gcode sent");
    assert_eq!(commands[resumed_at + 1], "G0 X0.000 Y0.000 Z0.000 F0");
    assert!(resumed_at > paused_at);

    // no program line is skipped or repeated
    let program_lines: Vec<&String> = commands.iter().filter(|c| c.starts_with("M117 L")).collect();
    assert_eq!(program_lines.len(), 50);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_without_macro_takes_effect_immediately() {
    let rig = Rig::connected(&[("resume_gcode", "M117 RESUMING")]).await;
    rig.port.clear_written();
    let _file = stalled_print(&rig).await;

    rig.link().request_pause();
    assert_eq!(rig.link().state(), CommunicationState::Paused);

    rig.port.set_responder(marlin);
    rig.port.push_incoming("ok\n");
    rig.link().resume();
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);

    let resumed_at = rig.position_of("M117 RESUMING").expect("resume gcode sent");
    assert!(rig.commands()[resumed_at + 1].starts_with("G0 X0.000"));

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_program_pause_command_pauses() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();
    let lines: Vec<String> = ["M117 A", "M226", "M117 B"]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let _file = rig.start_program(&lines).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::Paused).await);
    assert!(rig.position_of("M226").is_none());
    assert!(rig.position_of("M117 B").is_none());

    rig.link().resume();
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert!(rig.position_of("M117 B").is_some());

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unplug_mid_print_loses_connection() {
    let rig = Rig::connected(&[]).await;
    let _file = stalled_print(&rig).await;

    rig.port.unplug();
    assert!(wait_until(|| rig.link().state() == CommunicationState::ConnectionLost).await);
    assert!(rig.link().failure_message().starts_with("Connection Lost"));
    assert!(!rig.port.is_open());

    let jobs = rig.jobs.records();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_closed());
    assert!(!jobs[0].print_complete);
    assert_eq!(
        rig.count_events(|e| matches!(
            e,
            AppEvent::Connection(ConnectionEvent::ConnectionFailed { .. })
        )),
        1
    );

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_print_refused_when_not_ready() {
    let rig = Rig::new(&[]);
    let result = rig
        .link()
        .start_print("/does/not/matter.gcode", None)
        .await;
    assert!(result.is_err());
    assert_eq!(rig.link().state(), CommunicationState::Disconnected);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_program_returns_to_connected() {
    let rig = Rig::connected(&[]).await;
    let result = rig
        .link()
        .start_print("/definitely/not/here.gcode", None)
        .await;
    assert!(result.is_err());
    assert_eq!(rig.link().state(), CommunicationState::Connected);
    assert!(rig.jobs.records().is_empty());

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sd_print_reports_progress_and_completion() {
    let rig = Rig::connected(&[]).await;
    rig.link().start_sd_print("CUBE.GCO").expect("sd print");
    assert_eq!(rig.link().state(), CommunicationState::PrintingFromSd);
    assert!(wait_until(|| rig.position_of("M24").is_some()).await);
    assert!(rig.position_of("M23 cube.gco").is_some());

    rig.port.push_incoming("SD printing byte 50/200\n");
    assert!(wait_until(|| rig.link().sd_bytes_printed() == 50).await);
    assert_eq!(rig.link().percent_complete(), 25.0);

    rig.port.push_incoming("Done printing file\n");
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert!(wait_until(|| rig.position_of("M84").is_some()).await);

    rig.link().reset_to_ready_state().expect("reset");
    assert_eq!(rig.link().state(), CommunicationState::Connected);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sd_pause_and_resume_use_firmware_commands() {
    let rig = Rig::connected(&[]).await;
    rig.link().start_sd_print("cube.gco").expect("sd print");
    assert!(wait_until(|| rig.position_of("M24").is_some()).await);

    rig.link().request_pause();
    assert_eq!(rig.link().state(), CommunicationState::Paused);
    assert!(wait_until(|| rig.position_of("M25").is_some()).await);

    rig.port.clear_written();
    rig.link().resume();
    assert_eq!(rig.link().state(), CommunicationState::PrintingFromSd);
    assert!(wait_until(|| rig.position_of("M24").is_some()).await);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sd_delete_is_confirmed() {
    let rig = Rig::connected(&[]).await;
    rig.link().delete_file_from_sd_card("OLD.GCO");
    assert!(wait_until(|| rig.position_of("M30 old.gco").is_some()).await);

    rig.port.push_incoming("File deleted:old.gco\n");
    assert!(wait_until(|| rig.count_events(|e| matches!(e, AppEvent::Job(JobEvent::SdFileDeleted))) == 1).await);

    // the confirmation handler is one-shot
    rig.port.push_incoming("File deleted:old.gco\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        rig.count_events(|e| matches!(e, AppEvent::Job(JobEvent::SdFileDeleted))),
        1
    );

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_mid_print_writes_safety_commands_before_closing() {
    let rig = Rig::connected(&[]).await;
    let _file = stalled_print(&rig).await;
    let lines_before = rig.link().total_program_lines();
    rig.port.clear_written();

    rig.link().disable().await;

    assert_eq!(rig.link().state(), CommunicationState::Disconnected);
    assert!(!rig.port.is_open());
    assert_eq!(
        rig.commands(),
        vec!["M84", "M104 T0 S0", "M140 S0", "M106 S0"]
    );
    // written directly, not spliced into the program
    assert_eq!(rig.link().total_program_lines(), lines_before);

    let jobs = rig.jobs.records();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].is_closed());
    assert!(!jobs[0].print_complete);

    rig.shutdown().await;
}
