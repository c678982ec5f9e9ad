mod common;

use common::*;
use printlink_communication::LevelingTransform;
use printlink_core::event_bus::{ErrorEvent, JobEvent, MachineEvent};
use printlink_core::{AppEvent, CommunicationState, MovementMode, Position};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_program_streams_framed_and_finishes() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();
    let _file = rig.start_program(&program(5)).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4, 5, 6]);

    let written = rig.port.written();
    assert!(written[0].starts_with("N1 M110 S1*"));
    assert_eq!(unframe(&written[1]), "M117 L1");

    assert_eq!(rig.link().percent_complete(), 100.0);
    assert!(wait_until(|| rig.position_of("M84").is_some()).await);

    let jobs = rig.jobs.records();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "test print");
    assert!(jobs[0].print_complete);
    assert_eq!(
        rig.count_events(|e| matches!(e, AppEvent::Job(JobEvent::PrintFinished { .. }))),
        1
    );

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resend_replays_requested_lines() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();

    let asked = Arc::new(AtomicBool::new(false));
    let flag = asked.clone();
    rig.port.set_responder(move |line| {
        if line.starts_with("N8 ") && !flag.swap(true, Ordering::SeqCst) {
            vec!["Error:checksum mismatch".to_string(), "Resend: 5".to_string(), "ok".to_string()]
        } else {
            vec!["ok".to_string()]
        }
    });
    let _file = rig.start_program(&program(10)).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(
        rig.sequences(),
        vec![1, 2, 3, 4, 5, 6, 7, 8, 5, 6, 7, 8, 9, 10, 11]
    );

    // replays carry the original framing
    let written = rig.port.written();
    let framed: Vec<&String> = written.iter().filter(|l| l.starts_with("N5 ")).collect();
    assert_eq!(framed.len(), 2);
    assert_eq!(framed[0], framed[1]);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resend_beyond_last_line_is_ignored() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();

    let asked = Arc::new(AtomicBool::new(false));
    let flag = asked.clone();
    rig.port.set_responder(move |line| {
        if line.starts_with("N3 ") && !flag.swap(true, Ordering::SeqCst) {
            vec!["Resend: 40".to_string(), "ok".to_string()]
        } else {
            vec!["ok".to_string()]
        }
    });
    let _file = rig.start_program(&program(4)).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4, 5]);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_ack_forces_resend_after_silence() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();

    let withheld = Arc::new(AtomicBool::new(false));
    let flag = withheld.clone();
    rig.port.set_responder(move |line| {
        if unframe(line) == "M117 L3" && !flag.swap(true, Ordering::SeqCst) {
            Vec::new()
        } else {
            vec!["ok".to_string()]
        }
    });
    let _file = rig.start_program(&program(8)).await;

    assert!(wait_until(|| rig.sequences().len() == 4).await);
    rig.settle().await;
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4]);

    // silent but not long enough since the last write
    rig.clock.advance_secs(20);
    rig.settle().await;
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4]);

    rig.clock.advance_secs(11);
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4, 4, 5, 6, 7, 8, 9]);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_comments_and_blank_lines_are_not_sent() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();
    let lines: Vec<String> = ["; sliced by hand", "g28 ; home", "", "M117 done"]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let _file = rig.start_program(&lines).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    let commands = rig.commands();
    assert_eq!(&commands[..3], &["M110 S1", "G28", "M117 DONE"]);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_replies_update_state() {
    let rig = Rig::connected(&[]).await;

    rig.port
        .push_incoming("ok T:180.5 /200.0 B:55.0 /60.0 @:0 B@:0\n");
    assert!(wait_until(|| rig.link().actual_bed_temperature() == 55.0).await);
    assert_eq!(rig.link().actual_extruder_temperature(0), 180.5);

    rig.port
        .push_incoming("X:10.00 Y:5.00 Z:0.30 E:0.00 Count X:800 Y:400 Z:120\n");
    let expected = Position::new(10.0, 5.0, 0.3);
    assert!(wait_until(|| rig.link().last_reported_position() == expected).await);
    assert_eq!(rig.link().current_destination(), expected);

    // echo lines reach listeners untouched
    rig.port.push_incoming("echo:busy: processing\n");
    assert!(wait_until(|| rig.count_events(|e| matches!(
        e,
        AppEvent::Communication(printlink_core::event_bus::CommunicationEvent::LineReceived { line })
            if line == "echo:busy: processing"
    )) == 1)
    .await);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setters_send_once_and_announce_once() {
    let rig = Rig::connected(&[]).await;

    rig.link().set_target_extruder_temperature(0, 210.0);
    rig.link().set_fan_speed(128);
    assert!(wait_until(|| rig.position_of("M106 S128").is_some()).await);

    assert!(rig.position_of("M104 T0 S210").is_some());
    assert_eq!(rig.link().target_extruder_temperature(0), 210.0);
    assert_eq!(rig.link().fan_speed(), 128);
    assert_eq!(
        rig.count_events(|e| matches!(
            e,
            AppEvent::Machine(MachineEvent::ExtruderTemperatureSet { celsius, .. }) if *celsius == 210.0
        )),
        1
    );

    // commands typed by hand are tracked too
    rig.link().send_line_now("M140 S65\nM107");
    assert!(wait_until(|| rig.link().target_bed_temperature() == 65.0).await);
    assert!(wait_until(|| rig.link().fan_speed() == 0).await);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_moves_track_destination() {
    let rig = Rig::connected(&[]).await;
    use printlink_communication::Axis;

    rig.link().move_absolute(Axis::X, 50.0, 3000.0);
    rig.link().move_relative(Axis::Z, 2.5, 600.0);
    assert!(wait_until(|| rig.link().current_destination() == Position::new(50.0, 0.0, 2.5)).await);

    assert!(wait_until(|| rig.commands().ends_with(&[
        "G91".to_string(),
        "G1 F600".to_string(),
        "G1 Z2.5".to_string(),
        "G90".to_string(),
    ]))
    .await);
    assert!(rig.position_of("G1 X50").is_some());

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_waits_for_ack() {
    let rig = Rig::connected(&[]).await;
    rig.silence();
    rig.port.clear_written();

    rig.link().send_line_now("M117 A");
    rig.link().send_line_now("M117 B");
    assert!(wait_until(|| rig.port.written().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.commands(), vec!["M117 A"]);
    assert_eq!(rig.link().queued_command_count(), 1);

    rig.port.push_incoming("ok\n");
    assert!(wait_until(|| rig.commands() == vec!["M117 A", "M117 B"]).await);

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unacknowledged_move_is_resent_after_motion_timeout() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();

    let withheld = Arc::new(AtomicBool::new(false));
    let flag = withheld.clone();
    rig.port.set_responder(move |line| {
        if unframe(line) == "G1\tX3 F6000" && !flag.swap(true, Ordering::SeqCst) {
            Vec::new()
        } else {
            vec!["ok".to_string()]
        }
    });
    // lower case and tab separated moves still count as motion
    let lines: Vec<String> = (1..=8).map(|i| format!("g1\tx{} f6000", i)).collect();
    let _file = rig.start_program(&lines).await;

    assert!(wait_until(|| rig.sequences().len() == 4).await);
    rig.settle().await;
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4]);

    // short moves are given the five second minimum
    rig.clock.advance_secs(4);
    rig.settle().await;
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4]);

    // well short of the silence timeouts
    rig.clock.advance_secs(2);
    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(rig.sequences(), vec![1, 2, 3, 4, 4, 5, 6, 7, 8, 9]);
    assert_eq!(
        rig.count_events(|e| matches!(e, AppEvent::Error(ErrorEvent::AckTimeout { .. }))),
        1
    );

    rig.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resend_of_evicted_line_restarts_from_oldest_retained() {
    let rig = Rig::connected(&[]).await;
    rig.port.clear_written();

    let asked = Arc::new(AtomicBool::new(false));
    let flag = asked.clone();
    rig.port.set_responder(move |line| {
        if line.starts_with("N20 ") && !flag.swap(true, Ordering::SeqCst) {
            vec!["Resend: 2".to_string(), "ok".to_string()]
        } else {
            vec!["ok".to_string()]
        }
    });
    let _file = rig.start_program(&program(30)).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    let expected: Vec<usize> = (1..=20).chain(5..=20).chain(21..=31).collect();
    assert_eq!(rig.sequences(), expected);
    assert_eq!(
        rig.count_events(|e| matches!(
            e,
            AppEvent::Error(ErrorEvent::ProtocolDesync {
                requested: 2,
                oldest_retained: 5
            })
        )),
        1
    );

    rig.shutdown().await;
}

/// Follows the third program line with two extra lines
struct ExpandThirdLine;

impl LevelingTransform for ExpandThirdLine {
    fn name(&self) -> &str {
        "expand"
    }

    fn apply(&self, line: &str, _destination: Position, _mode: MovementMode) -> Vec<String> {
        if line == "M117 L3" {
            vec![
                line.to_string(),
                "M117 L3 EXTRA A".to_string(),
                "M117 L3 EXTRA B".to_string(),
            ]
        } else {
            vec![line.to_string()]
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leveling_expansion_is_framed_in_order() {
    let rig = Rig::connected(&[]).await;
    rig.link().set_leveling(Some(Arc::new(ExpandThirdLine)));
    rig.port.clear_written();
    let _file = rig.start_program(&program(5)).await;

    assert!(wait_until(|| rig.link().state() == CommunicationState::FinishedPrint).await);
    assert_eq!(rig.sequences(), (1..=8).collect::<Vec<_>>());
    assert_eq!(
        &rig.commands()[..8],
        &[
            "M110 S1",
            "M117 L1",
            "M117 L2",
            "M117 L3",
            "M117 L3 EXTRA A",
            "M117 L3 EXTRA B",
            "M117 L4",
            "M117 L5",
        ]
    );
    assert_eq!(rig.link().total_program_lines(), 7);

    rig.shutdown().await;
}
