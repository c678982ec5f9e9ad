// Benchmarks for the per-line hot path: framing, parsing and program load
// Run with: cargo bench -p printlink-communication

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use printlink_communication::printer::{GcodeProgram, MotionTracker};
use printlink_communication::protocol::parse::{parse_temperatures, first_number_after};
use printlink_communication::protocol::{frame_line, ChecksumLedger};

fn bench_framing(c: &mut Criterion) {
    let lines: Vec<String> = (0..10_000)
        .map(|i| format!("G1 X{} Y{} E{} F1500", i % 200, (i * 7) % 200, i as f64 * 0.05))
        .collect();
    c.bench_function("frame and record 10k lines", |b| {
        b.iter(|| {
            let mut ledger = ChecksumLedger::new();
            for line in &lines {
                let framed = frame_line(ledger.next_sequence(), line);
                ledger.add(framed);
            }
            assert_eq!(ledger.count(), 10_000);
        });
    });
}

fn bench_transforms(c: &mut Criterion) {
    let lines: Vec<String> = (0..10_000)
        .map(|i| format!("G1 X{} Y{} E{:.3} F1800", i % 200, (i * 3) % 200, i as f64 * 0.05))
        .collect();
    c.bench_function("extrusion and feed scaling over 10k moves", |b| {
        b.iter(|| {
            let mut motion = MotionTracker::new();
            motion.set_extrusion_ratio(0.95);
            motion.set_feed_rate_ratio(1.2);
            for line in &lines {
                let scaled = motion.apply_extrusion_ratio(line);
                let scaled = motion.apply_feed_rate_ratio(&scaled);
                black_box(motion.track_destination(&scaled));
            }
        });
    });
}

fn bench_status_parsing(c: &mut Criterion) {
    let report = "ok T:210.12 /210.00 B:60.03 /60.00 T0:210.12 /210.00 T1:25.00 /0.00 @:64 B@:0";
    c.bench_function("parse temperature report", |b| {
        b.iter(|| {
            let parsed = parse_temperatures(black_box(report));
            assert_eq!(parsed.bed, Some(60.03));
        });
    });
    c.bench_function("find number after key", |b| {
        b.iter(|| first_number_after(black_box("E"), black_box("G1 X10.5 Y20.25 E3.14159 F1200")));
    });
}

fn bench_program_load(c: &mut Criterion) {
    let mut gcode = String::new();
    gcode.push_str("G90\nM82\nG28\n");
    for i in 0..20_000 {
        gcode.push_str(&format!("G1 X{} Y{} E{:.4} F{}\n", i % 220, (i * 5) % 220, i as f64 * 0.03, 1200 + i % 600));
    }
    c.bench_function("parse and time 20k line program", |b| {
        b.iter(|| {
            let program = GcodeProgram::parse(black_box(&gcode));
            assert_eq!(program.len(), 20_003);
        });
    });
}

criterion_group!(
    benches,
    bench_framing,
    bench_transforms,
    bench_status_parsing,
    bench_program_load
);
criterion_main!(benches);
