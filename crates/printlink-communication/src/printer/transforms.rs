//! Per-line motion transforms
//!
//! Every program line passes through these before it is framed: extrusion
//! scaling, feed-rate scaling and destination bookkeeping, in that order.

use crate::protocol::parse::{first_number_after, format_number, replace_number_after};
use printlink_core::{MovementMode, Position};

/// Running motion state of the printer as commanded by the host
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTracker {
    extrusion_ratio: f64,
    feed_rate_ratio: f64,
    movement_mode: MovementMode,
    extruder_mode: MovementMode,
    destination: Position,
    extruder_destination: f64,
    feed_rate: f64,
    requested_extrusion: f64,
    actual_extrusion: f64,
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self {
            extrusion_ratio: 1.0,
            feed_rate_ratio: 1.0,
            movement_mode: MovementMode::Absolute,
            extruder_mode: MovementMode::Absolute,
            destination: Position::zero(),
            extruder_destination: 0.0,
            feed_rate: 0.0,
            requested_extrusion: 0.0,
            actual_extrusion: 0.0,
        }
    }
}

/// Letter and number of the command word, ignoring case and leading space
pub(crate) fn command_word(line: &str) -> Option<(char, u32)> {
    let mut chars = line.trim_start().chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    Some((letter, digits.parse().ok()?))
}

/// `G0` or `G1`
pub(crate) fn is_move(line: &str) -> bool {
    matches!(command_word(line), Some(('G', 0 | 1)))
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extrusion_ratio(&self) -> f64 {
        self.extrusion_ratio
    }

    pub fn set_extrusion_ratio(&mut self, ratio: f64) {
        self.extrusion_ratio = ratio;
    }

    pub fn feed_rate_ratio(&self) -> f64 {
        self.feed_rate_ratio
    }

    pub fn set_feed_rate_ratio(&mut self, ratio: f64) {
        self.feed_rate_ratio = ratio;
    }

    pub fn movement_mode(&self) -> MovementMode {
        self.movement_mode
    }

    pub fn set_movement_mode(&mut self, mode: MovementMode) {
        self.movement_mode = mode;
    }

    pub fn extruder_mode(&self) -> MovementMode {
        self.extruder_mode
    }

    pub fn set_extruder_mode(&mut self, mode: MovementMode) {
        self.extruder_mode = mode;
    }

    /// Last commanded destination
    pub fn destination(&self) -> Position {
        self.destination
    }

    /// Replace the destination, e.g. after the firmware reported where it is
    pub fn set_destination(&mut self, destination: Position) {
        self.destination = destination;
    }

    /// Last commanded extruder position
    pub fn extruder_destination(&self) -> f64 {
        self.extruder_destination
    }

    /// Last commanded feed rate in mm/min
    pub fn feed_rate(&self) -> f64 {
        self.feed_rate
    }

    /// Scale the `E` word of moves by the extrusion ratio
    ///
    /// The requested and actual extruder positions are tracked separately so
    /// that absolute extrusion keeps its meaning while the ratio changes
    /// mid-print. `G92 E` resynchronises both.
    pub fn apply_extrusion_ratio(&mut self, line: &str) -> String {
        let line = line.trim().to_uppercase();
        if is_move(&line) {
            if let Some(requested) = first_number_after("E", &line) {
                let delta = match self.extruder_mode {
                    MovementMode::Relative => requested,
                    MovementMode::Absolute => requested - self.requested_extrusion,
                };
                let scaled = delta * self.extrusion_ratio;
                let actual = self.actual_extrusion + scaled;
                self.requested_extrusion = requested;
                self.actual_extrusion = actual;
                let sent = match self.extruder_mode {
                    MovementMode::Relative => scaled,
                    MovementMode::Absolute => actual,
                };
                return replace_number_after('E', &line, sent);
            }
        } else if line.starts_with("G92") {
            if let Some(requested) = first_number_after("E", &line) {
                self.requested_extrusion = requested;
                self.actual_extrusion = requested;
            }
        }
        line
    }

    /// Scale the `F` word of moves by the feed-rate ratio
    pub fn apply_feed_rate_ratio(&self, line: &str) -> String {
        if self.feed_rate_ratio == 1.0 {
            return line.to_string();
        }
        let line = line.trim().to_uppercase();
        if is_move(&line) {
            if let Some(feed) = first_number_after("F", &line) {
                return replace_number_after('F', &line, feed * self.feed_rate_ratio);
            }
        }
        line
    }

    /// Follow `G0`/`G1` targets. Returns the new destination when it moved.
    pub fn track_destination(&mut self, line: &str) -> Option<Position> {
        if !is_move(line) {
            return None;
        }
        let base = match self.movement_mode {
            MovementMode::Absolute => self.destination,
            MovementMode::Relative => Position::zero(),
        };
        let mut target = Position::new(
            first_number_after("X", line).unwrap_or(base.x),
            first_number_after("Y", line).unwrap_or(base.y),
            first_number_after("Z", line).unwrap_or(base.z),
        );
        if let Some(e) = first_number_after("E", line) {
            self.extruder_destination = e;
        }
        if let Some(f) = first_number_after("F", line) {
            self.feed_rate = f;
        }
        if self.movement_mode == MovementMode::Relative {
            target = target.offset_by(self.destination);
        }

        if target != self.destination {
            self.destination = target;
            Some(target)
        } else {
            None
        }
    }

    /// The line that returns the head to the current destination
    pub fn restore_position_line(&self) -> String {
        format!(
            "G0 X{:.3} Y{:.3} Z{:.3} F{}",
            self.destination.x,
            self.destination.y,
            self.destination.z,
            format_number(self.feed_rate)
        )
    }
}
