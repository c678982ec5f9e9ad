//! The program being streamed
//!
//! A [`GcodeProgram`] is an ordered list of [`ProgramLine`]s with a time
//! estimate per line and the running total to the end, used for ETA and for
//! deciding how long an unacknowledged move may take.

use super::transforms::is_move;
use crate::protocol::parse::first_number_after;
use printlink_core::{MovementMode, Position};

/// One instruction of the active program
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramLine {
    /// Raw text as loaded or injected
    pub text: String,
    /// Coordinate mode in force for this line
    pub movement: MovementMode,
    /// Estimated time to execute this line
    pub seconds_this_line: f64,
    /// Estimated time from the start of this line to the end of the program
    pub seconds_to_end: f64,
}

impl ProgramLine {
    /// Line injected next to `neighbor`, sharing its mode and remaining time
    pub fn injected(text: impl Into<String>, neighbor: Option<&ProgramLine>) -> Self {
        Self {
            text: text.into(),
            movement: neighbor.map(|n| n.movement).unwrap_or_default(),
            seconds_this_line: 0.0,
            seconds_to_end: neighbor.map(|n| n.seconds_to_end).unwrap_or(0.0),
        }
    }
}

/// Ordered, editable program
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcodeProgram {
    lines: Vec<ProgramLine>,
}

impl GcodeProgram {
    /// Empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a program and estimate its timing
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut estimator = TimeEstimator::default();
        let mut lines: Vec<ProgramLine> = lines
            .into_iter()
            .map(|text| {
                let text = text.into();
                let (movement, seconds) = estimator.step(&text);
                ProgramLine {
                    text,
                    movement,
                    seconds_this_line: seconds,
                    seconds_to_end: 0.0,
                }
            })
            .collect();

        let mut remaining = 0.0;
        for line in lines.iter_mut().rev() {
            remaining += line.seconds_this_line;
            line.seconds_to_end = remaining;
        }
        Self { lines }
    }

    /// Parse program text
    pub fn parse(text: &str) -> Self {
        Self::from_lines(text.lines().map(|l| l.trim_end_matches('\r')))
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether there are no lines
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line at `index`
    pub fn get(&self, index: usize) -> Option<&ProgramLine> {
        self.lines.get(index)
    }

    /// Text of the line at `index`
    pub fn text(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(|l| l.text.as_str())
    }

    /// Insert a line before `index`, or append when `index` is past the end
    pub fn insert(&mut self, index: usize, text: impl Into<String>) {
        if index < self.lines.len() {
            let line = ProgramLine::injected(text, self.lines.get(index));
            self.lines.insert(index, line);
        } else {
            let line = ProgramLine::injected(text, None);
            self.lines.push(line);
        }
    }

    /// Drop every line
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Total estimated time
    pub fn total_seconds(&self) -> f64 {
        self.lines.first().map(|l| l.seconds_to_end).unwrap_or(0.0)
    }

    /// Slowest estimated line among the `backlog` lines before `cursor`
    pub fn max_seconds_before(&self, cursor: usize, backlog: usize) -> f64 {
        let end = cursor.min(self.lines.len());
        self.lines[end.saturating_sub(backlog)..end]
            .iter()
            .map(|l| l.seconds_this_line)
            .fold(0.0, f64::max)
    }

    /// Percent of the program done when `cursor` lines are sent
    pub fn percent_complete(&self, cursor: usize) -> f64 {
        if self.lines.is_empty() {
            return 0.0;
        }
        let total = self.total_seconds();
        if total > 0.0 {
            let remaining = self.lines.get(cursor).map(|l| l.seconds_to_end).unwrap_or(0.0);
            ((total - remaining) / total * 100.0).clamp(0.0, 100.0)
        } else {
            (cursor.min(self.lines.len()) as f64 / self.lines.len() as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct TimeEstimator {
    mode: MovementMode,
    position: Position,
    feed_rate_mm_per_min: f64,
}

impl TimeEstimator {
    fn step(&mut self, line: &str) -> (MovementMode, f64) {
        let code = line.split(';').next().unwrap_or("").trim().to_uppercase();
        if code.starts_with("G90") {
            self.mode = MovementMode::Absolute;
        } else if code.starts_with("G91") {
            self.mode = MovementMode::Relative;
        }

        let mut seconds = 0.0;
        if is_move(&code) {
            if let Some(feed) = first_number_after("F", &code) {
                self.feed_rate_mm_per_min = feed;
            }
            let axis = |key: &str, current: f64| match (first_number_after(key, &code), self.mode) {
                (Some(v), MovementMode::Absolute) => v,
                (Some(v), MovementMode::Relative) => current + v,
                (None, _) => current,
            };
            let target = Position::new(
                axis("X", self.position.x),
                axis("Y", self.position.y),
                axis("Z", self.position.z),
            );
            let distance = ((target.x - self.position.x).powi(2)
                + (target.y - self.position.y).powi(2)
                + (target.z - self.position.z).powi(2))
            .sqrt();
            if self.feed_rate_mm_per_min > 0.0 {
                seconds = distance / (self.feed_rate_mm_per_min / 60.0);
            }
            self.position = target;
        } else if code.starts_with("G28") {
            self.position = Position::zero();
        }
        (self.mode, seconds)
    }
}
