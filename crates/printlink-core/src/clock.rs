//! Monotonic clocks and stopwatches.
//!
//! Every timeout in the printer link is a stopwatch compared against a
//! fixed threshold. Stopwatches read time through the [`Clock`] trait so
//! the same code runs against wall time in production and against a
//! hand-advanced [`ManualClock`] in tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic time, expressed as an offset from an arbitrary origin
pub trait Clock: Send + Sync {
    /// Current offset from the clock's origin
    fn now(&self) -> Duration;
}

/// Clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the moment of construction
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock at offset zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Move the clock forward by whole seconds
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Start/stop/reset stopwatch
///
/// `elapsed` accumulates across stop/start pairs until `reset` or
/// `restart` clears it.
#[derive(Clone)]
pub struct Stopwatch {
    clock: Arc<dyn Clock>,
    started_at: Option<Duration>,
    accumulated: Duration,
}

impl Stopwatch {
    /// Create a stopped stopwatch reading zero
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            started_at: None,
            accumulated: Duration::ZERO,
        }
    }

    /// Start or continue measuring
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(self.clock.now());
        }
    }

    /// Stop measuring, keeping the elapsed time
    pub fn stop(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.accumulated += self.clock.now().saturating_sub(started);
        }
    }

    /// Stop and clear
    pub fn reset(&mut self) {
        self.started_at = None;
        self.accumulated = Duration::ZERO;
    }

    /// Clear and start again from zero
    pub fn restart(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started_at = Some(self.clock.now());
    }

    /// Whether the stopwatch is measuring
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Total measured time
    pub fn elapsed(&self) -> Duration {
        match self.started_at {
            Some(started) => self.accumulated + self.clock.now().saturating_sub(started),
            None => self.accumulated,
        }
    }

    /// Total measured time in seconds
    pub fn elapsed_secs_f64(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

impl std::fmt::Debug for Stopwatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopwatch")
            .field("running", &self.is_running())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
