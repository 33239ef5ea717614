//! GC Timer - Phase Timing
//!
//! Measures a whole pause and, with `lap()`, each phase inside it.

use std::time::{Duration, Instant};

/// GcTimer - timer for one collection
pub struct GcTimer {
    start: Instant,
    lap: Instant,
}

impl GcTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            lap: now,
        }
    }

    /// Time since the timer was created
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time since the previous lap (or creation), restarting the lap
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let lap = now - self.lap;
        self.lap = now;
        lap
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed().as_nanos() as u64
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::new()
    }
}
