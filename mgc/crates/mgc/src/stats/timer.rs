//! GC Timer - Timing Utilities
//!
//! Timing for collection cycles and incremental step budgets.

use std::time::{Duration, Instant};

/// GcTimer - timer for measuring GC operations
#[derive(Debug, Clone, Copy)]
pub struct GcTimer {
    start: Instant,
}

impl GcTimer {
    /// Start timing now
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed nanoseconds
    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed().as_nanos() as u64
    }

    /// Get elapsed milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Check whether `budget` has been used up
    pub fn exceeded(&self, budget: Duration) -> bool {
        self.elapsed() >= budget
    }
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::start()
    }
}
