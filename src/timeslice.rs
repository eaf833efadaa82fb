//! Cooperative time-slicing.
//!
//! The pipeline is single-threaded: long iterations surrender control by
//! emitting a `Yield` sentinel instead of blocking the host. A [`TimeSlice`]
//! decides when that happens (a lap threshold, 200 ms by default) and
//! enforces an optional wall-clock budget by raising a cancellation error
//! that unwinds iterators through their finalisers.

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::error::LiteTrickleError;

/// A lap clock driving `should_yield` plus an optional hard budget.
#[derive(Debug)]
pub struct TimeSlice {
    started: Instant,
    last_lap: Cell<Instant>,
    lap: Duration,
    budget: Option<Duration>,
}

impl TimeSlice {
    pub fn new(lap: Duration) -> Self {
        let now = Instant::now();
        TimeSlice {
            started: now,
            last_lap: Cell::new(now),
            lap,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Whether the current lap has run long enough that the caller should
    /// emit a `Yield`. Resets the lap when it answers yes.
    pub fn should_yield(&self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_lap.get()) >= self.lap {
            self.last_lap.set(now);
            true
        } else {
            false
        }
    }

    /// Raise a cancellation error when the wall-clock budget is exhausted.
    pub fn check_budget(&self) -> Result<(), LiteTrickleError> {
        if let Some(budget) = self.budget {
            let elapsed = self.started.elapsed();
            if elapsed > budget {
                return Err(LiteTrickleError::Cancelled(format!(
                    "wall-clock budget of {}ms exhausted after {}ms",
                    budget.as_millis(),
                    elapsed.as_millis()
                )));
            }
        }
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for TimeSlice {
    fn default() -> Self {
        TimeSlice::new(Duration::from_millis(200))
    }
}
