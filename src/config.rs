//! Engine configuration.
//!
//! Tunables controlling the pipeline's cooperative scheduling and resource
//! use. Hosts construct one [`EngineConfig`] per pipeline instance; the
//! defaults are production values.

use std::time::Duration;

/// Configuration for a pipeline/analyzer instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lap threshold for the cooperative time-slice. Fetch iterators emit a
    /// `Yield` sentinel once this much wall-clock time has passed since the
    /// last lap.
    pub yield_lap: Duration,

    /// High-water mark for the prepared-statement cache (LRU eviction).
    pub statement_cache_capacity: usize,

    /// Optional wall-clock budget for analyzer runs. When exceeded, the
    /// time-slice raises a cancellation error that unwinds the pipeline.
    pub analyze_budget: Option<Duration>,

    /// Maximum number of plan attempts the planner will explore before
    /// settling for the best seen so far. Guards against pathological ASTs
    /// with many flippable joins.
    pub max_plan_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            yield_lap: Duration::from_millis(200),
            statement_cache_capacity: 64,
            analyze_budget: None,
            max_plan_attempts: 1024,
        }
    }
}
