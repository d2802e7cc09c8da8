//! Cumulative counters for the driver adapter.
//!
//! [`DriverMetrics`] is owned by the [`Driver`](crate::driver::Driver) and
//! updated on the driver thread; read it between cycles.

/// Counters collected across driver cycles.
///
/// All counts are cumulative since the driver was created, except
/// `last_gather_us` which describes the most recent `before_step`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverMetrics {
    /// Number of `before_step` calls.
    pub cycles: u64,
    /// Cycles whose gate was `Advance`.
    pub advanced: u64,
    /// Cycles whose gate was `Hold` because an active environment was idle.
    pub held: u64,
    /// Pre-step hooks that completed successfully.
    pub pre_tasks_run: u64,
    /// Post-step hooks that completed successfully.
    pub post_tasks_run: u64,
    /// Hook invocations that returned a task failure.
    pub task_failures: u64,
    /// Active environments that had no request within the gather budget.
    pub gather_timeouts: u64,
    /// Environments closed by the driver after a hook panicked.
    pub quarantined: u64,
    /// Closures drained from the host queue.
    pub deferred_run: u64,
    /// Wall-clock time of the last gather phase, in microseconds.
    pub last_gather_us: u64,
}

impl DriverMetrics {
    /// Fraction of cycles that advanced. `0.0` before the first cycle.
    pub fn advance_ratio(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.advanced as f64 / self.cycles as f64
        }
    }
}
