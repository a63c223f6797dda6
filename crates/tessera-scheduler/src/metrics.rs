//! Per-timestep scheduler metrics.

use tessera_core::{PatchId, TimestepId};

/// Timing and traffic collected during one timestep on one rank.
///
/// All durations are in microseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimestepMetrics {
    /// The timestep these metrics describe.
    pub timestep: TimestepId,
    /// Wall-clock time for the whole timestep.
    pub total_us: u64,
    /// Per-instance body times: `(task, patch, microseconds)`, in
    /// execution order.
    pub task_us: Vec<(String, PatchId, u64)>,
    /// Remote fetches issued before task dispatch.
    pub remote_fetches: u64,
    /// Time spent waiting for those fetches.
    pub fetch_wait_us: u64,
    /// Reductions combined across ranks.
    pub reductions: u64,
    /// Variables copied by carry-forward.
    pub carried_forward: u64,
    /// Carried `(label, patch)` keys whose owner changed this timestep.
    pub migrated: u64,
}

impl TimestepMetrics {
    /// Number of task instances this rank ran.
    pub fn tasks_run(&self) -> usize {
        self.task_us.len()
    }
}
