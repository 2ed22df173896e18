//! Process-wide limits applicable to the whole pool.

use std::time::Duration;

/// Capacity and lifecycle limits for a [`crate::pool::Pool`].
///
/// Every field can also be changed at runtime through the pool's setters;
/// changes take effect immediately and wake any waiters they may unblock.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The maximum number of workers across all groups. Lowering this below
    /// the current worker count is tolerated; the pool shrinks as workers
    /// retire or idle out.
    pub max: usize,

    /// The maximum number of workers a single group may grow to through
    /// background spawning. Zero means unlimited.
    pub max_per_app: usize,

    /// Workers idle longer than this are shut down, down to each group's
    /// `min_processes`. Zero disables idle cleanup.
    pub max_idle_time: Duration,

    /// How many consecutive session-open failures `get` absorbs (detaching
    /// the crashed worker and retrying) before surfacing the error.
    pub max_attempts: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max: 6,
            max_per_app: 0,
            max_idle_time: Duration::from_secs(300),
            max_attempts: 10,
        }
    }
}
