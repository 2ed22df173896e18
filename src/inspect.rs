//! Immutable snapshots of pool state for administrative queries.
//!
//! Snapshots are taken under the pool's lock, so the numbers in a single
//! snapshot are mutually consistent. No worker handles escape through
//! them.

use std::path::PathBuf;
use std::time::Duration;

/// Point-in-time view of the whole pool.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolSnapshot {
    /// Workers across all groups.
    pub count: usize,
    /// Workers with at least one open session.
    pub active: usize,
    pub max: usize,
    pub max_per_app: usize,
    /// Checkout callers parked in global-queue mode.
    pub global_queue_waiting: usize,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GroupSnapshot {
    pub name: String,
    pub app_root: PathBuf,
    pub environment: String,
    pub size: usize,
    pub min_processes: usize,
    pub max_requests: u64,
    /// Whether a background spawner is currently running for this group.
    pub spawning: bool,
    /// Workers in list order: idle prefix first, then busy workers.
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WorkerSnapshot {
    pub identifier: String,
    pub pid: u32,
    /// Currently open sessions.
    pub sessions: usize,
    /// Completed sessions over the worker's lifetime.
    pub processed: u64,
    pub uptime: Duration,
    /// Time since the last session open or close.
    pub since_last_used: Duration,
    pub server_sockets: Vec<String>,
}
