//! Per-checkout options recognized by the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options supplied with every [`crate::pool::Pool::get`] call.
///
/// Group-level fields (`max_requests`, `min_processes`, `environment`) are
/// re-applied to the group on every checkout, so the most recent caller's
/// configuration wins.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Key under which workers for this application are grouped. Defaults
    /// to the application root when unset.
    pub app_group_name: Option<String>,

    /// Number of sessions after which a worker is retired. Zero means
    /// unlimited.
    pub max_requests: u64,

    /// Floor on the group's worker count, respected by the idle cleaner
    /// and used to warm-spawn workers in the background.
    pub min_processes: usize,

    /// When all workers are busy, wait for any worker to free up instead
    /// of queueing more sessions onto the least-busy worker.
    pub use_global_queue: bool,

    /// Where to look for `restart.txt` / `always_restart.txt`. Unset means
    /// `<app_root>/tmp`; a relative path is resolved against the
    /// application root.
    pub restart_dir: Option<PathBuf>,

    /// Opaque environment tag recorded on the group (e.g. "production").
    pub environment: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            app_group_name: None,
            max_requests: 0,
            min_processes: 1,
            use_global_queue: false,
            restart_dir: None,
            environment: "production".to_string(),
        }
    }
}

impl PoolOptions {
    /// The group key this checkout routes to.
    pub(crate) fn group_key(&self, app_root: &Path) -> Arc<str> {
        match &self.app_group_name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::from(app_root.to_string_lossy().as_ref()),
        }
    }
}
