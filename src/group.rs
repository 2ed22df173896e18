//! Per-application-root worker groups.

use crate::list::TokenList;
use crate::options::PoolOptions;
use crate::restart::RestartWitness;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Marker shared between a group and its background spawner.
///
/// Teardown flips `detached` once; a spawner that raced teardown (or whose
/// group key has since been taken by a newly created group) sees the flag
/// and discards its worker instead of installing it.
#[derive(Debug)]
pub(crate) struct GroupTag {
    detached: AtomicBool,
}

impl GroupTag {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            detached: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

/// The pool's bundle of workers sharing an app group name.
pub(crate) struct Group {
    pub(crate) name: Arc<str>,
    pub(crate) app_root: PathBuf,

    /// Worker identifiers in checkout order. Idle workers form the prefix,
    /// workers with open sessions the suffix.
    pub(crate) workers: TokenList<Arc<str>>,

    pub(crate) max_requests: u64,
    pub(crate) min_processes: usize,
    pub(crate) environment: String,

    /// At most one background spawner runs per group.
    pub(crate) spawning: bool,
    pub(crate) spawner: Option<JoinHandle<()>>,

    pub(crate) tag: Arc<GroupTag>,
    pub(crate) restart_witness: RestartWitness,
}

impl Group {
    pub(crate) fn new(name: Arc<str>, app_root: &Path, options: &PoolOptions) -> Self {
        Self {
            name,
            app_root: app_root.to_path_buf(),
            workers: TokenList::new(),
            max_requests: options.max_requests,
            min_processes: options.min_processes,
            environment: options.environment.clone(),
            spawning: false,
            spawner: None,
            tag: GroupTag::new(),
            restart_witness: RestartWitness::observe(app_root, options),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Re-applies the caller's group-level options; the most recent
    /// checkout wins.
    pub(crate) fn apply_options(&mut self, options: &PoolOptions) {
        self.max_requests = options.max_requests;
        self.min_processes = options.min_processes;
        if self.environment != options.environment {
            self.environment = options.environment.clone();
        }
    }
}
