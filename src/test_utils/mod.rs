//! Utilities to help with testing the pool.

use crate::options::PoolOptions;
use crate::spawn::{self, SpawnEngine};
use crate::worker::{self, Worker};

use anyhow::anyhow;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scriptable engine whose workers carry no real process.
///
/// Failure injection is driven through atomics so tests can reconfigure
/// the engine while the pool is running.
pub(crate) struct StubEngine {
    spawn_delay_ms: AtomicU64,
    /// Fail this many upcoming spawn attempts.
    failing_spawns: AtomicU32,
    /// Every new worker refuses this many session opens before accepting.
    refusals_per_worker: AtomicU32,
    /// One-shot: only the next spawned worker refuses this many opens.
    next_worker_refusals: AtomicU32,
    spawns: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    reloads: Mutex<Vec<String>>,
    next_pid: AtomicU32,
}

impl StubEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            spawn_delay_ms: AtomicU64::new(1),
            failing_spawns: AtomicU32::new(0),
            refusals_per_worker: AtomicU32::new(0),
            next_worker_refusals: AtomicU32::new(0),
            spawns: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            reloads: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
        })
    }

    /// Type-erased handle in the shape the pool wants.
    pub(crate) fn shared(self: &Arc<Self>) -> spawn::SharedEngine<StubWorker> {
        Arc::clone(self) as _
    }

    /// Makes every spawn attempt take this long.
    pub(crate) fn set_spawn_delay_ms(&self, ms: u64) {
        self.spawn_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Makes the next `n` spawn attempts fail.
    pub(crate) fn fail_next_spawns(&self, n: u32) {
        self.failing_spawns.store(n, Ordering::SeqCst);
    }

    /// Every worker spawned from now on refuses its first `n` session
    /// opens.
    pub(crate) fn refuse_sessions_per_worker(&self, n: u32) {
        self.refusals_per_worker.store(n, Ordering::SeqCst);
    }

    /// Only the next spawned worker refuses its first `n` session opens.
    pub(crate) fn refuse_next_worker_sessions(&self, n: u32) {
        self.next_worker_refusals.store(n, Ordering::SeqCst);
    }

    /// Successful spawns so far.
    pub(crate) fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Worker shutdowns observed so far.
    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Group names the pool asked us to reload, in order.
    pub(crate) fn reloads(&self) -> Vec<String> {
        self.reloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpawnEngine for StubEngine {
    type Worker = StubWorker;

    async fn spawn(
        &self,
        _app_root: &Path,
        _options: &PoolOptions,
    ) -> Result<StubWorker, spawn::Error> {
        let delay = self.spawn_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self.failing_spawns.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_spawns.store(failing - 1, Ordering::SeqCst);
            return Err(spawn::Error::Other(anyhow!("spawn server refused to fork")));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let refusals = match self.next_worker_refusals.swap(0, Ordering::SeqCst) {
            0 => self.refusals_per_worker.load(Ordering::SeqCst),
            n => n,
        };
        Ok(StubWorker {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            refusals: AtomicU32::new(refusals),
            shutdowns: Arc::clone(&self.shutdowns),
        })
    }

    fn reload(&self, app_group_name: &str) {
        self.reloads.lock().unwrap().push(app_group_name.to_string());
    }

    async fn backtraces(&self) -> String {
        "stub engine: no threads".to_string()
    }
}

pub(crate) struct StubWorker {
    pid: u32,
    refusals: AtomicU32,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for StubWorker {
    type Stream = ();

    async fn open_session(&self) -> Result<(), worker::Error> {
        let left = self.refusals.load(Ordering::SeqCst);
        if left > 0 {
            self.refusals.store(left - 1, Ordering::SeqCst);
            return Err(worker::Error::Other(anyhow!("connection refused")));
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
