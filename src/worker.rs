//! Worker handles and the per-worker identity record.

use async_trait::async_trait;
use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A live application worker process.
///
/// The pool treats the handle as opaque: liveness is observable only
/// through [`Worker::open_session`] failing.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The transport stream vended by `open_session`, over which one
    /// request/response exchange runs.
    type Stream: Send + 'static;

    /// Opens a session on this worker.
    async fn open_session(&self) -> Result<Self::Stream, Error>;

    /// OS process id of the worker.
    fn pid(&self) -> u32;

    /// Asks the worker process to exit. Fire-and-forget; must not block.
    fn shutdown(&self);

    /// Addresses of the sockets the worker listens on, reported through
    /// the admin snapshot.
    fn server_sockets(&self) -> Vec<String> {
        Vec::new()
    }
}

const IDENTIFIER_LEN: usize = 16;

fn random_identifier() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(IDENTIFIER_LEN)
        .map(char::from)
        .collect()
}

/// Identity of a pooled worker, shared between the pool and open sessions.
///
/// All mutable bookkeeping (session counts, list positions) lives inside
/// the pool's lock; the record carries only immutable identity plus the
/// monotone `detached` flag. Sessions hold the record weakly, so a retired
/// record is dropped as soon as the pool lets go of it.
#[derive_where(Debug)]
pub struct WorkerRecord<W> {
    identifier: Arc<str>,
    group_key: Arc<str>,
    worker: DebugIgnore<Arc<W>>,
    started: Instant,
    detached: AtomicBool,
}

impl<W> WorkerRecord<W> {
    pub(crate) fn new(group_key: Arc<str>, worker: W) -> Arc<Self> {
        Arc::new(Self {
            identifier: Arc::from(random_identifier()),
            group_key,
            worker: DebugIgnore(Arc::new(worker)),
            started: Instant::now(),
            detached: AtomicBool::new(false),
        })
    }

    /// Globally unique, stable identifier for this worker. External
    /// observers use it to reference the worker without addresses.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn ident(&self) -> &Arc<str> {
        &self.identifier
    }

    pub(crate) fn group_key(&self) -> &Arc<str> {
        &self.group_key
    }

    pub(crate) fn worker(&self) -> &Arc<W> {
        &self.worker.0
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Optimistic read of the detach flag. The flag only ever goes from
    /// false to true, so a `true` seen without the lock is final; the
    /// authoritative read is under the pool lock.
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }
}
