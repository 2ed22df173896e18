//! Session handles vended by the pool.

use crate::pool::Shared;
use crate::worker::{Worker, WorkerRecord};

use std::sync::{Arc, Weak};

/// A single request/response exchange bound to a checked-out worker.
///
/// The handle owns the transport stream and holds its worker record only
/// weakly, so a worker retired while the session is in flight is freed as
/// soon as the pool drops it. Dropping the handle reports the close back
/// to the pool, which updates the worker's counters and either retires it
/// or returns it to the inactive list.
pub struct Session<W: Worker> {
    stream: Option<W::Stream>,
    record: Weak<WorkerRecord<W>>,
    shared: Arc<Shared<W>>,
    identifier: Arc<str>,
    pid: u32,
}

impl<W: Worker> Session<W> {
    pub(crate) fn new(
        stream: W::Stream,
        record: &Arc<WorkerRecord<W>>,
        shared: Arc<Shared<W>>,
    ) -> Self {
        Self {
            stream: Some(stream),
            record: Arc::downgrade(record),
            shared,
            identifier: record.ident().clone(),
            pid: record.worker().pid(),
        }
    }

    /// The transport stream carrying this session.
    pub fn stream(&self) -> &W::Stream {
        self.stream.as_ref().unwrap()
    }

    pub fn stream_mut(&mut self) -> &mut W::Stream {
        self.stream.as_mut().unwrap()
    }

    /// Identifier of the worker serving this session.
    pub fn worker_identifier(&self) -> &str {
        &self.identifier
    }

    /// OS process id of the worker serving this session.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl<W: Worker> Drop for Session<W> {
    fn drop(&mut self) {
        // Close the transport before the pool hands the worker out again.
        self.stream = None;
        self.shared.session_closed(&self.record);
    }
}
