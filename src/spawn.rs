//! The interface for launching application worker processes.

use crate::options::PoolOptions;
use crate::worker::Worker;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Describes how worker processes are launched for an application root.
///
/// Engines may take arbitrary time in [`SpawnEngine::spawn`]; the pool never
/// holds its lock across that call, and background spawn attempts may be
/// cancelled while it is in flight.
#[async_trait]
pub trait SpawnEngine: Send + Sync {
    type Worker: Worker;

    /// Launches a new worker for the application at `app_root`.
    async fn spawn(&self, app_root: &Path, options: &PoolOptions)
        -> Result<Self::Worker, Error>;

    /// Tells the engine to drop any cached application code for a group.
    ///
    /// Invoked when a restart file trips, before the group's workers are
    /// torn down. Must not block; engines queue the work internally.
    fn reload(&self, app_group_name: &str) {
        let _ = app_group_name;
    }

    /// Opaque diagnostic dump of the engine's threads, for the admin
    /// channel. The pool passes it through without interpretation.
    async fn backtraces(&self) -> String {
        String::new()
    }

    /// Opaque human-readable description of the engine's state, for the
    /// admin channel.
    async fn inspect(&self) -> String {
        String::new()
    }
}

/// Helper type for anything that implements the SpawnEngine interface.
pub type SharedEngine<W> = Arc<dyn SpawnEngine<Worker = W>>;
