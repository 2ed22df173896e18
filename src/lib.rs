//! appool is a worker-process pooling crate.
//!
//! appool manages long-lived application worker processes on behalf of a
//! front-end dispatcher. It uses the following terminology:
//! * Applications are identified by an application root, the directory of
//!   a deployable unit.
//! * Groups bundle the workers serving one application root (or, more
//!   precisely, one app group name).
//! * Workers are long-lived processes able to serve sessions; a session is
//!   a single request/response exchange over a connection to a worker.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [spawn::SpawnEngine]. This is
//!   the interface which specifies "how to launch a worker process for an
//!   application root"; the workers it produces implement
//!   [worker::Worker], which specifies "how to open sessions on a worker".
//!
//! A checkout ([pool::Pool::get]) hands back a [session::Session] bound to
//! some worker: an existing idle one when possible, a freshly spawned one
//! when the group is new, and otherwise the least busy one while more
//! workers spawn in the background. Dropping the session returns the
//! worker to the pool.
//!
//! Idle workers are shut down after a configurable idle time, workers are
//! retired after a configurable number of sessions, and a group's workers
//! are torn down and respawned when the application's restart file is
//! touched.

// Public API
pub mod inspect;
pub mod options;
pub mod policy;
pub mod pool;
pub mod session;
pub mod spawn;
pub mod worker;

// Necessary for implementation
mod cleaner;
mod group;
mod list;
mod restart;
mod spawner;
#[cfg(test)]
mod test_utils;
