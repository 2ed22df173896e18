//! The per-group background spawner task.

use crate::group::GroupTag;
use crate::options::PoolOptions;
use crate::pool::Shared;
use crate::worker::Worker;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Spawns workers for one group until its `min_processes` floor is met or
/// capacity runs out.
///
/// Cancellation is `JoinHandle::abort`: the only await point is the
/// spawn-engine call, so the install step below can never be interrupted
/// midway. The group tag is re-checked under the lock before installing,
/// which covers the window where teardown raced a completed spawn.
pub(crate) async fn run<W: Worker>(
    shared: Arc<Shared<W>>,
    group_key: Arc<str>,
    app_root: PathBuf,
    options: PoolOptions,
    tag: Arc<GroupTag>,
) {
    loop {
        let spawned = shared.engine.spawn(&app_root, &options).await;

        let mut guard = shared.state();
        let state = &mut *guard;
        match spawned {
            Ok(worker) => {
                if tag.is_detached() {
                    // The group was torn down while we were spawning.
                    drop(guard);
                    worker.shutdown();
                    return;
                }
                let done = shared.install_background(state, &group_key, &options, worker);
                debug!(group = %group_key, "installed background-spawned worker");
                if done {
                    return;
                }
            }
            Err(err) => {
                if !tag.is_detached() {
                    // Consume the failure by detaching the group: the next
                    // checkout takes the fresh-group path and surfaces the
                    // error to a caller that can actually receive it.
                    if let Some(group) = state.groups.get_mut(&group_key) {
                        group.spawning = false;
                        group.spawner = None;
                    }
                    shared.detach_group(state, &group_key);
                    state.verify();
                }
                drop(guard);
                warn!(
                    group = %group_key,
                    error = %err,
                    "background spawn failed, detaching group"
                );
                return;
            }
        }
    }
}
