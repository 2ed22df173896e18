//! The idle-time worker cleaner.

use crate::pool::Shared;
use crate::worker::Worker;

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tracing::debug;

/// Reads the tunables needed to wait for the next cleaner pass and
/// registers interest in the wakeup notification, all while the pool's
/// lock is held so a wakeup firing right after this call is never missed.
/// Returns `None` if the pool has shut down.
///
/// This is a plain (non-async) function so the `MutexGuard` it holds never
/// appears as a local inside `run`'s generated future, which must be
/// `Send` even though `MutexGuard` is not.
fn prepare_wait<W: Worker>(shared: &Shared<W>) -> Option<(Duration, Pin<Box<Notified<'_>>>)> {
    let guard = shared.state();
    if guard.shutdown {
        return None;
    }
    let idle_limit = guard.max_idle_time;
    let mut notified = Box::pin(shared.cleaner_wakeup.notified());
    notified.as_mut().enable();
    drop(guard);
    Some((idle_limit, notified))
}

/// Background task evicting workers that sat idle past the pool's
/// `max_idle_time`, oldest first, down to each group's `min_processes`
/// floor. Only workers on the inactive list are considered, so a worker
/// with open sessions is never touched.
pub(crate) async fn run<W: Worker>(shared: Arc<Shared<W>>) {
    loop {
        let Some((idle_limit, notified)) = prepare_wait(&shared) else {
            return;
        };

        eprintln!("CLEANER tick idle_limit={:?}", idle_limit);
        if idle_limit.is_zero() {
            // Cleanup disabled; park until shutdown or a tunable change.
            notified.await;
            continue;
        }
        tokio::select! {
            // Shutdown or a tunable change; re-read the configuration.
            _ = notified => { eprintln!("CLEANER notified, restart"); continue },
            _ = tokio::time::sleep(idle_limit) => { eprintln!("CLEANER slept"); }
        }

        let mut victims = Vec::new();
        {
            let mut guard = shared.state();
            let state = &mut *guard;
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            eprintln!("CLEANER inactive={:?}", state.inactive.iter().map(|(_, id)| (id.clone(), now - state.workers[id].last_used)).collect::<Vec<_>>());
            // The inactive list is ordered oldest-first, so this bites the
            // stalest workers first.
            let expired: Vec<Arc<str>> = state
                .inactive
                .iter()
                .filter(|(_, ident)| now - state.workers[*ident].last_used > idle_limit)
                .map(|(_, ident)| ident.clone())
                .collect();
            for ident in expired {
                let above_floor = {
                    let Some(entry) = state.workers.get(&ident) else {
                        continue;
                    };
                    match state.groups.get(entry.record.group_key()) {
                        Some(group) => group.size() > group.min_processes,
                        None => false,
                    }
                };
                if !above_floor {
                    continue;
                }
                if let Some(worker) = shared.remove_idle_worker(state, &ident) {
                    debug!(identifier = %ident, "shutting down idle worker");
                    victims.push(worker);
                }
            }
            state.verify();
        }
        for worker in victims {
            worker.shutdown();
        }
    }
}
