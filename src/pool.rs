//! The pool core: groups, counters, and the checkout state machine.
//!
//! All mutable state lives in [`PoolInner`] behind one mutex. The three
//! [`Notify`] instances play the role of condition variables: waiters
//! register interest while holding the lock, re-check their guard after
//! every wakeup, and restart the checkout loop, so spurious wakeups are
//! harmless. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleaner;
use crate::group::Group;
use crate::inspect::{GroupSnapshot, PoolSnapshot, WorkerSnapshot};
use crate::list::{Token, TokenList};
use crate::options::PoolOptions;
use crate::policy::Policy;
use crate::restart;
use crate::session::Session;
use crate::spawn::{self, SharedEngine};
use crate::spawner;
use crate::worker::{self, Worker, WorkerRecord};

#[derive(Error, Debug)]
pub enum Error {
    /// The spawn engine failed while a worker was being launched on behalf
    /// of this caller.
    #[error("failed to spawn a worker")]
    Spawn(#[source] spawn::Error),

    /// Every attempt found a worker that refused the session.
    #[error("workers refused {attempts} consecutive session-open attempts")]
    OpenSession {
        attempts: u32,
        #[source]
        source: worker::Error,
    },

    /// The pool is shutting down.
    #[error("pool terminated")]
    Terminated,
}

/// Mutable bookkeeping for one pooled worker. Only touched under the pool
/// lock; the shared identity lives in [`WorkerRecord`].
pub(crate) struct WorkerEntry<W> {
    pub(crate) record: Arc<WorkerRecord<W>>,
    /// Currently open sessions.
    pub(crate) sessions: usize,
    /// Completed sessions over the worker's lifetime.
    pub(crate) processed: u64,
    pub(crate) last_used: Instant,
    pub(crate) pos_in_group: Token,
    /// Valid exactly while `sessions == 0`.
    pub(crate) pos_in_inactive: Option<Token>,
}

pub(crate) struct PoolInner<W: Worker> {
    pub(crate) groups: HashMap<Arc<str>, Group>,
    pub(crate) workers: HashMap<Arc<str>, WorkerEntry<W>>,
    /// Idle workers across all groups, least recently used at the front.
    pub(crate) inactive: TokenList<Arc<str>>,

    /// Workers across all groups, including foreground spawns in flight.
    pub(crate) count: usize,
    /// Workers with at least one open session, ditto.
    pub(crate) active: usize,
    /// Foreground spawns currently holding a capacity reservation. The
    /// lock is released around the spawn-engine call, so admission
    /// decisions count the worker before it exists.
    pub(crate) pending_spawns: usize,

    pub(crate) max: usize,
    pub(crate) max_per_app: usize,
    pub(crate) max_idle_time: Duration,
    pub(crate) max_attempts: u32,

    pub(crate) waiting_on_global_queue: usize,
    pub(crate) shutdown: bool,
    pub(crate) cleaner: Option<JoinHandle<()>>,
}

impl<W: Worker> PoolInner<W> {
    /// Structural self-checks; compiled down to nothing in release builds.
    pub(crate) fn verify(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut total = 0;
        for (key, group) in &self.groups {
            assert_eq!(key, &group.name);
            assert!(!group.tag.is_detached());
            assert!(!group.workers.is_empty(), "empty group left in the pool");
            total += group.size();
            let mut seen_busy = false;
            for (_, ident) in group.workers.iter() {
                let entry = &self.workers[ident];
                assert!(!entry.record.is_detached());
                assert_eq!(entry.record.group_key(), &group.name);
                if entry.sessions == 0 {
                    assert!(!seen_busy, "idle worker listed behind a busy one");
                    assert!(entry.pos_in_inactive.is_some());
                } else {
                    seen_busy = true;
                    assert!(entry.pos_in_inactive.is_none());
                }
            }
        }
        assert_eq!(total + self.pending_spawns, self.count);
        assert_eq!(self.workers.len() + self.pending_spawns, self.count);
        assert!(self.active <= self.count);
        assert_eq!(self.inactive.len(), self.count - self.active);
    }
}

pub(crate) struct Shared<W: Worker> {
    state: Mutex<PoolInner<W>>,
    pub(crate) engine: SharedEngine<W>,

    /// Signaled when a freed active slot may admit a new group.
    new_group: Notify,
    /// Signaled when global-queue waiters should rescan for an idle worker.
    queue_slot: Notify,
    /// Wakes the idle cleaner on shutdown or a tunable change.
    pub(crate) cleaner_wakeup: Notify,
}

/// Undoes the `waiting_on_global_queue` increment even when the waiting
/// checkout is cancelled mid-wait.
struct GlobalQueueWait<'a, W: Worker> {
    shared: &'a Shared<W>,
}

impl<W: Worker> Drop for GlobalQueueWait<'_, W> {
    fn drop(&mut self) {
        self.shared.state().waiting_on_global_queue -= 1;
    }
}

/// A checked-out worker that has not produced a session yet. If the caller
/// goes away before the worker accepts, the stamp is rolled back.
struct CheckedOut<W: Worker> {
    record: Option<Arc<WorkerRecord<W>>>,
    shared: Arc<Shared<W>>,
}

impl<W: Worker> CheckedOut<W> {
    fn record(&self) -> &Arc<WorkerRecord<W>> {
        self.record.as_ref().unwrap()
    }

    fn take(mut self) -> Arc<WorkerRecord<W>> {
        self.record.take().unwrap()
    }
}

impl<W: Worker> Drop for CheckedOut<W> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.shared.checkout_abandoned(&record);
        }
    }
}

/// Capacity reserved for a foreground spawn in flight. The lock is
/// released around the spawn-engine call, so a caller cancelled while the
/// engine works would otherwise leave `count`/`active` inflated forever;
/// the rollback then runs from `Drop`. The checkout path consumes or
/// releases the reservation explicitly.
struct SpawnReservation<'a, W: Worker> {
    shared: &'a Shared<W>,
    armed: bool,
}

impl<'a, W: Worker> SpawnReservation<'a, W> {
    /// Rolls the reservation back under an already-held lock.
    fn release(mut self, state: &mut PoolInner<W>) {
        self.armed = false;
        Self::roll_back(self.shared, state);
    }

    /// The reservation was turned into an installed worker.
    fn consumed(mut self) {
        self.armed = false;
    }

    fn roll_back(shared: &Shared<W>, state: &mut PoolInner<W>) {
        state.pending_spawns -= 1;
        shared.set_count(state, state.count - 1);
        shared.set_active(state, state.active - 1);
        state.verify();
    }
}

impl<W: Worker> Drop for SpawnReservation<'_, W> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = self.shared.state();
        Self::roll_back(self.shared, &mut guard);
    }
}

impl<W: Worker> Shared<W> {
    pub(crate) fn state(&self) -> MutexGuard<'_, PoolInner<W>> {
        self.state.lock().unwrap()
    }

    // Counter mutators. These are the only places `active`, `count` and
    // `max` change, and each signals the waiters its change can unblock
    // before writing, while the lock is held.

    fn set_active(&self, state: &mut PoolInner<W>, value: usize) {
        if value < state.active {
            self.new_group.notify_waiters();
            self.queue_slot.notify_waiters();
        }
        state.active = value;
    }

    fn set_count(&self, state: &mut PoolInner<W>, value: usize) {
        self.queue_slot.notify_waiters();
        state.count = value;
    }

    fn set_max(&self, state: &mut PoolInner<W>, value: usize) {
        if value > state.max {
            self.new_group.notify_waiters();
            self.queue_slot.notify_waiters();
        }
        state.max = value;
    }

    pub(crate) fn spawning_allowed(&self, state: &PoolInner<W>, group_key: &Arc<str>) -> bool {
        let Some(group) = state.groups.get(group_key) else {
            return false;
        };
        state.count < state.max
            && (state.max_per_app == 0 || group.size() < state.max_per_app)
    }

    fn start_spawner(
        self: &Arc<Self>,
        state: &mut PoolInner<W>,
        group_key: &Arc<str>,
        options: &PoolOptions,
    ) {
        let Some(group) = state.groups.get_mut(group_key) else {
            return;
        };
        debug!(group = %group_key, "starting background spawner");
        let task = tokio::task::spawn(spawner::run(
            Arc::clone(self),
            group_key.clone(),
            group.app_root.clone(),
            options.clone(),
            Arc::clone(&group.tag),
        ));
        group.spawning = true;
        group.spawner = Some(task);
    }

    /// Takes the group's front worker when it is idle: moves it to the
    /// busy suffix, pulls it off the inactive list, and stamps it for the
    /// caller.
    fn checkout_front_idle(
        &self,
        state: &mut PoolInner<W>,
        group_key: &Arc<str>,
        options: &PoolOptions,
    ) -> Option<Arc<WorkerRecord<W>>> {
        let record;
        {
            let PoolInner {
                groups,
                workers,
                inactive,
                ..
            } = &mut *state;
            let group = groups.get_mut(group_key)?;
            let token = group.workers.front_token()?;
            let ident = group.workers.get(token).clone();
            let entry = workers
                .get_mut(&ident)
                .expect("listed worker has no entry");
            if entry.sessions != 0 {
                return None;
            }
            group.workers.move_to_back(token);
            if let Some(lru) = entry.pos_in_inactive.take() {
                inactive.remove(lru);
            }
            entry.sessions = 1;
            entry.last_used = Instant::now();
            group.apply_options(options);
            record = Arc::clone(&entry.record);
        }
        self.set_active(state, state.active + 1);
        state.verify();
        Some(record)
    }

    /// Queues this session onto the worker with the fewest open sessions.
    /// Scan order of the group list breaks ties, so the choice is
    /// deterministic within a run.
    fn checkout_least_busy(
        &self,
        state: &mut PoolInner<W>,
        group_key: &Arc<str>,
        options: &PoolOptions,
    ) -> Option<Arc<WorkerRecord<W>>> {
        let PoolInner {
            groups, workers, ..
        } = &mut *state;
        let group = groups.get_mut(group_key)?;
        let mut best: Option<(Token, usize)> = None;
        for (token, ident) in group.workers.iter() {
            let sessions = workers[ident].sessions;
            if best.map_or(true, |(_, s)| sessions < s) {
                best = Some((token, sessions));
            }
        }
        let (token, _) = best?;
        let ident = group.workers.get(token).clone();
        let entry = workers
            .get_mut(&ident)
            .expect("listed worker has no entry");
        group.workers.move_to_back(token);
        entry.sessions += 1;
        entry.last_used = Instant::now();
        group.apply_options(options);
        let record = Arc::clone(&entry.record);
        state.verify();
        Some(record)
    }

    /// Pops the globally least-recently-used idle worker to make room for
    /// a new group. Returns its handle for shutdown outside the lock.
    fn evict_oldest_idle(&self, state: &mut PoolInner<W>) -> Option<Arc<W>> {
        let ident = state.inactive.front()?.clone();
        debug!(identifier = %ident, "evicting idle worker to admit a new group");
        self.remove_idle_worker(state, &ident)
    }

    /// Removes an idle worker from every structure. Returns its handle so
    /// the caller can shut the process down outside the lock.
    pub(crate) fn remove_idle_worker(
        &self,
        state: &mut PoolInner<W>,
        ident: &Arc<str>,
    ) -> Option<Arc<W>> {
        let entry = state.workers.remove(ident)?;
        debug_assert_eq!(entry.sessions, 0);
        entry.record.mark_detached();
        if let Some(lru) = entry.pos_in_inactive {
            state.inactive.remove(lru);
        }
        let group_key = entry.record.group_key().clone();
        let mut group_emptied = false;
        if let Some(group) = state.groups.get_mut(&group_key) {
            group.workers.remove(entry.pos_in_group);
            group_emptied = group.workers.is_empty();
        }
        if group_emptied {
            self.detach_group(state, &group_key);
        }
        self.set_count(state, state.count - 1);
        Some(Arc::clone(entry.record.worker()))
    }

    /// Tears a group down: every worker is detached, the background
    /// spawner (if any) is cancelled, and the group becomes unreachable.
    /// Records once detached never come back.
    pub(crate) fn detach_group(&self, state: &mut PoolInner<W>, group_key: &Arc<str>) {
        let Some(mut group) = state.groups.remove(group_key) else {
            return;
        };
        while let Some(token) = group.workers.front_token() {
            let ident = group.workers.remove(token);
            let Some(entry) = state.workers.remove(&ident) else {
                continue;
            };
            entry.record.mark_detached();
            match entry.pos_in_inactive {
                Some(lru) => {
                    state.inactive.remove(lru);
                }
                None => self.set_active(state, state.active - 1),
            }
            self.set_count(state, state.count - 1);
        }
        if let Some(task) = group.spawner.take() {
            // The spawner only yields inside the spawn-engine call, so the
            // abort can never interrupt an install.
            task.abort();
        }
        group.tag.mark_detached();
    }

    /// Removes one worker from every structure; true when it was present.
    pub(crate) fn detach_worker(&self, state: &mut PoolInner<W>, identifier: &str) -> bool {
        let Some(entry) = state.workers.remove(identifier) else {
            return false;
        };
        entry.record.mark_detached();
        let group_key = entry.record.group_key().clone();
        let mut group_emptied = false;
        if let Some(group) = state.groups.get_mut(&group_key) {
            group.workers.remove(entry.pos_in_group);
            group_emptied = group.workers.is_empty();
        }
        if group_emptied {
            self.detach_group(state, &group_key);
        }
        match entry.pos_in_inactive {
            Some(lru) => {
                state.inactive.remove(lru);
            }
            None => {
                if entry.sessions > 0 {
                    self.set_active(state, state.active - 1);
                }
            }
        }
        self.set_count(state, state.count - 1);
        state.verify();
        true
    }

    /// Installs a foreground-spawned worker, consuming the capacity
    /// reservation taken before the lock was released. The worker lands at
    /// the back of the group list, already stamped for its first session.
    fn install_foreground(
        &self,
        state: &mut PoolInner<W>,
        group_key: &Arc<str>,
        app_root: &Path,
        options: &PoolOptions,
        worker: W,
    ) -> Arc<WorkerRecord<W>> {
        let record = WorkerRecord::new(group_key.clone(), worker);
        let ident = record.ident().clone();
        let group = state
            .groups
            .entry(group_key.clone())
            .or_insert_with(|| Group::new(group_key.clone(), app_root, options));
        let pos_in_group = group.workers.push_back(ident.clone());
        group.apply_options(options);
        state.workers.insert(
            ident,
            WorkerEntry {
                record: Arc::clone(&record),
                sessions: 1,
                processed: 0,
                last_used: Instant::now(),
                pos_in_group,
                pos_in_inactive: None,
            },
        );
        state.pending_spawns -= 1;
        state.verify();
        record
    }

    /// Installs a background-spawned worker at the idle front of its
    /// group. Returns true when the spawner should stop.
    pub(crate) fn install_background(
        &self,
        state: &mut PoolInner<W>,
        group_key: &Arc<str>,
        options: &PoolOptions,
        worker: W,
    ) -> bool {
        {
            let PoolInner {
                groups,
                workers,
                inactive,
                ..
            } = &mut *state;
            let Some(group) = groups.get_mut(group_key) else {
                return true;
            };
            let record = WorkerRecord::new(group_key.clone(), worker);
            let ident = record.ident().clone();
            let pos_in_group = group.workers.push_front(ident.clone());
            let pos_in_inactive = inactive.push_back(ident.clone());
            workers.insert(
                ident,
                WorkerEntry {
                    record,
                    sessions: 0,
                    processed: 0,
                    last_used: Instant::now(),
                    pos_in_group,
                    pos_in_inactive: Some(pos_in_inactive),
                },
            );
        }
        self.set_count(state, state.count + 1);

        let done = {
            let group = &state.groups[group_key];
            group.size() >= options.min_processes
                || !self.spawning_allowed(state, group_key)
        };
        if done {
            if let Some(group) = state.groups.get_mut(group_key) {
                group.spawning = false;
                group.spawner = None;
            }
        }
        state.verify();
        done
    }

    /// A checkout that never became a session: the caller went away before
    /// the worker accepted. Rolls the stamp back.
    fn checkout_abandoned(&self, record: &Arc<WorkerRecord<W>>) {
        let mut guard = self.state();
        let state = &mut *guard;
        if record.is_detached() {
            return;
        }
        let ident = record.ident().clone();
        let mut became_idle = false;
        {
            let PoolInner {
                groups,
                workers,
                inactive,
                ..
            } = &mut *state;
            let Some(entry) = workers.get_mut(&ident) else {
                return;
            };
            entry.sessions -= 1;
            entry.last_used = Instant::now();
            if entry.sessions == 0 {
                if let Some(group) = groups.get_mut(record.group_key()) {
                    group.workers.move_to_front(entry.pos_in_group);
                }
                entry.pos_in_inactive = Some(inactive.push_back(ident.clone()));
                became_idle = true;
            }
        }
        if became_idle {
            self.set_active(state, state.active - 1);
        }
        state.verify();
    }

    /// Close notification from a session handle. Bumps the processed
    /// counter, retires the worker if it reached the group's
    /// `max_requests`, and otherwise returns it to the idle prefix.
    pub(crate) fn session_closed(&self, record: &Weak<WorkerRecord<W>>) {
        let Some(record) = record.upgrade() else {
            return;
        };
        if record.is_detached() {
            // Monotone flag: a record observed as detached stays detached,
            // so this unlocked read can only produce a safe early-out.
            return;
        }
        let mut guard = self.state();
        let state = &mut *guard;
        if record.is_detached() {
            return;
        }
        let ident = record.ident().clone();
        let group_key = record.group_key().clone();

        let mut retired = false;
        let mut was_idle = false;
        let mut group_emptied = false;
        let mut became_idle = false;
        let mut retired_worker = None;
        {
            let PoolInner {
                groups,
                workers,
                inactive,
                ..
            } = &mut *state;
            let Some(entry) = workers.get_mut(&ident) else {
                return;
            };
            let Some(group) = groups.get_mut(&group_key) else {
                return;
            };
            entry.processed += 1;

            if group.max_requests > 0 && entry.processed >= group.max_requests {
                retired = true;
                record.mark_detached();
                let entry = workers.remove(&ident).expect("retiring worker vanished");
                group.workers.remove(entry.pos_in_group);
                group_emptied = group.workers.is_empty();
                if let Some(lru) = entry.pos_in_inactive {
                    inactive.remove(lru);
                    was_idle = true;
                }
                retired_worker = Some(Arc::clone(entry.record.worker()));
            } else {
                entry.last_used = Instant::now();
                entry.sessions -= 1;
                if entry.sessions == 0 {
                    group.workers.move_to_front(entry.pos_in_group);
                    entry.pos_in_inactive = Some(inactive.push_back(ident.clone()));
                    became_idle = true;
                }
            }
        }
        if retired {
            if !was_idle {
                self.set_active(state, state.active - 1);
            }
            if group_emptied {
                self.detach_group(state, &group_key);
            }
            self.set_count(state, state.count - 1);
        } else if became_idle {
            self.set_active(state, state.active - 1);
        }
        state.verify();
        drop(guard);

        if let Some(worker) = retired_worker {
            worker.shutdown();
            info!(identifier = %ident, "worker retired after reaching max_requests");
        }
    }

    /// One synchronous pass of the checkout state machine, run entirely
    /// under the pool lock. Returns what the caller should do next; the
    /// `MutexGuard` itself never escapes this function, so it never
    /// appears as a local held across an `.await` in `checkout`'s
    /// generated future (which must be `Send` even though `MutexGuard`
    /// is not).
    fn checkout_step<'a>(
        self: &'a Arc<Self>,
        group_key: &Arc<str>,
        app_root: &Path,
        options: &PoolOptions,
    ) -> Result<CheckoutStep<'a, W>, Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.shutdown {
            return Err(Error::Terminated);
        }

        // Operator restart directive?
        let restart = match state.groups.get_mut(group_key) {
            Some(group) => group.restart_witness.check(),
            None => restart::restart_requested(app_root, options),
        };
        if restart {
            info!(group = %group_key, "restart requested, reloading application code");
            self.engine.reload(group_key);
            self.detach_group(state, group_key);
            state.verify();
        }

        if state.groups.contains_key(group_key) {
            if let Some(record) = self.checkout_front_idle(state, group_key, options) {
                return Ok(CheckoutStep::Ready(record));
            }
            // Every worker in the group is busy.
            if !state.groups[group_key].spawning && self.spawning_allowed(state, group_key) {
                self.start_spawner(state, group_key, options);
            }
            if options.use_global_queue {
                state.waiting_on_global_queue += 1;
                let wait = GlobalQueueWait {
                    shared: self.as_ref(),
                };
                let mut notified = Box::pin(self.queue_slot.notified());
                notified.as_mut().enable();
                drop(guard);
                return Ok(CheckoutStep::WaitQueue { wait, notified });
            }
            return Ok(match self.checkout_least_busy(state, group_key, options) {
                Some(record) => CheckoutStep::Ready(record),
                None => CheckoutStep::Retry,
            });
        }

        // No group for this key yet. Admitting one needs a free active
        // slot, and room for its worker.
        if state.active >= state.max {
            let mut notified = Box::pin(self.new_group.notified());
            notified.as_mut().enable();
            drop(guard);
            return Ok(CheckoutStep::WaitNewGroup { notified });
        }
        let victim = if state.count >= state.max {
            self.evict_oldest_idle(state)
        } else {
            None
        };
        // Reserve capacity for the worker being spawned, so admission
        // control behaves as if the lock were held across the spawn.
        state.pending_spawns += 1;
        self.set_count(state, state.count + 1);
        self.set_active(state, state.active + 1);
        state.verify();
        drop(guard);
        // The reservation must not leak if this future is dropped
        // while the engine works.
        let reservation = SpawnReservation {
            shared: self.as_ref(),
            armed: true,
        };
        Ok(CheckoutStep::Spawn { reservation, victim })
    }

    /// The checkout state machine. Returns a stamped worker record; the
    /// caller opens the session outside the lock.
    async fn checkout(
        self: &Arc<Self>,
        app_root: &Path,
        options: &PoolOptions,
    ) -> Result<Arc<WorkerRecord<W>>, Error> {
        let group_key = options.group_key(app_root);
        loop {
            match self.checkout_step(&group_key, app_root, options)? {
                CheckoutStep::Ready(record) => return Ok(record),
                CheckoutStep::Retry => continue,
                CheckoutStep::WaitQueue { wait, notified } => {
                    notified.await;
                    drop(wait);
                    continue;
                }
                CheckoutStep::WaitNewGroup { notified } => {
                    notified.await;
                    continue;
                }
                CheckoutStep::Spawn { reservation, victim } => {
                    if let Some(worker) = victim {
                        worker.shutdown();
                    }

                    debug!(group = %group_key, "spawning worker in the foreground");
                    let spawned = self.engine.spawn(app_root, options).await;

                    let mut guard = self.state();
                    let state = &mut *guard;
                    let worker = match spawned {
                        Ok(worker) => worker,
                        Err(err) => {
                            reservation.release(state);
                            return Err(Error::Spawn(err));
                        }
                    };
                    if state.shutdown {
                        reservation.release(state);
                        drop(guard);
                        worker.shutdown();
                        return Err(Error::Terminated);
                    }
                    let record =
                        self.install_foreground(state, &group_key, app_root, options, worker);
                    reservation.consumed();
                    if options.min_processes > 1
                        && !state.groups[&group_key].spawning
                        && self.spawning_allowed(state, &group_key)
                    {
                        self.start_spawner(state, &group_key, options);
                    }
                    return Ok(record);
                }
            }
        }
    }
}

/// Outcome of one synchronous pass of the checkout state machine; see
/// [`Shared::checkout_step`].
enum CheckoutStep<'a, W: Worker> {
    Ready(Arc<WorkerRecord<W>>),
    Retry,
    WaitQueue {
        wait: GlobalQueueWait<'a, W>,
        notified: Pin<Box<Notified<'a>>>,
    },
    WaitNewGroup {
        notified: Pin<Box<Notified<'a>>>,
    },
    Spawn {
        reservation: SpawnReservation<'a, W>,
        victim: Option<Arc<W>>,
    },
}

/// A concurrent, bounded pool of application worker processes.
///
/// Checkouts route to an existing worker where possible, trigger
/// background spawns when demand warrants, evict idle workers under
/// capacity pressure, and otherwise wait for room to free up.
pub struct Pool<W: Worker> {
    shared: Arc<Shared<W>>,
}

impl<W: Worker> Pool<W> {
    /// Creates a pool that launches workers through `engine`.
    ///
    /// Must be called from within a tokio runtime: the pool runs its idle
    /// cleaner and background spawners as tasks on it.
    pub fn new(engine: SharedEngine<W>, policy: Policy) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolInner {
                groups: HashMap::new(),
                workers: HashMap::new(),
                inactive: TokenList::new(),
                count: 0,
                active: 0,
                pending_spawns: 0,
                max: policy.max,
                max_per_app: policy.max_per_app,
                max_idle_time: policy.max_idle_time,
                max_attempts: policy.max_attempts,
                waiting_on_global_queue: 0,
                shutdown: false,
                cleaner: None,
            }),
            engine,
            new_group: Notify::new(),
            queue_slot: Notify::new(),
            cleaner_wakeup: Notify::new(),
        });
        let task = tokio::task::spawn(cleaner::run(Arc::clone(&shared)));
        shared.state().cleaner = Some(task);
        Self { shared }
    }

    /// Checks out a worker for `app_root` and opens a session on it.
    ///
    /// Blocks until a worker is available or capacity frees up. A worker
    /// that refuses the session is treated as crashed: it is detached and
    /// the checkout retried, up to the pool's `max_attempts`; the last
    /// failure propagates.
    pub async fn get(
        &self,
        app_root: &Path,
        options: &PoolOptions,
    ) -> Result<Session<W>, Error> {
        let mut attempts = 0;
        loop {
            let checked = CheckedOut {
                record: Some(self.shared.checkout(app_root, options).await?),
                shared: Arc::clone(&self.shared),
            };
            let worker = Arc::clone(checked.record().worker());
            match worker.open_session().await {
                Ok(stream) => {
                    let record = checked.take();
                    return Ok(Session::new(stream, &record, Arc::clone(&self.shared)));
                }
                Err(err) => {
                    let record = checked.take();
                    attempts += 1;
                    let max_attempts = {
                        let mut guard = self.shared.state();
                        let state = &mut *guard;
                        self.shared.detach_worker(state, record.identifier());
                        state.max_attempts
                    };
                    warn!(
                        identifier = record.identifier(),
                        error = %err,
                        "worker refused a session, detaching"
                    );
                    if attempts >= max_attempts {
                        return Err(Error::OpenSession {
                            attempts,
                            source: err,
                        });
                    }
                }
            }
        }
    }

    /// Removes the named worker from the pool. Returns whether it was
    /// found; a second call for the same identifier returns false. The
    /// worker process itself is not shut down.
    pub fn detach(&self, identifier: &str) -> bool {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        self.shared.detach_worker(state, identifier)
    }

    /// Point-in-time view of every group and worker, taken under the
    /// pool's lock. Groups are sorted by name for stable output.
    pub fn snapshot(&self) -> PoolSnapshot {
        let guard = self.shared.state();
        let state = &*guard;
        let now = Instant::now();
        let mut groups: Vec<GroupSnapshot> = state
            .groups
            .values()
            .map(|group| GroupSnapshot {
                name: group.name.to_string(),
                app_root: group.app_root.clone(),
                environment: group.environment.clone(),
                size: group.size(),
                min_processes: group.min_processes,
                max_requests: group.max_requests,
                spawning: group.spawning,
                workers: group
                    .workers
                    .iter()
                    .map(|(_, ident)| {
                        let entry = &state.workers[ident];
                        WorkerSnapshot {
                            identifier: entry.record.identifier().to_string(),
                            pid: entry.record.worker().pid(),
                            sessions: entry.sessions,
                            processed: entry.processed,
                            uptime: now - entry.record.started(),
                            since_last_used: now - entry.last_used,
                            server_sockets: entry.record.worker().server_sockets(),
                        }
                    })
                    .collect(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        PoolSnapshot {
            count: state.count,
            active: state.active,
            max: state.max,
            max_per_app: state.max_per_app,
            global_queue_waiting: state.waiting_on_global_queue,
            groups,
        }
    }

    /// Diagnostic backtrace dump from the spawn engine, passed through
    /// verbatim for the admin channel.
    pub async fn backtraces(&self) -> String {
        self.shared.engine.backtraces().await
    }

    /// Opaque engine state description, passed through verbatim for the
    /// admin channel.
    pub async fn inspect(&self) -> String {
        self.shared.engine.inspect().await
    }

    /// Caps the total worker count. Raising it wakes parked checkouts;
    /// lowering it below the current count is tolerated, the pool shrinks
    /// as workers retire or idle out.
    pub fn set_max(&self, max: usize) {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        self.shared.set_max(state, max);
    }

    /// Caps per-group growth through background spawning. Zero means
    /// unlimited.
    pub fn set_max_per_app(&self, max_per_app: usize) {
        self.shared.state().max_per_app = max_per_app;
    }

    /// Reconfigures the idle cleaner. Zero disables idle cleanup.
    pub fn set_max_idle_time(&self, max_idle_time: Duration) {
        self.shared.state().max_idle_time = max_idle_time;
        self.shared.cleaner_wakeup.notify_waiters();
    }

    /// Reconfigures how many crashed workers a single `get` absorbs.
    pub fn set_max_attempts(&self, max_attempts: u32) {
        self.shared.state().max_attempts = max_attempts.max(1);
    }

    /// Stops the idle cleaner and all background spawners, fails parked
    /// and future checkouts with [`Error::Terminated`], detaches every
    /// group, and shuts its worker processes down. Idempotent.
    pub async fn shutdown(&self) {
        let (cleaner, spawners, workers) = {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            state.shutdown = true;
            let spawners: Vec<_> = state
                .groups
                .values_mut()
                .filter_map(|group| {
                    group.spawning = false;
                    group.spawner.take()
                })
                .collect();
            let workers: Vec<Arc<W>> = state
                .workers
                .values()
                .map(|entry| Arc::clone(entry.record.worker()))
                .collect();
            let keys: Vec<Arc<str>> = state.groups.keys().cloned().collect();
            for key in &keys {
                self.shared.detach_group(state, key);
            }
            state.verify();
            (state.cleaner.take(), spawners, workers)
        };
        self.shared.new_group.notify_waiters();
        self.shared.queue_slot.notify_waiters();
        self.shared.cleaner_wakeup.notify_waiters();
        for worker in workers {
            worker.shutdown();
        }
        for task in &spawners {
            task.abort();
        }
        if let Some(task) = cleaner {
            join_background_task("cleaner", task.await);
        }
        for task in spawners {
            join_background_task("spawner", task.await);
        }
    }
}

impl<W: Worker> Drop for Pool<W> {
    fn drop(&mut self) {
        let workers: Vec<Arc<W>> = {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            state.shutdown = true;
            if let Some(task) = state.cleaner.take() {
                task.abort();
            }
            for group in state.groups.values_mut() {
                group.spawning = false;
                if let Some(task) = group.spawner.take() {
                    task.abort();
                }
            }
            state
                .workers
                .values()
                .map(|entry| Arc::clone(entry.record.worker()))
                .collect()
        };
        for worker in workers {
            worker.shutdown();
        }
    }
}

/// Pool background tasks are aborted on the way down, so a cancelled join
/// is the expected outcome here; a panic inside the task is resurfaced,
/// and anything else is a runtime bug.
fn join_background_task(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) if err.is_panic() => {
            error!(task = task, "pool background task panicked");
            std::panic::panic_any(err.into_panic());
        }
        Err(err) => panic!("failed to join pool {task} task: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StubEngine;
    use std::path::PathBuf;

    fn test_policy(max: usize) -> Policy {
        Policy {
            max,
            max_per_app: 0,
            // Keep the cleaner parked unless a test turns it on.
            max_idle_time: Duration::ZERO,
            max_attempts: 10,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn warm_spawn_then_checkout_prefers_idle_front() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(2));
        let root = PathBuf::from("/srv/alpha");
        let options = PoolOptions {
            min_processes: 2,
            ..PoolOptions::default()
        };

        let first = pool.get(&root, &options).await.unwrap();
        eventually(|| pool.snapshot().count == 2).await;

        let second = pool.get(&root, &options).await.unwrap();
        assert_ne!(first.pid(), second.pid());

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.active, 2);
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].size, 2);

        let first_id = first.worker_identifier().to_string();
        let second_id = second.worker_identifier().to_string();
        drop(first);
        drop(second);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.count, 2);
        // Closed workers return to the idle prefix, most recent first.
        let order: Vec<String> = snapshot.groups[0]
            .workers
            .iter()
            .map(|w| w.identifier.clone())
            .collect();
        assert_eq!(order, vec![second_id, first_id]);
        assert!(snapshot.groups[0].workers.iter().all(|w| w.sessions == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_group_stacks_sessions_and_spawns_in_background() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");
        let options = PoolOptions::default();

        let first = pool.get(&root, &options).await.unwrap();
        let second = pool.get(&root, &options).await.unwrap();
        // Only one worker existed when the second checkout arrived, so the
        // session queues on it while a spare spawns in the background.
        assert_eq!(first.pid(), second.pid());
        eventually(|| pool.snapshot().count == 2).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active, 1);
        let busy = snapshot.groups[0]
            .workers
            .iter()
            .find(|w| w.sessions == 2)
            .unwrap();
        assert_eq!(busy.pid, first.pid());
    }

    #[tokio::test(start_paused = true)]
    async fn new_group_waits_for_a_free_active_slot_then_evicts() {
        let engine = StubEngine::new();
        let pool = Arc::new(Pool::new(engine.shared(), test_policy(2)));
        let root_a = PathBuf::from("/srv/alpha");
        let root_b = PathBuf::from("/srv/beta");
        let warm = PoolOptions {
            min_processes: 2,
            ..PoolOptions::default()
        };

        let a1 = pool.get(&root_a, &warm).await.unwrap();
        eventually(|| pool.snapshot().count == 2).await;
        let a2 = pool.get(&root_a, &warm).await.unwrap();
        assert_eq!(pool.snapshot().active, 2);

        let spawn_getter = |pool: &Arc<Pool<crate::test_utils::StubWorker>>| {
            tokio::task::spawn({
                let pool = Arc::clone(pool);
                let root = root_b.clone();
                async move { pool.get(&root, &PoolOptions::default()).await }
            })
        };
        let b_first = spawn_getter(&pool);
        let b_second = spawn_getter(&pool);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!b_first.is_finished());
        assert!(!b_second.is_finished());

        // Freeing one alpha slot admits exactly one beta checkout, which
        // evicts the freshly idled alpha worker to make room.
        drop(a1);
        eventually(|| b_first.is_finished() || b_second.is_finished()).await;
        assert!(!(b_first.is_finished() && b_second.is_finished()));
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.active, 2);
        assert_eq!(engine.shutdowns(), 1);

        drop(a2);
        let s1 = b_first.await.unwrap().unwrap();
        let s2 = b_second.await.unwrap().unwrap();
        // The second beta checkout finds the group already admitted and
        // queues onto its worker instead of spawning another.
        assert_eq!(s1.pid(), s2.pid());
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.active, 1);
        let names: Vec<&str> = snapshot.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["/srv/alpha", "/srv/beta"]);
        assert_eq!(engine.spawns(), 3);
        assert_eq!(engine.shutdowns(), 1);
        drop(s1);
        drop(s2);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retires_after_max_requests() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");
        let options = PoolOptions {
            max_requests: 3,
            ..PoolOptions::default()
        };

        let mut pids = Vec::new();
        for _ in 0..3 {
            let session = pool.get(&root, &options).await.unwrap();
            pids.push(session.pid());
        }
        assert_eq!(pids[0], pids[1]);
        assert_eq!(pids[1], pids[2]);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 0);
        assert!(snapshot.groups.is_empty());
        assert_eq!(engine.spawns(), 1);
        assert_eq!(engine.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_queue_waits_for_an_idle_worker() {
        let engine = StubEngine::new();
        let pool = Arc::new(Pool::new(engine.shared(), test_policy(1)));
        let root = PathBuf::from("/srv/alpha");
        let options = PoolOptions {
            use_global_queue: true,
            ..PoolOptions::default()
        };

        let first = pool.get(&root, &options).await.unwrap();
        let waiter = tokio::task::spawn({
            let pool = Arc::clone(&pool);
            let root = root.clone();
            let options = options.clone();
            async move { pool.get(&root, &options).await }
        });
        eventually(|| pool.snapshot().global_queue_waiting == 1).await;
        assert!(!waiter.is_finished());
        // Capacity is exhausted, so no spare spawns in the background.
        assert!(!pool.snapshot().groups[0].spawning);

        let first_pid = first.pid();
        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.pid(), first_pid);
        assert_eq!(engine.spawns(), 1);
        assert_eq!(pool.snapshot().global_queue_waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_spawn_failure_is_surfaced_by_the_next_checkout() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");
        let options = PoolOptions {
            min_processes: 2,
            ..PoolOptions::default()
        };

        let session = pool.get(&root, &options).await.unwrap();
        // The warm spawner's attempt fails and takes the group with it.
        engine.fail_next_spawns(1);
        eventually(|| pool.snapshot().groups.is_empty()).await;
        assert_eq!(pool.snapshot().count, 0);

        // The open session's worker went with the group; closing it is a
        // no-op.
        drop(session);
        assert_eq!(pool.snapshot().active, 0);

        // The next checkout takes the fresh-group path: a failure there is
        // reported synchronously...
        engine.fail_next_spawns(1);
        let result = pool.get(&root, &PoolOptions::default()).await;
        assert!(matches!(result, Err(Error::Spawn(_))));

        // ...and a success produces a session again.
        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        drop(session);
        assert_eq!(pool.snapshot().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_cleaner_evicts_down_to_min_processes() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(6));
        let root = PathBuf::from("/srv/alpha");
        let warm = PoolOptions {
            min_processes: 3,
            ..PoolOptions::default()
        };

        let session = pool.get(&root, &warm).await.unwrap();
        eventually(|| pool.snapshot().count == 3).await;
        drop(session);

        // Lower the floor, then turn the cleaner on.
        let relax = PoolOptions::default();
        drop(pool.get(&root, &relax).await.unwrap());
        pool.set_max_idle_time(Duration::from_millis(100));

        for _ in 0..300 {
            let snap = pool.snapshot();
            eprintln!("DEBUG count={} active={} shutdowns={} groups={:?}", snap.count, snap.active, engine.shutdowns(), snap.groups.iter().map(|g| (g.size, g.min_processes)).collect::<Vec<_>>());
            if snap.count == 1 { break; }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(engine.shutdowns(), 2);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.groups[0].size, 1);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_is_idempotent() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");

        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        let ident = session.worker_identifier().to_string();
        drop(session);

        assert!(pool.detach(&ident));
        assert!(!pool.detach(&ident));
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 0);
        assert!(snapshot.groups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_takes_the_least_recently_used_idle_worker() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(2));
        let alpha = PathBuf::from("/srv/alpha");
        let beta = PathBuf::from("/srv/beta");
        let gamma = PathBuf::from("/srv/gamma");

        drop(pool.get(&alpha, &PoolOptions::default()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(pool.get(&beta, &PoolOptions::default()).await.unwrap());

        // Admitting gamma needs room; the alpha worker has been idle the
        // longest and is the one evicted.
        drop(pool.get(&gamma, &PoolOptions::default()).await.unwrap());
        let snapshot = pool.snapshot();
        let names: Vec<&str> = snapshot.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["/srv/beta", "/srv/gamma"]);
        assert_eq!(engine.shutdowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_file_tears_down_the_group() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir(root.join("tmp")).unwrap();

        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        let old_ident = session.worker_identifier().to_string();
        drop(session);
        assert!(engine.reloads().is_empty());

        std::fs::File::create(root.join("tmp/restart.txt")).unwrap();
        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        assert_ne!(session.worker_identifier(), old_ident);
        assert_eq!(engine.reloads(), vec![root.to_string_lossy().to_string()]);
        assert_eq!(engine.spawns(), 2);
        assert_eq!(pool.snapshot().count, 1);
        // The old worker no longer resolves.
        assert!(!pool.detach(&old_ident));
        drop(session);

        // The new group has observed the restart file; no further reloads.
        drop(pool.get(&root, &PoolOptions::default()).await.unwrap());
        assert_eq!(engine.reloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_is_detached_and_replaced() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");

        engine.refuse_next_worker_sessions(1);
        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        // The first worker refused its session and was replaced.
        assert_eq!(engine.spawns(), 2);
        drop(session);
        assert_eq!(pool.snapshot().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_open_failures_eventually_propagate() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        pool.set_max_attempts(3);
        let root = PathBuf::from("/srv/alpha");

        engine.refuse_sessions_per_worker(1);
        match pool.get(&root, &PoolOptions::default()).await {
            Err(Error::OpenSession { attempts, .. }) => assert_eq!(attempts, 3),
            Ok(_) => panic!("checkout unexpectedly succeeded"),
            Err(other) => panic!("unexpected checkout error: {other}"),
        }
        assert_eq!(pool.snapshot().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_and_close_round_trips_the_worker() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(4));
        let root = PathBuf::from("/srv/alpha");

        let first = pool.get(&root, &PoolOptions::default()).await.unwrap();
        let ident = first.worker_identifier().to_string();
        drop(first);

        let second = pool.get(&root, &PoolOptions::default()).await.unwrap();
        assert_eq!(second.worker_identifier(), ident);
        drop(second);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.groups[0].workers[0].processed, 2);
        assert_eq!(engine.spawns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_per_app_caps_background_spawning() {
        let engine = StubEngine::new();
        let pool = Pool::new(engine.shared(), test_policy(8));
        pool.set_max_per_app(1);
        let root = PathBuf::from("/srv/alpha");

        let first = pool.get(&root, &PoolOptions::default()).await.unwrap();
        let second = pool.get(&root, &PoolOptions::default()).await.unwrap();
        assert_eq!(first.pid(), second.pid());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.spawns(), 1);
        assert!(!pool.snapshot().groups[0].spawning);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_parked_and_future_checkouts() {
        let engine = StubEngine::new();
        let pool = Arc::new(Pool::new(engine.shared(), test_policy(1)));
        let root = PathBuf::from("/srv/alpha");

        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        let parked = tokio::task::spawn({
            let pool = Arc::clone(&pool);
            async move {
                pool.get(&PathBuf::from("/srv/beta"), &PoolOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!parked.is_finished());

        pool.shutdown().await;
        assert!(matches!(parked.await.unwrap(), Err(Error::Terminated)));
        assert!(matches!(
            pool.get(&root, &PoolOptions::default()).await,
            Err(Error::Terminated)
        ));
        // The worker process was torn down along with the pool.
        assert_eq!(engine.shutdowns(), 1);
        assert_eq!(pool.snapshot().count, 0);
        drop(session);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_checkout_releases_its_capacity_reservation() {
        let engine = StubEngine::new();
        engine.set_spawn_delay_ms(10_000);
        let pool = Arc::new(Pool::new(engine.shared(), test_policy(2)));
        let root = PathBuf::from("/srv/alpha");

        let getter = tokio::task::spawn({
            let pool = Arc::clone(&pool);
            let root = root.clone();
            async move { pool.get(&root, &PoolOptions::default()).await }
        });
        // Yielding (not sleeping) lets the checkout reserve capacity and
        // park inside the spawn engine without advancing the paused clock.
        for _ in 0..100 {
            if pool.snapshot().count == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.snapshot().count, 1);
        assert_eq!(pool.snapshot().active, 1);

        getter.abort();
        let _ = getter.await;
        eventually(|| pool.snapshot().count == 0).await;
        assert_eq!(pool.snapshot().active, 0);

        // The freed capacity is usable again.
        let session = pool.get(&root, &PoolOptions::default()).await.unwrap();
        drop(session);
        assert_eq!(pool.snapshot().count, 1);
    }
}
