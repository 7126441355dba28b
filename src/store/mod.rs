//! The schedule store: a capacity-limited, serialized front for a
//! [`ScheduleBackend`].
//!
//! Every operation is queued onto a FIFO drained by one worker thread that
//! owns the backend. Each call returns a [`Completion`] that resolves once the
//! worker has applied it, in submission order.
//!
//! ```no_run
//! use automation_store::{AutomationStore, Schedule, Trigger, TriggerType};
//!
//! let store = AutomationStore::in_memory("example", 100)?;
//! let schedule = Schedule::new("welcome")
//!     .with_trigger(Trigger::new(TriggerType::AppForeground, 1.0));
//! store.save_schedule(schedule).wait()?;
//! assert_eq!(store.get_schedule_count().wait()?, 1);
//! # Ok::<(), automation_store::StoreError>(())
//! ```

pub mod backend;
pub(crate) mod schema;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use backend::{DeleteScope, ScheduleBackend, ScheduleQuery, TriggerQuery};
pub use sqlite::SqliteScheduleBackend;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::schedule::types::{now_millis, truncate_millis};
use crate::schedule::{ExecutionState, Schedule, StateKind, Trigger, TriggerType};

type Job = Box<dyn FnOnce(&mut dyn ScheduleBackend) + Send>;

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Pending result of a store operation.
///
/// Await it from async code or call [`Completion::wait`] from a plain thread.
/// Dropping it discards the result; the operation still runs.
#[must_use = "the operation runs regardless, but its result is lost if dropped"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block the current thread until the operation has run.
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(worker_gone()))
    }

    /// Block until the operation has run and report whether it succeeded.
    ///
    /// Same restriction as [`Completion::wait`].
    pub fn succeeded(self) -> bool {
        self.wait().is_ok()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(worker_gone())))
    }
}

fn worker_gone() -> StoreError {
    StoreError::WorkerUnavailable("worker thread exited before completing the operation".into())
}

// ---------------------------------------------------------------------------
// AutomationStore
// ---------------------------------------------------------------------------

/// Handle to a schedule store.
///
/// Cheap to clone; all clones share one worker. The worker exits once the last
/// handle is dropped and its queue is drained.
#[derive(Clone)]
pub struct AutomationStore {
    name: Arc<str>,
    schedule_limit: usize,
    jobs: Sender<Job>,
}

impl std::fmt::Debug for AutomationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationStore")
            .field("name", &self.name)
            .field("schedule_limit", &self.schedule_limit)
            .finish_non_exhaustive()
    }
}

impl AutomationStore {
    /// Open a store described by `config`.
    ///
    /// Durable stores live at `{root_dir}/{store_name}.db`; in-memory stores
    /// keep nothing once the last handle is dropped.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = if config.in_memory {
            SqliteScheduleBackend::open_in_memory()?
        } else {
            SqliteScheduleBackend::open(&config.database_path())?
        };
        info!(
            store = %config.store_name,
            limit = config.schedule_limit,
            in_memory = config.in_memory,
            path = ?backend.path(),
            "automation store opened"
        );
        Self::with_backend(&config.store_name, config.schedule_limit, backend)
    }

    /// Open an ephemeral SQLite-backed store.
    pub fn in_memory(name: &str, schedule_limit: usize) -> Result<Self> {
        Self::open(&StoreConfig::in_memory(name, schedule_limit))
    }

    /// Start a store over an arbitrary backend.
    pub fn with_backend<B: ScheduleBackend>(
        name: &str,
        schedule_limit: usize,
        backend: B,
    ) -> Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded::<Job>();
        let backend: Box<dyn ScheduleBackend> = Box::new(backend);
        let worker_name: Arc<str> = Arc::from(name);

        let thread_store = Arc::clone(&worker_name);
        std::thread::Builder::new()
            .name(format!("automation-store-{name}"))
            .spawn(move || run_worker(&thread_store, backend, queue))
            .map_err(|e| StoreError::WorkerUnavailable(format!("failed to spawn worker: {e}")))?;

        Ok(Self {
            name: worker_name,
            schedule_limit,
            jobs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of schedules the store will hold.
    pub fn schedule_limit(&self) -> usize {
        self.schedule_limit
    }

    // -- saves -------------------------------------------------------------

    /// Save one schedule. See [`AutomationStore::save_schedules`].
    pub fn save_schedule(&self, schedule: Schedule) -> Completion<()> {
        self.save_schedules(vec![schedule])
    }

    /// Save a batch atomically.
    ///
    /// Fails with [`StoreError::CapacityExceeded`] if the batch would push the
    /// stored count past the limit, and with
    /// [`StoreError::DuplicateIdentifier`] if any identifier is taken. A
    /// schedule that is not in [`Schedule::normalized`] form fails with
    /// [`StoreError::InvalidSchedule`]. In every case nothing from the batch
    /// is written. An empty batch succeeds.
    pub fn save_schedules(&self, schedules: Vec<Schedule>) -> Completion<()> {
        let limit = self.schedule_limit;
        let store = Arc::clone(&self.name);
        self.submit("save_schedules", move |backend| {
            if schedules.is_empty() {
                return Ok(());
            }
            for schedule in &schedules {
                schedule.validate()?;
            }
            let current = backend.schedule_count()?;
            let requested = schedules.len();
            if current + requested > limit {
                warn!(%store, current, requested, limit, "schedule save rejected: capacity");
                return Err(StoreError::CapacityExceeded {
                    limit,
                    current,
                    requested,
                });
            }
            backend.insert_schedules(&schedules)
        })
    }

    // -- updates -----------------------------------------------------------

    /// Move a schedule to `state`, stamping the change time.
    ///
    /// Resolves to `false` if no schedule has this identifier.
    pub fn set_execution_state(&self, identifier: &str, state: ExecutionState) -> Completion<bool> {
        let identifier = identifier.to_owned();
        self.submit("set_execution_state", move |backend| {
            backend.set_execution_state(&identifier, state, now_millis())
        })
    }

    /// Replace a stored schedule's fields and triggers. `false` if absent.
    ///
    /// Non-canonical input fails with [`StoreError::InvalidSchedule`].
    pub fn update_schedule(&self, schedule: Schedule) -> Completion<bool> {
        self.submit("update_schedule", move |backend| {
            schedule.validate()?;
            backend.update_schedule(&schedule)
        })
    }

    /// Persist a trigger's progress. `false` if absent.
    pub fn update_trigger_progress(&self, trigger_id: &str, progress: f64) -> Completion<bool> {
        let trigger_id = trigger_id.to_owned();
        self.submit("update_trigger_progress", move |backend| {
            backend.set_trigger_progress(&trigger_id, progress)
        })
    }

    // -- queries -----------------------------------------------------------

    /// Lookup by identifier. Returns the schedule in any state, including
    /// past its grace period.
    pub fn get_schedule(&self, identifier: &str) -> Completion<Option<Schedule>> {
        self.fetch_one(ScheduleQuery::Identifier(identifier.to_owned()))
    }

    /// Schedules in `group`, skipping those past their grace period at `now`.
    pub fn get_schedules_in_group(
        &self,
        group: &str,
        now: DateTime<Utc>,
    ) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::Group {
            group: group.to_owned(),
            now,
        })
    }

    /// Every stored schedule, including those past their grace period.
    pub fn get_all_schedules(&self) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::All)
    }

    pub fn get_pending_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.in_state(StateKind::Pending, now)
    }

    pub fn get_paused_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.in_state(StateKind::Paused, now)
    }

    pub fn get_executing_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.in_state(StateKind::Executing, now)
    }

    pub fn get_finished_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.in_state(StateKind::Finished, now)
    }

    /// Delayed schedules whose delay date is still after `now`, skipping
    /// those past their grace period.
    pub fn get_delayed_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::Delayed { now })
    }

    /// The schedule, if it is delayed until exactly `execution_date`.
    pub fn get_delayed_schedule(
        &self,
        identifier: &str,
        execution_date: DateTime<Utc>,
    ) -> Completion<Option<Schedule>> {
        self.fetch_one(ScheduleQuery::DelayedAt {
            identifier: identifier.to_owned(),
            execution_date: truncate_millis(execution_date),
        })
    }

    /// The schedule, if it is paused.
    pub fn get_paused_schedule(&self, identifier: &str) -> Completion<Option<Schedule>> {
        self.fetch_one(ScheduleQuery::Paused(identifier.to_owned()))
    }

    /// Schedules past their end date but still inside the edit grace period.
    pub fn get_active_expired_schedules(&self, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::ActiveExpired { now })
    }

    /// Schedules past their end date and grace period, ready for cleanup.
    pub fn get_expired_schedules_past_grace(
        &self,
        now: DateTime<Utc>,
    ) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::PastGrace { now })
    }

    /// Triggers of `trigger_type` currently under evaluation.
    ///
    /// Execution triggers of pending schedules and cancellation triggers of
    /// delayed ones, skipping schedules that have not started at `now`.
    pub fn get_active_triggers(
        &self,
        schedule_id: Option<&str>,
        trigger_type: TriggerType,
        now: DateTime<Utc>,
    ) -> Completion<Vec<Trigger>> {
        let query = TriggerQuery {
            schedule_id: schedule_id.map(str::to_owned),
            trigger_type,
            now,
        };
        self.submit("get_active_triggers", move |backend| {
            backend.fetch_active_triggers(&query)
        })
    }

    pub fn get_schedule_count(&self) -> Completion<usize> {
        self.submit("get_schedule_count", |backend| backend.schedule_count())
    }

    // -- deletes -----------------------------------------------------------

    /// Delete one schedule and its triggers. Resolves to the rows removed.
    pub fn delete_schedule(&self, identifier: &str) -> Completion<usize> {
        self.delete(DeleteScope::Identifier(identifier.to_owned()))
    }

    pub fn delete_schedules_in_group(&self, group: &str) -> Completion<usize> {
        self.delete(DeleteScope::Group(group.to_owned()))
    }

    pub fn delete_all_schedules(&self) -> Completion<usize> {
        self.delete(DeleteScope::All)
    }

    /// Delete every schedule past its grace period at `now`, in one step.
    pub fn delete_expired_schedules(&self, now: DateTime<Utc>) -> Completion<usize> {
        self.delete(DeleteScope::PastGrace { now })
    }

    // -- barrier -----------------------------------------------------------

    /// Block until every operation submitted before this call has run.
    pub fn wait_for_idle(&self) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let barrier: Job = Box::new(move |_| {
            let _ = tx.send(());
        });
        if self.jobs.send(barrier).is_ok() {
            // Err means the worker died; nothing is left to wait for.
            let _ = rx.recv();
        }
    }

    // -- internals ---------------------------------------------------------

    fn fetch(&self, query: ScheduleQuery) -> Completion<Vec<Schedule>> {
        self.submit("fetch_schedules", move |backend| {
            backend.fetch_schedules(&query)
        })
    }

    /// Schedules in `kind`, skipping those past their grace period at `now`.
    fn in_state(&self, kind: StateKind, now: DateTime<Utc>) -> Completion<Vec<Schedule>> {
        self.fetch(ScheduleQuery::InState { kind, now })
    }

    fn fetch_one(&self, query: ScheduleQuery) -> Completion<Option<Schedule>> {
        self.submit("fetch_schedule", move |backend| {
            Ok(backend.fetch_schedules(&query)?.into_iter().next())
        })
    }

    fn delete(&self, scope: DeleteScope) -> Completion<usize> {
        self.submit("delete_schedules", move |backend| {
            let removed = backend.delete_schedules(&scope)?;
            debug!(?scope, removed, "schedules deleted");
            Ok(removed)
        })
    }

    fn submit<T, F>(&self, op: &'static str, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ScheduleBackend) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.name);
        let job: Job = Box::new(move |backend| {
            let result = f(backend);
            match &result {
                Ok(_) => debug!(%store, op, "store operation complete"),
                Err(StoreError::CapacityExceeded { .. }) => {}
                Err(e) => warn!(%store, op, error = %e, "store operation failed"),
            }
            // The caller may have dropped its completion.
            let _ = tx.send(result);
        });

        if self.jobs.send(job).is_err() {
            warn!(store = %self.name, op, "store worker unavailable");
            return Completion::ready(Err(StoreError::WorkerUnavailable(format!(
                "worker for store `{}` is not running",
                self.name
            ))));
        }
        Completion { rx }
    }
}

fn run_worker(store: &str, mut backend: Box<dyn ScheduleBackend>, queue: Receiver<Job>) {
    debug!(store, "store worker started");
    while let Ok(job) = queue.recv() {
        job(backend.as_mut());
    }
    debug!(store, "store worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
