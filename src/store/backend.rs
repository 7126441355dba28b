//! The persistence seam between the store worker and its database.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::schedule::{ExecutionState, Schedule, StateKind, Trigger, TriggerType};

/// Which schedules a read returns.
///
/// Queries carrying a `now` skip schedules that are past their edit grace
/// period at that instant. `All`, `Identifier` and `PastGrace` are explicit
/// scans and return them.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleQuery {
    /// Every stored schedule.
    All,
    /// The schedule with this identifier.
    Identifier(String),
    /// Schedules tagged with this group.
    Group { group: String, now: DateTime<Utc> },
    /// Schedules in this state.
    InState { kind: StateKind, now: DateTime<Utc> },
    /// Delayed schedules whose delay has not elapsed at `now`.
    Delayed { now: DateTime<Utc> },
    /// The schedule with this identifier, if delayed until exactly `execution_date`.
    DelayedAt {
        identifier: String,
        execution_date: DateTime<Utc>,
    },
    /// The schedule with this identifier, if paused.
    Paused(String),
    /// Expired at `now` but still within the edit grace period.
    ActiveExpired { now: DateTime<Utc> },
    /// Expired at `now` and past the edit grace period.
    PastGrace { now: DateTime<Utc> },
}

/// Which schedules a delete removes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteScope {
    Identifier(String),
    Group(String),
    All,
    /// Schedules expired at `now` and past their edit grace period.
    PastGrace { now: DateTime<Utc> },
}

/// Filter for active trigger lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerQuery {
    /// Restrict to one schedule; `None` searches every schedule.
    pub schedule_id: Option<String>,
    pub trigger_type: TriggerType,
    /// Schedules not yet started, or past grace, at `now` are skipped.
    pub now: DateTime<Utc>,
}

/// Transactional storage used by the store worker.
///
/// Every method runs on the worker thread, one call at a time. Multi-record
/// methods must apply all of their writes or none of them.
pub trait ScheduleBackend: Send + 'static {
    /// Number of stored schedules.
    fn schedule_count(&mut self) -> Result<usize>;

    /// Insert schedules and their triggers in one transaction.
    ///
    /// Fails with [`crate::StoreError::DuplicateIdentifier`] if any identifier
    /// is already stored or repeated within `schedules`.
    fn insert_schedules(&mut self, schedules: &[Schedule]) -> Result<()>;

    /// Replace a stored schedule's fields and triggers. `false` if absent.
    fn update_schedule(&mut self, schedule: &Schedule) -> Result<bool>;

    /// Persist a state change. `false` if absent.
    fn set_execution_state(
        &mut self,
        identifier: &str,
        state: ExecutionState,
        changed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Persist trigger progress. `false` if absent.
    fn set_trigger_progress(&mut self, trigger_id: &str, progress: f64) -> Result<bool>;

    /// Delete matching schedules (and their triggers). Returns rows removed.
    fn delete_schedules(&mut self, scope: &DeleteScope) -> Result<usize>;

    /// Read matching schedules in insertion order.
    fn fetch_schedules(&mut self, query: &ScheduleQuery) -> Result<Vec<Schedule>>;

    /// Read triggers that are currently being evaluated.
    ///
    /// Execution triggers of pending schedules and cancellation triggers of
    /// delayed schedules.
    fn fetch_active_triggers(&mut self, query: &TriggerQuery) -> Result<Vec<Trigger>>;
}
