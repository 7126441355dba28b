//! Automation store: durable, capacity-limited persistence for schedules.
//!
//! A schedule is a deferred unit of work gated by one or more triggers. The
//! store records schedules and their triggers in SQLite, tracks each through
//! its lifecycle (pending, delayed, paused, executing, finished) and answers
//! state, group, expiry, and active-trigger queries.
//!
//! # Architecture
//!
//! - **[`schedule`]**: the data model and lifecycle state machine
//! - **[`store`]**: [`AutomationStore`], a handle to one worker thread that
//!   owns a [`ScheduleBackend`] and applies operations in submission order
//! - **[`config`]**: [`StoreConfig`], loadable from TOML
//! - **[`doctor`]**: health summary and expired-schedule cleanup

pub mod config;
pub mod doctor;
pub mod error;
pub mod schedule;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use schedule::{
    DelayAppState, ExecutionState, Schedule, ScheduleDelay, StateKind, Trigger, TriggerRole,
    TriggerType,
};
pub use store::{AutomationStore, Completion, ScheduleBackend, SqliteScheduleBackend};
