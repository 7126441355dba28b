//! Schedule and trigger entities.
//!
//! Sub-modules:
//! - `types`: `Schedule`, `Trigger`, `ScheduleDelay` and their enums.
//! - `state`: the lifecycle state enum and derived expiry predicates.

pub mod state;
pub mod types;

pub use state::{ExecutionState, StateKind};
pub use types::{DelayAppState, Schedule, ScheduleDelay, Trigger, TriggerRole, TriggerType};
