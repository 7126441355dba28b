//! Lifecycle states.
//!
//! The delayed execution date is carried by the `Delayed` variant, so a
//! schedule can never hold a delay date outside the delayed state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a schedule is in its lifecycle.
///
/// EXPIRED is not a variant: it is derived from the schedule's end date and
/// a caller-supplied clock (see [`crate::Schedule::is_expired`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    /// Waiting for its triggers. Default after save.
    #[default]
    Pending,
    /// Triggers fired; execution is held back until `until`.
    Delayed {
        /// Delayed execution date.
        until: DateTime<Utc>,
    },
    /// Excluded from trigger evaluation until resumed.
    Paused,
    /// The executor is running the schedule's work.
    Executing,
    /// No executions remain.
    Finished,
}

/// State discriminant without the delay date, used for state-filtered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Pending,
    Delayed,
    Paused,
    Executing,
    Finished,
}

impl ExecutionState {
    /// Discriminant of this state.
    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Pending => StateKind::Pending,
            Self::Delayed { .. } => StateKind::Delayed,
            Self::Paused => StateKind::Paused,
            Self::Executing => StateKind::Executing,
            Self::Finished => StateKind::Finished,
        }
    }

    /// Delayed execution date, present only in the delayed state.
    #[must_use]
    pub fn delayed_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Delayed { until } => Some(*until),
            _ => None,
        }
    }

    /// `true` when delayed and the delay has not yet elapsed at `now`.
    #[must_use]
    pub fn is_still_delayed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::Delayed { until } if *until > now)
    }
}

impl StateKind {
    /// Stable lowercase name, as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delayed => "delayed",
            Self::Paused => "paused",
            Self::Executing => "executing",
            Self::Finished => "finished",
        }
    }

    /// Parse a persisted state name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delayed" => Some(Self::Delayed),
            "paused" => Some(Self::Paused),
            "executing" => Some(Self::Executing),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delayed { until } => write!(f, "delayed until {}", until.to_rfc3339()),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn default_state_is_pending() {
        assert_eq!(ExecutionState::default(), ExecutionState::Pending);
    }

    #[test]
    fn delay_date_only_present_when_delayed() {
        let delayed = ExecutionState::Delayed { until: at(5_000) };
        assert_eq!(delayed.delayed_until(), Some(at(5_000)));
        for state in [
            ExecutionState::Pending,
            ExecutionState::Paused,
            ExecutionState::Executing,
            ExecutionState::Finished,
        ] {
            assert!(state.delayed_until().is_none());
        }
    }

    #[test]
    fn still_delayed_until_the_date() {
        let delayed = ExecutionState::Delayed { until: at(5_000) };
        assert!(delayed.is_still_delayed(at(4_999)));
        assert!(!delayed.is_still_delayed(at(5_000)));
        assert!(!delayed.is_still_delayed(at(6_000)));
        assert!(!ExecutionState::Pending.is_still_delayed(at(0)));
    }

    #[test]
    fn state_names_parse_back() {
        for kind in [
            StateKind::Pending,
            StateKind::Delayed,
            StateKind::Paused,
            StateKind::Executing,
            StateKind::Finished,
        ] {
            assert_eq!(StateKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StateKind::parse("expired"), None);
    }

    #[test]
    fn display_includes_delay_date() {
        assert_eq!(ExecutionState::Paused.to_string(), "paused");
        let text = ExecutionState::Delayed { until: at(0) }.to_string();
        assert!(text.starts_with("delayed until 1970-01-01"));
    }
}
