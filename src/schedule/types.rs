//! Schedule, trigger, and delay entities.
//!
//! Timestamps are persisted with millisecond precision; builder methods
//! truncate dates accordingly so a saved schedule reads back equal.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::state::ExecutionState;
use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of event a trigger counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    AppForeground,
    AppBackground,
    AppInit,
    ActiveSession,
    RegionEnter,
    RegionExit,
    CustomEventCount,
    CustomEventValue,
    Screen,
    Version,
}

impl TriggerType {
    /// Stable name, as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppForeground => "app_foreground",
            Self::AppBackground => "app_background",
            Self::AppInit => "app_init",
            Self::ActiveSession => "active_session",
            Self::RegionEnter => "region_enter",
            Self::RegionExit => "region_exit",
            Self::CustomEventCount => "custom_event_count",
            Self::CustomEventValue => "custom_event_value",
            Self::Screen => "screen",
            Self::Version => "version",
        }
    }

    /// Parse a persisted trigger type name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app_foreground" => Some(Self::AppForeground),
            "app_background" => Some(Self::AppBackground),
            "app_init" => Some(Self::AppInit),
            "active_session" => Some(Self::ActiveSession),
            "region_enter" => Some(Self::RegionEnter),
            "region_exit" => Some(Self::RegionExit),
            "custom_event_count" => Some(Self::CustomEventCount),
            "custom_event_value" => Some(Self::CustomEventValue),
            "screen" => Some(Self::Screen),
            "version" => Some(Self::Version),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a trigger advances its schedule or cancels the schedule's delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRole {
    /// Counts toward moving a pending schedule to execution.
    #[default]
    Execution,
    /// Counts toward cancelling a delayed schedule's pending execution.
    Cancellation,
}

impl TriggerRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Cancellation => "cancellation",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(Self::Execution),
            "cancellation" => Some(Self::Cancellation),
            _ => None,
        }
    }
}

/// App state a delay waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayAppState {
    #[default]
    Any,
    Foreground,
    Background,
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// A counted condition owned by exactly one schedule.
///
/// `schedule_id` is a plain back-reference used for joins; a trigger never
/// keeps its schedule alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,
    pub schedule_id: String,
    #[serde(default)]
    pub role: TriggerRole,
    pub trigger_type: TriggerType,
    pub goal: f64,
    #[serde(default)]
    pub progress: f64,
    /// Opaque event predicate, persisted verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<serde_json::Value>,
}

impl Trigger {
    /// New execution trigger with a generated id and zero progress.
    pub fn new(trigger_type: TriggerType, goal: f64) -> Self {
        Self {
            trigger_id: uuid::Uuid::new_v4().to_string(),
            schedule_id: String::new(),
            role: TriggerRole::Execution,
            trigger_type,
            goal,
            progress: 0.0,
            predicate: None,
        }
    }

    /// Attach an opaque event predicate.
    pub fn with_predicate(mut self, predicate: serde_json::Value) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Start from existing progress.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    /// `true` once progress has reached the goal.
    #[must_use]
    pub fn is_met(&self) -> bool {
        self.progress >= self.goal
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Conditions that hold a triggered schedule back before execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleDelay {
    /// Minimum seconds between triggering and execution.
    #[serde(default)]
    pub seconds: u64,
    /// Screens the app must be on.
    #[serde(default)]
    pub screens: Vec<String>,
    /// Region the device must be in.
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub app_state: DelayAppState,
    /// Triggers that cancel the delayed execution.
    #[serde(default)]
    pub cancellation_triggers: Vec<Trigger>,
}

impl ScheduleDelay {
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn with_cancellation_trigger(mut self, mut trigger: Trigger) -> Self {
        trigger.role = TriggerRole::Cancellation;
        self.cancellation_triggers.push(trigger);
        self
    }

    /// Date at which a delay started at `triggered_at` elapses.
    #[must_use]
    pub fn execution_date(&self, triggered_at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.seconds).unwrap_or(i64::MAX);
        TimeDelta::try_seconds(secs)
            .and_then(|delta| triggered_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

fn default_execution_limit() -> u32 {
    1
}

fn default_data() -> serde_json::Value {
    serde_json::Value::Null
}

/// A persisted, triggerable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique store-wide, immutable.
    pub identifier: String,
    /// Tag used for bulk lookup and deletion.
    #[serde(default)]
    pub group: Option<String>,
    /// Executor hint, opaque to the store.
    #[serde(default)]
    pub priority: i64,
    /// How many times the executor may run this schedule.
    #[serde(default = "default_execution_limit")]
    pub execution_limit: u32,
    /// How many times it has run so far.
    #[serde(default)]
    pub triggered_count: u32,
    /// Minimum time between executions, opaque to the store.
    #[serde(default)]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// How long an expired schedule stays queryable as active-expired.
    #[serde(default)]
    pub edit_grace_period: Option<Duration>,
    #[serde(default)]
    pub execution_state: ExecutionState,
    pub execution_state_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub delay: Option<ScheduleDelay>,
    /// Opaque action payload, persisted verbatim.
    #[serde(default = "default_data")]
    pub data: serde_json::Value,
    /// Execution triggers in evaluation order.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl Schedule {
    /// New pending schedule with no triggers.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            group: None,
            priority: 0,
            execution_limit: default_execution_limit(),
            triggered_count: 0,
            interval: None,
            start_date: None,
            end_date: None,
            edit_grace_period: None,
            execution_state: ExecutionState::Pending,
            execution_state_changed_at: now_millis(),
            delay: None,
            data: default_data(),
            triggers: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_execution_limit(mut self, limit: u32) -> Self {
        self.execution_limit = limit;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(truncate_duration(interval));
        self
    }

    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(truncate_millis(start));
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(truncate_millis(end));
        self
    }

    pub fn with_edit_grace_period(mut self, grace: Duration) -> Self {
        self.edit_grace_period = Some(truncate_duration(grace));
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Append an execution trigger owned by this schedule.
    pub fn with_trigger(mut self, mut trigger: Trigger) -> Self {
        trigger.schedule_id = self.identifier.clone();
        trigger.role = TriggerRole::Execution;
        self.triggers.push(trigger);
        self
    }

    /// Set the delay; its cancellation triggers become owned by this schedule.
    pub fn with_delay(mut self, mut delay: ScheduleDelay) -> Self {
        for trigger in &mut delay.cancellation_triggers {
            trigger.schedule_id = self.identifier.clone();
            trigger.role = TriggerRole::Cancellation;
        }
        self.delay = Some(delay);
        self
    }

    /// Canonical form of this schedule, as the store persists it.
    ///
    /// Truncates timestamps and durations to milliseconds and stamps every
    /// trigger with this schedule's identifier and the role of its list.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.interval = self.interval.map(truncate_duration);
        self.start_date = self.start_date.map(truncate_millis);
        self.end_date = self.end_date.map(truncate_millis);
        self.edit_grace_period = self.edit_grace_period.map(truncate_duration);
        self.execution_state = normalize_state(self.execution_state);
        self.execution_state_changed_at = truncate_millis(self.execution_state_changed_at);

        for trigger in &mut self.triggers {
            trigger.schedule_id = self.identifier.clone();
            trigger.role = TriggerRole::Execution;
        }
        if let Some(delay) = self.delay.as_mut() {
            for trigger in &mut delay.cancellation_triggers {
                trigger.schedule_id = self.identifier.clone();
                trigger.role = TriggerRole::Cancellation;
            }
        }
        self
    }

    /// Check that the schedule is already in [`Schedule::normalized`] form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidSchedule`] for an empty identifier, a
    /// timestamp or duration finer than a millisecond, or a trigger whose
    /// `schedule_id` or `role` does not match the list holding it.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(self.invalid("identifier must not be empty".to_owned()));
        }

        let dates = [
            ("start_date", self.start_date),
            ("end_date", self.end_date),
            ("execution_state_changed_at", Some(self.execution_state_changed_at)),
            ("delayed execution date", self.delayed_execution_date()),
        ];
        for (field, date) in dates {
            if date.is_some_and(|d| d != truncate_millis(d)) {
                return Err(self.invalid(format!("{field} has sub-millisecond precision")));
            }
        }

        let durations = [
            ("interval", self.interval),
            ("edit_grace_period", self.edit_grace_period),
        ];
        for (field, duration) in durations {
            if duration.is_some_and(|d| d != truncate_duration(d)) {
                return Err(self.invalid(format!("{field} has sub-millisecond precision")));
            }
        }

        let cancellation = self
            .delay
            .iter()
            .flat_map(|delay| delay.cancellation_triggers.iter())
            .map(|t| (TriggerRole::Cancellation, t));
        let owned = self
            .triggers
            .iter()
            .map(|t| (TriggerRole::Execution, t))
            .chain(cancellation);
        for (role, trigger) in owned {
            if trigger.schedule_id != self.identifier {
                return Err(self.invalid(format!(
                    "trigger {} refers to schedule `{}`",
                    trigger.trigger_id, trigger.schedule_id
                )));
            }
            if trigger.role != role {
                return Err(self.invalid(format!(
                    "trigger {} has role {} but is listed as {}",
                    trigger.trigger_id,
                    trigger.role.as_str(),
                    role.as_str()
                )));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> StoreError {
        StoreError::InvalidSchedule {
            identifier: self.identifier.clone(),
            reason,
        }
    }

    /// Delayed execution date; `Some` exactly when the state is delayed.
    #[must_use]
    pub fn delayed_execution_date(&self) -> Option<DateTime<Utc>> {
        self.execution_state.delayed_until()
    }

    /// Move to `state`, stamping the change time.
    pub fn transition_to(&mut self, state: ExecutionState, at: DateTime<Utc>) {
        self.execution_state = normalize_state(state);
        self.execution_state_changed_at = truncate_millis(at);
    }

    /// Execution triggers followed by the delay's cancellation triggers.
    pub fn all_triggers(&self) -> impl Iterator<Item = &Trigger> {
        let cancellation = self
            .delay
            .iter()
            .flat_map(|delay| delay.cancellation_triggers.iter());
        self.triggers.iter().chain(cancellation)
    }

    /// `true` once the start date (if any) has been reached.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_date.is_none_or(|start| start <= now)
    }

    /// `true` when the end date has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end < now)
    }

    /// Expired but still inside the edit grace period.
    #[must_use]
    pub fn is_active_expired(&self, now: DateTime<Utc>) -> bool {
        match self.grace_deadline() {
            Some(deadline) => self.is_expired(now) && now <= deadline,
            None => false,
        }
    }

    /// Expired and past the edit grace period; eligible for cleanup.
    #[must_use]
    pub fn is_past_grace(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) && !self.is_active_expired(now)
    }

    /// End date plus grace period.
    #[must_use]
    pub fn grace_deadline(&self) -> Option<DateTime<Utc>> {
        let end = self.end_date?;
        let grace = self.edit_grace_period.unwrap_or_default();
        let deadline = TimeDelta::from_std(grace)
            .ok()
            .and_then(|delta| end.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(deadline)
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Current time truncated to the persisted precision.
pub(crate) fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

/// Drop sub-millisecond precision.
pub(crate) fn truncate_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

fn truncate_duration(d: Duration) -> Duration {
    Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

pub(crate) fn normalize_state(state: ExecutionState) -> ExecutionState {
    match state {
        ExecutionState::Delayed { until } => ExecutionState::Delayed {
            until: truncate_millis(until),
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn new_schedule_has_correct_defaults() {
        let schedule = Schedule::new("welcome");
        assert_eq!(schedule.identifier, "welcome");
        assert!(schedule.group.is_none());
        assert_eq!(schedule.execution_state, ExecutionState::Pending);
        assert_eq!(schedule.execution_limit, 1);
        assert!(schedule.delayed_execution_date().is_none());
        assert!(schedule.triggers.is_empty());
        assert_eq!(
            schedule.execution_state_changed_at.timestamp_subsec_nanos() % 1_000_000,
            0
        );
    }

    #[test]
    fn with_trigger_sets_back_reference() {
        let schedule =
            Schedule::new("s1").with_trigger(Trigger::new(TriggerType::AppForeground, 3.0));
        assert_eq!(schedule.triggers.len(), 1);
        assert_eq!(schedule.triggers[0].schedule_id, "s1");
        assert_eq!(schedule.triggers[0].role, TriggerRole::Execution);
    }

    #[test]
    fn delay_cancellation_triggers_are_owned_by_schedule() {
        let delay = ScheduleDelay::new(30)
            .with_cancellation_trigger(Trigger::new(TriggerType::AppBackground, 1.0));
        let schedule = Schedule::new("s1")
            .with_trigger(Trigger::new(TriggerType::Screen, 1.0))
            .with_delay(delay);

        let cancel = &schedule.delay.as_ref().unwrap().cancellation_triggers[0];
        assert_eq!(cancel.schedule_id, "s1");
        assert_eq!(cancel.role, TriggerRole::Cancellation);
        assert_eq!(schedule.all_triggers().count(), 2);
    }

    #[test]
    fn trigger_is_met_at_goal() {
        let trigger = Trigger::new(TriggerType::CustomEventCount, 2.0);
        assert!(!trigger.is_met());
        assert!(!trigger.clone().with_progress(1.5).is_met());
        assert!(trigger.with_progress(2.0).is_met());
    }

    #[test]
    fn trigger_ids_are_unique() {
        let a = Trigger::new(TriggerType::AppInit, 1.0);
        let b = Trigger::new(TriggerType::AppInit, 1.0);
        assert_ne!(a.trigger_id, b.trigger_id);
    }

    #[test]
    fn transition_sets_delay_date_and_change_time() {
        let mut schedule = Schedule::new("s1");
        schedule.transition_to(ExecutionState::Delayed { until: at(10_000) }, at(1_000));
        assert_eq!(schedule.delayed_execution_date(), Some(at(10_000)));
        assert_eq!(schedule.execution_state_changed_at, at(1_000));

        schedule.transition_to(ExecutionState::Pending, at(10_000));
        assert!(schedule.delayed_execution_date().is_none());
    }

    #[test]
    fn expiry_windows() {
        let schedule = Schedule::new("s1")
            .with_end_date(at(1_000))
            .with_edit_grace_period(Duration::from_secs(10));

        // Before the end date.
        assert!(!schedule.is_expired(at(500)));
        assert!(!schedule.is_active_expired(at(500)));
        assert!(!schedule.is_past_grace(at(500)));

        // Exactly at the end date is not yet expired.
        assert!(!schedule.is_expired(at(1_000)));

        // Inside the grace period.
        assert!(schedule.is_active_expired(at(5_000)));
        assert!(schedule.is_active_expired(at(11_000)));

        // Past the grace period.
        assert!(schedule.is_past_grace(at(11_001)));
        assert!(!schedule.is_active_expired(at(11_001)));
    }

    #[test]
    fn no_grace_period_goes_straight_past_grace() {
        let schedule = Schedule::new("s1").with_end_date(at(1_000));
        assert!(!schedule.is_active_expired(at(1_001)));
        assert!(schedule.is_past_grace(at(1_001)));
    }

    #[test]
    fn no_end_date_never_expires() {
        let schedule = Schedule::new("s1").with_edit_grace_period(Duration::from_secs(1));
        assert!(!schedule.is_expired(at(i64::from(i32::MAX))));
        assert!(schedule.grace_deadline().is_none());
    }

    #[test]
    fn has_started_respects_start_date() {
        let open = Schedule::new("open");
        assert!(open.has_started(at(0)));

        let later = Schedule::new("later").with_start_date(at(2_000));
        assert!(!later.has_started(at(1_999)));
        assert!(later.has_started(at(2_000)));
    }

    #[test]
    fn builder_truncates_to_millis() {
        let precise = at(1_234) + TimeDelta::nanoseconds(567);
        let schedule = Schedule::new("s1").with_start_date(precise);
        assert_eq!(schedule.start_date, Some(at(1_234)));
    }

    #[test]
    fn delay_execution_date_adds_seconds() {
        let delay = ScheduleDelay::new(90);
        assert_eq!(delay.execution_date(at(0)), at(90_000));
    }

    #[test]
    fn trigger_type_names_parse_back() {
        for ty in [
            TriggerType::AppForeground,
            TriggerType::AppBackground,
            TriggerType::AppInit,
            TriggerType::ActiveSession,
            TriggerType::RegionEnter,
            TriggerType::RegionExit,
            TriggerType::CustomEventCount,
            TriggerType::CustomEventValue,
            TriggerType::Screen,
            TriggerType::Version,
        ] {
            assert_eq!(TriggerType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TriggerType::parse("bogus"), None);
    }

    #[test]
    fn builder_schedules_validate() {
        let schedule = Schedule::new("s1")
            .with_start_date(at(1_000))
            .with_trigger(Trigger::new(TriggerType::AppInit, 1.0))
            .with_delay(
                ScheduleDelay::new(5)
                    .with_cancellation_trigger(Trigger::new(TriggerType::AppBackground, 1.0)),
            );
        schedule.validate().expect("builder output is canonical");
    }

    #[test]
    fn public_field_edits_are_rejected_until_normalized() {
        let mut schedule = Schedule::new("s1");
        schedule.start_date = Some(at(1_000) + TimeDelta::nanoseconds(250));
        schedule.triggers.push(Trigger::new(TriggerType::Screen, 1.0));

        match schedule.validate() {
            Err(StoreError::InvalidSchedule { reason, .. }) => assert!(reason.contains("start_date")),
            other => panic!("expected invalid start date, got {other:?}"),
        }

        schedule.start_date = Some(at(1_000));
        match schedule.validate() {
            Err(StoreError::InvalidSchedule { reason, .. }) => assert!(reason.contains("refers to")),
            other => panic!("expected foreign trigger, got {other:?}"),
        }

        let normalized = schedule.normalized();
        normalized.validate().expect("normalized");
        assert_eq!(normalized.triggers[0].schedule_id, "s1");
    }

    #[test]
    fn misplaced_trigger_role_is_rejected() {
        let mut schedule =
            Schedule::new("s1").with_trigger(Trigger::new(TriggerType::AppInit, 1.0));
        schedule.triggers[0].role = TriggerRole::Cancellation;
        assert!(schedule.validate().is_err());
        assert_eq!(schedule.normalized().triggers[0].role, TriggerRole::Execution);
    }

    #[test]
    fn empty_identifier_is_rejected() {
        assert!(Schedule::new("").validate().is_err());
    }

    #[test]
    fn sub_millisecond_delay_date_is_rejected() {
        let mut schedule = Schedule::new("s1");
        schedule.execution_state = ExecutionState::Delayed {
            until: at(5_000) + TimeDelta::microseconds(3),
        };
        assert!(schedule.validate().is_err());
        assert_eq!(schedule.normalized().delayed_execution_date(), Some(at(5_000)));
    }
}
