//! Shared test utilities used across unit test modules.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

use crate::schedule::{Schedule, ScheduleDelay, Trigger, TriggerType};

/// Millisecond timestamp as a UTC date.
pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .expect("valid millisecond timestamp")
}

/// Pending schedule with one foreground trigger.
pub fn simple_schedule(identifier: &str) -> Schedule {
    Schedule::new(identifier).with_trigger(Trigger::new(TriggerType::AppForeground, 1.0))
}

/// Schedule exercising every persisted field.
pub fn full_schedule(identifier: &str) -> Schedule {
    let delay = ScheduleDelay {
        seconds: 30,
        screens: vec!["home".to_owned(), "settings".to_owned()],
        region_id: Some("store-42".to_owned()),
        app_state: crate::schedule::DelayAppState::Foreground,
        cancellation_triggers: Vec::new(),
    }
    .with_cancellation_trigger(Trigger::new(TriggerType::AppBackground, 1.0));

    Schedule::new(identifier)
        .with_group("campaign")
        .with_priority(-3)
        .with_execution_limit(5)
        .with_interval(Duration::from_millis(1_500))
        .with_start_date(at(1_000))
        .with_end_date(at(1_000_000))
        .with_edit_grace_period(Duration::from_secs(3_600))
        .with_data(serde_json::json!({"message": {"alert": "hi"}}))
        .with_trigger(
            Trigger::new(TriggerType::CustomEventCount, 3.0)
                .with_predicate(serde_json::json!({"event_name": "purchase"}))
                .with_progress(1.0),
        )
        .with_trigger(Trigger::new(TriggerType::Screen, 1.0))
        .with_delay(delay)
}
