//! SQLite-backed schedule backend.
//!
//! Backed by a single database file at `{root_dir}/{store_name}.db`, or by a
//! private in-memory database for ephemeral stores.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::{DeleteScope, ScheduleBackend, ScheduleQuery, TriggerQuery};
use super::schema::{apply_schema, read_schema_version};
use crate::error::{Result, StoreError};
use crate::schedule::types::normalize_state;
use crate::schedule::{
    DelayAppState, ExecutionState, Schedule, ScheduleDelay, StateKind, Trigger, TriggerRole,
    TriggerType,
};

/// Column list shared by every schedule read, in `row_to_schedule` order.
const SCHEDULE_COLUMNS: &str = "identifier, group_id, priority, execution_limit, \
     triggered_count, interval_ms, start_at, end_at, edit_grace_ms, execution_state, \
     execution_state_changed_at, delayed_execution_at, delay, data";

const TRIGGER_COLUMNS: &str =
    "trigger_id, schedule_id, role, trigger_type, goal, progress, predicate";

/// SQLite implementation of [`ScheduleBackend`].
///
/// Owned by the store worker thread; never shared.
pub struct SqliteScheduleBackend {
    path: Option<PathBuf>,
    conn: Connection,
}

impl SqliteScheduleBackend {
    /// Open (or create) the database file at `db_path`.
    ///
    /// Creates the parent directory and applies the schema if needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        apply_schema(&conn)?;
        debug!(path = %db_path.display(), "opened schedule database");
        Ok(Self {
            path: Some(db_path.to_path_buf()),
            conn,
        })
    }

    /// Open a private in-memory database. Contents vanish on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { path: None, conn })
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the schema version from the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        Ok(read_schema_version(&self.conn)?)
    }

    fn attach_triggers(&self, schedule: &mut Schedule) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE schedule_id = ?1 \
             ORDER BY role = 'cancellation', position"
        ))?;
        let rows = stmt.query_map(params![schedule.identifier], row_to_trigger)?;

        for r in rows {
            let trigger = r?;
            match trigger.role {
                TriggerRole::Execution => schedule.triggers.push(trigger),
                TriggerRole::Cancellation => {
                    // Cancellation triggers only exist alongside a delay.
                    if let Some(delay) = schedule.delay.as_mut() {
                        delay.cancellation_triggers.push(trigger);
                    }
                }
            }
        }
        Ok(())
    }
}

impl ScheduleBackend for SqliteScheduleBackend {
    fn schedule_count(&mut self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn insert_schedules(&mut self, schedules: &[Schedule]) -> Result<()> {
        let tx = self.conn.transaction()?;

        for schedule in schedules {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM schedules WHERE identifier = ?1",
                    params![schedule.identifier],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                // Dropping `tx` rolls back every row inserted so far.
                return Err(StoreError::DuplicateIdentifier(
                    schedule.identifier.clone(),
                ));
            }

            insert_schedule_row(&tx, schedule)?;
            insert_triggers(&tx, schedule)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn update_schedule(&mut self, schedule: &Schedule) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let cols = ScheduleColumns::from_schedule(schedule)?;

        let rows = tx.execute(
            "UPDATE schedules SET group_id = ?2, priority = ?3, execution_limit = ?4, \
             triggered_count = ?5, interval_ms = ?6, start_at = ?7, end_at = ?8, \
             edit_grace_ms = ?9, execution_state = ?10, execution_state_changed_at = ?11, \
             delayed_execution_at = ?12, delay = ?13, data = ?14 \
             WHERE identifier = ?1",
            params![
                schedule.identifier,
                schedule.group,
                schedule.priority,
                schedule.execution_limit,
                schedule.triggered_count,
                cols.interval_ms,
                cols.start_at,
                cols.end_at,
                cols.edit_grace_ms,
                cols.state,
                cols.state_changed_at,
                cols.delayed_at,
                cols.delay,
                cols.data,
            ],
        )?;
        if rows == 0 {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM triggers WHERE schedule_id = ?1",
            params![schedule.identifier],
        )?;
        insert_triggers(&tx, schedule)?;

        tx.commit()?;
        Ok(true)
    }

    fn set_execution_state(
        &mut self,
        identifier: &str,
        state: ExecutionState,
        changed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let (state_str, delayed_at) = state_columns(&normalize_state(state));
        let rows = self.conn.execute(
            "UPDATE schedules SET execution_state = ?1, delayed_execution_at = ?2, \
             execution_state_changed_at = ?3 WHERE identifier = ?4",
            params![
                state_str,
                delayed_at,
                changed_at.timestamp_millis(),
                identifier
            ],
        )?;
        Ok(rows > 0)
    }

    fn set_trigger_progress(&mut self, trigger_id: &str, progress: f64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE triggers SET progress = ?1 WHERE trigger_id = ?2",
            params![progress, trigger_id],
        )?;
        Ok(rows > 0)
    }

    fn delete_schedules(&mut self, scope: &DeleteScope) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let rows = match scope {
            DeleteScope::Identifier(id) => {
                tx.execute("DELETE FROM schedules WHERE identifier = ?1", params![id])?
            }
            DeleteScope::Group(group) => {
                tx.execute("DELETE FROM schedules WHERE group_id = ?1", params![group])?
            }
            DeleteScope::All => tx.execute("DELETE FROM schedules", [])?,
            DeleteScope::PastGrace { now } => tx.execute(
                &format!("DELETE FROM schedules {PAST_GRACE_CLAUSE}"),
                params![now.timestamp_millis()],
            )?,
        };
        tx.commit()?;
        Ok(rows)
    }

    fn fetch_schedules(&mut self, query: &ScheduleQuery) -> Result<Vec<Schedule>> {
        let (clause, args) = query_clause(query);
        let mut schedules = {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules {clause} ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), row_to_schedule)?;

            let mut schedules = Vec::new();
            for r in rows {
                schedules.push(r?);
            }
            schedules
        };

        for schedule in &mut schedules {
            self.attach_triggers(schedule)?;
        }
        Ok(schedules)
    }

    fn fetch_active_triggers(&mut self, query: &TriggerQuery) -> Result<Vec<Trigger>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.trigger_id, t.schedule_id, t.role, t.trigger_type, t.goal, \
             t.progress, t.predicate \
             FROM triggers t JOIN schedules s ON s.identifier = t.schedule_id \
             WHERE t.trigger_type = ?1 \
               AND (?2 IS NULL OR t.schedule_id = ?2) \
               AND (s.start_at IS NULL OR s.start_at <= ?3) \
               AND NOT (s.end_at IS NOT NULL AND ?3 > s.end_at + COALESCE(s.edit_grace_ms, 0)) \
               AND ((t.role = 'execution' AND s.execution_state = 'pending') \
                 OR (t.role = 'cancellation' AND s.execution_state = 'delayed')) \
             ORDER BY s.seq, t.role = 'cancellation', t.position",
        )?;
        let schedule_id = match &query.schedule_id {
            Some(id) => Value::Text(id.clone()),
            None => Value::Null,
        };
        let rows = stmt.query_map(
            params_from_iter([
                Value::Text(query.trigger_type.as_str().to_owned()),
                schedule_id,
                Value::Integer(query.now.timestamp_millis()),
            ]),
            row_to_trigger,
        )?;

        let mut triggers = Vec::new();
        for r in rows {
            triggers.push(r?);
        }
        Ok(triggers)
    }
}

// ---------------------------------------------------------------------------
// Write helpers
// ---------------------------------------------------------------------------

/// Delay column contents; cancellation triggers live in the `triggers` table.
#[derive(Debug, Serialize, Deserialize)]
struct DelayRecord {
    seconds: u64,
    #[serde(default)]
    screens: Vec<String>,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    app_state: DelayAppState,
}

/// Schedule fields converted to their column representation.
struct ScheduleColumns {
    interval_ms: Option<i64>,
    start_at: Option<i64>,
    end_at: Option<i64>,
    edit_grace_ms: Option<i64>,
    state: &'static str,
    state_changed_at: i64,
    delayed_at: Option<i64>,
    delay: Option<String>,
    data: String,
}

impl ScheduleColumns {
    fn from_schedule(schedule: &Schedule) -> Result<Self> {
        let (state, delayed_at) = state_columns(&normalize_state(schedule.execution_state));
        let delay = match &schedule.delay {
            Some(delay) => Some(serde_json::to_string(&DelayRecord {
                seconds: delay.seconds,
                screens: delay.screens.clone(),
                region_id: delay.region_id.clone(),
                app_state: delay.app_state,
            })?),
            None => None,
        };

        Ok(Self {
            interval_ms: schedule.interval.map(duration_to_millis),
            start_at: schedule.start_date.map(|d| d.timestamp_millis()),
            end_at: schedule.end_date.map(|d| d.timestamp_millis()),
            edit_grace_ms: schedule.edit_grace_period.map(duration_to_millis),
            state,
            state_changed_at: schedule.execution_state_changed_at.timestamp_millis(),
            delayed_at,
            delay,
            data: serde_json::to_string(&schedule.data)?,
        })
    }
}

fn insert_schedule_row(tx: &Transaction<'_>, schedule: &Schedule) -> Result<()> {
    let cols = ScheduleColumns::from_schedule(schedule)?;
    tx.execute(
        &format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            schedule.identifier,
            schedule.group,
            schedule.priority,
            schedule.execution_limit,
            schedule.triggered_count,
            cols.interval_ms,
            cols.start_at,
            cols.end_at,
            cols.edit_grace_ms,
            cols.state,
            cols.state_changed_at,
            cols.delayed_at,
            cols.delay,
            cols.data,
        ],
    )?;
    Ok(())
}

/// Insert execution triggers, then the delay's cancellation triggers.
fn insert_triggers(tx: &Transaction<'_>, schedule: &Schedule) -> Result<()> {
    let execution_count = schedule.triggers.len();
    let mut stmt = tx.prepare_cached(
        "INSERT INTO triggers \
         (trigger_id, schedule_id, role, position, trigger_type, goal, progress, predicate) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (position, trigger) in schedule.all_triggers().enumerate() {
        let role = if position < execution_count {
            TriggerRole::Execution
        } else {
            TriggerRole::Cancellation
        };
        let predicate = match &trigger.predicate {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };
        stmt.execute(params![
            trigger.trigger_id,
            schedule.identifier,
            role.as_str(),
            i64::try_from(position).unwrap_or(i64::MAX),
            trigger.trigger_type.as_str(),
            trigger.goal,
            trigger.progress,
            predicate,
        ])?;
    }
    Ok(())
}

/// Expired at `?1` and past the edit grace period.
const PAST_GRACE_CLAUSE: &str = "WHERE end_at IS NOT NULL AND end_at < ?1 \
     AND ?1 > end_at + COALESCE(edit_grace_ms, 0)";

/// WHERE clause and positional arguments for a schedule query.
fn query_clause(query: &ScheduleQuery) -> (&'static str, Vec<Value>) {
    match query {
        ScheduleQuery::All => ("", Vec::new()),
        ScheduleQuery::Identifier(id) => ("WHERE identifier = ?1", vec![Value::Text(id.clone())]),
        ScheduleQuery::Group { group, now } => (
            "WHERE group_id = ?1 \
             AND NOT (end_at IS NOT NULL AND ?2 > end_at + COALESCE(edit_grace_ms, 0))",
            vec![Value::Text(group.clone()), Value::Integer(now.timestamp_millis())],
        ),
        ScheduleQuery::InState { kind, now } => (
            "WHERE execution_state = ?1 \
             AND NOT (end_at IS NOT NULL AND ?2 > end_at + COALESCE(edit_grace_ms, 0))",
            vec![
                Value::Text(kind.as_str().to_owned()),
                Value::Integer(now.timestamp_millis()),
            ],
        ),
        ScheduleQuery::Delayed { now } => (
            "WHERE execution_state = 'delayed' AND delayed_execution_at > ?1 \
             AND NOT (end_at IS NOT NULL AND ?1 > end_at + COALESCE(edit_grace_ms, 0))",
            vec![Value::Integer(now.timestamp_millis())],
        ),
        ScheduleQuery::DelayedAt {
            identifier,
            execution_date,
        } => (
            "WHERE identifier = ?1 AND execution_state = 'delayed' \
             AND delayed_execution_at = ?2",
            vec![
                Value::Text(identifier.clone()),
                Value::Integer(execution_date.timestamp_millis()),
            ],
        ),
        ScheduleQuery::Paused(id) => (
            "WHERE identifier = ?1 AND execution_state = 'paused'",
            vec![Value::Text(id.clone())],
        ),
        ScheduleQuery::ActiveExpired { now } => (
            "WHERE end_at IS NOT NULL AND end_at < ?1 \
             AND ?1 <= end_at + COALESCE(edit_grace_ms, 0)",
            vec![Value::Integer(now.timestamp_millis())],
        ),
        ScheduleQuery::PastGrace { now } => (
            PAST_GRACE_CLAUSE,
            vec![Value::Integer(now.timestamp_millis())],
        ),
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let state_str: String = row.get(9)?;
    let delayed_at: Option<i64> = row.get(11)?;
    let delay_json: Option<String> = row.get(12)?;
    let data_json: String = row.get(13)?;

    let delay = match delay_json {
        Some(json) => {
            let record: DelayRecord =
                serde_json::from_str(&json).map_err(|e| json_error(12, e))?;
            Some(ScheduleDelay {
                seconds: record.seconds,
                screens: record.screens,
                region_id: record.region_id,
                app_state: record.app_state,
                cancellation_triggers: Vec::new(),
            })
        }
        None => None,
    };

    Ok(Schedule {
        identifier: row.get(0)?,
        group: row.get(1)?,
        priority: row.get(2)?,
        execution_limit: row.get(3)?,
        triggered_count: row.get(4)?,
        interval: row.get::<_, Option<i64>>(5)?.map(millis_to_duration),
        start_date: opt_date(6, row.get(6)?)?,
        end_date: opt_date(7, row.get(7)?)?,
        edit_grace_period: row.get::<_, Option<i64>>(8)?.map(millis_to_duration),
        execution_state: str_to_state(&state_str, delayed_at)?,
        execution_state_changed_at: millis_to_date(10, row.get(10)?)?,
        delay,
        data: serde_json::from_str(&data_json).map_err(|e| json_error(13, e))?,
        triggers: Vec::new(),
    })
}

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
    let role_str: String = row.get(2)?;
    let type_str: String = row.get(3)?;
    let predicate_json: Option<String> = row.get(6)?;

    let role = TriggerRole::parse(&role_str)
        .ok_or_else(|| conversion_error(2, format!("unknown trigger role `{role_str}`")))?;
    let trigger_type = TriggerType::parse(&type_str)
        .ok_or_else(|| conversion_error(3, format!("unknown trigger type `{type_str}`")))?;
    let predicate = match predicate_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| json_error(6, e))?),
        None => None,
    };

    Ok(Trigger {
        trigger_id: row.get(0)?,
        schedule_id: row.get(1)?,
        role,
        trigger_type,
        goal: row.get(4)?,
        progress: row.get(5)?,
        predicate,
    })
}

// ---------------------------------------------------------------------------
// Enum / time conversions
// ---------------------------------------------------------------------------

fn state_columns(state: &ExecutionState) -> (&'static str, Option<i64>) {
    (
        state.kind().as_str(),
        state.delayed_until().map(|d| d.timestamp_millis()),
    )
}

fn str_to_state(s: &str, delayed_at: Option<i64>) -> rusqlite::Result<ExecutionState> {
    let kind = StateKind::parse(s)
        .ok_or_else(|| conversion_error(9, format!("unknown execution state `{s}`")))?;
    Ok(match kind {
        StateKind::Pending => ExecutionState::Pending,
        StateKind::Delayed => {
            let ms = delayed_at
                .ok_or_else(|| conversion_error(11, "delayed schedule without a delay date"))?;
            ExecutionState::Delayed {
                until: millis_to_date(11, ms)?,
            }
        }
        StateKind::Paused => ExecutionState::Paused,
        StateKind::Executing => ExecutionState::Executing,
        StateKind::Finished => ExecutionState::Finished,
    })
}

fn millis_to_date(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp {ms} out of range")))
}

fn opt_date(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| millis_to_date(idx, ms)).transpose()
}

fn millis_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn duration_to_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn json_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
