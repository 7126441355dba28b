//! SQLite DDL for the schedule store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Version stamped into `schema_meta` on a fresh database.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the schedule database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for file-backed stores.
PRAGMA journal_mode = WAL;

-- Required for trigger cascade deletes.
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per schedule. `seq` preserves insertion order.
CREATE TABLE IF NOT EXISTS schedules (
    seq                        INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier                 TEXT NOT NULL UNIQUE,
    group_id                   TEXT,
    priority                   INTEGER NOT NULL DEFAULT 0,
    execution_limit            INTEGER NOT NULL DEFAULT 1,
    triggered_count            INTEGER NOT NULL DEFAULT 0,
    interval_ms                INTEGER,
    start_at                   INTEGER,          -- epoch millis
    end_at                     INTEGER,          -- epoch millis
    edit_grace_ms              INTEGER,
    execution_state            TEXT NOT NULL DEFAULT 'pending',
    execution_state_changed_at INTEGER NOT NULL,
    delayed_execution_at       INTEGER,          -- epoch millis, delayed state only
    delay                      TEXT,             -- JSON, without cancellation triggers
    data                       TEXT NOT NULL DEFAULT 'null',
    CHECK ((execution_state = 'delayed') = (delayed_execution_at IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_schedules_group ON schedules(group_id);
CREATE INDEX IF NOT EXISTS idx_schedules_state ON schedules(execution_state);
CREATE INDEX IF NOT EXISTS idx_schedules_end   ON schedules(end_at);

-- Triggers are owned by exactly one schedule and die with it.
CREATE TABLE IF NOT EXISTS triggers (
    trigger_id   TEXT PRIMARY KEY,
    schedule_id  TEXT NOT NULL REFERENCES schedules(identifier) ON DELETE CASCADE,
    role         TEXT NOT NULL,      -- execution | cancellation
    position     INTEGER NOT NULL,
    trigger_type TEXT NOT NULL,
    goal         REAL NOT NULL,
    progress     REAL NOT NULL DEFAULT 0,
    predicate    TEXT                -- JSON
);

CREATE INDEX IF NOT EXISTS idx_triggers_schedule ON triggers(schedule_id);
CREATE INDEX IF NOT EXISTS idx_triggers_type     ON triggers(trigger_type);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Inserts the current schema version into
/// `schema_meta` if not already present.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version_str = CURRENT_SCHEMA_VERSION.to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![version_str],
    )?;

    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
