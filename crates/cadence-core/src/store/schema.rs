//! SQLite schema for the reference store.
//!
//! - `states` / `state_relations` hold the per-(project, type) workflow graph
//! - `iterations` holds sprint windows and their filed flag
//! - `items` keeps the fields the lifecycle engine reads and writes
//! - `relations` stores inclusion and connection edges between items
//! - `item_deltas` keeps the audit trail recorded by cascades
//!
//! Timestamps are stored as microseconds since the Unix epoch. The schema
//! version lives in `PRAGMA user_version`; a database stamped with a newer
//! version than this build knows is refused rather than written to.

use anyhow::{Context, bail};
use rusqlite::Connection;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS states (
    state_id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL,
    item_type TEXT NOT NULL
        CHECK (item_type IN ('requirement', 'task', 'bug', 'epic', 'ticket')),
    name TEXT NOT NULL,
    belong TEXT NOT NULL
        CHECK (belong IN ('OPEN', 'WORKING', 'DONE', 'CLOSED', 'WONTFIX', 'REOPEN', 'RESOLVED')),
    display_index INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS state_relations (
    project_id INTEGER NOT NULL,
    item_type TEXT NOT NULL,
    start_state_id INTEGER NOT NULL REFERENCES states(state_id) ON DELETE CASCADE,
    end_state_id INTEGER NOT NULL REFERENCES states(state_id) ON DELETE CASCADE,
    PRIMARY KEY (project_id, item_type, start_state_id, end_state_id)
);

CREATE TABLE IF NOT EXISTS iterations (
    iteration_id INTEGER PRIMARY KEY CHECK (iteration_id > 0),
    project_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    started_at_us INTEGER NOT NULL,
    finished_at_us INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'UNFILED' CHECK (state IN ('UNFILED', 'FILED'))
);

CREATE TABLE IF NOT EXISTS items (
    item_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    item_type TEXT NOT NULL
        CHECK (item_type IN ('requirement', 'task', 'bug', 'epic', 'ticket')),
    title TEXT NOT NULL,
    iteration_id INTEGER NOT NULL DEFAULT -1,
    state_id INTEGER NOT NULL REFERENCES states(state_id),
    plan_started_at_us INTEGER,
    plan_finished_at_us INTEGER,
    start_time_us INTEGER,
    finish_time_us INTEGER,
    reopen_count INTEGER NOT NULL DEFAULT 0 CHECK (reopen_count >= 0),
    expiry_status TEXT NOT NULL DEFAULT 'unspecified'
);

CREATE TABLE IF NOT EXISTS relations (
    relation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id INTEGER NOT NULL REFERENCES items(item_id) ON DELETE CASCADE,
    related_issue INTEGER NOT NULL REFERENCES items(item_id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL CHECK (relation_type IN ('inclusion', 'connection')),
    UNIQUE (issue_id, related_issue, relation_type),
    CHECK (issue_id <> related_issue)
);

CREATE INDEX IF NOT EXISTS idx_states_scope ON states(project_id, item_type, display_index);
CREATE INDEX IF NOT EXISTS idx_items_iteration ON items(iteration_id);
CREATE INDEX IF NOT EXISTS idx_relations_child ON relations(related_issue, relation_type);

CREATE TABLE IF NOT EXISTS item_deltas (
    delta_id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL,
    field TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    reason TEXT NOT NULL,
    recorded_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_item_deltas_item ON item_deltas(item_id, delta_id);
";

/// Indexes every store is expected to carry.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_states_scope",
    "idx_items_iteration",
    "idx_relations_child",
    "idx_item_deltas_item",
];

/// Create the tables on a blank database and stamp the version.
///
/// A database already at [`SCHEMA_VERSION`] is left alone.
///
/// # Errors
///
/// Returns an error if SQLite fails, or if the file was written by a build
/// with a newer schema.
pub fn ensure_schema(conn: &mut Connection) -> anyhow::Result<u32> {
    let stored: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("read user_version")?;
    let stored = u32::try_from(stored).context("user_version out of range")?;

    if stored > SCHEMA_VERSION {
        bail!("store schema v{stored} is newer than supported v{SCHEMA_VERSION}");
    }
    if stored == SCHEMA_VERSION {
        return Ok(stored);
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_SQL).context("create store tables")?;
    tx.pragma_update(None, "user_version", i64::from(SCHEMA_VERSION))?;
    tx.commit()?;
    tracing::debug!(version = SCHEMA_VERSION, "created store schema");
    Ok(SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::{REQUIRED_INDEXES, SCHEMA_VERSION, ensure_schema};
    use rusqlite::{Connection, params};

    fn object_exists(conn: &Connection, kind: &str, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            params![kind, name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn blank_database_gets_every_table_and_index() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SCHEMA_VERSION);

        for table in ["states", "state_relations", "iterations", "items", "relations", "item_deltas"] {
            assert!(object_exists(&conn, "table", table), "missing table {table}");
        }
        for index in REQUIRED_INDEXES {
            assert!(object_exists(&conn, "index", index), "missing index {index}");
        }
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");

        let mut conn = Connection::open(&path).unwrap();
        ensure_schema(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO item_deltas (item_id, field, reason, recorded_at_us) VALUES (1, 'state_id', 'updated', 0)",
            [],
        )
        .unwrap();
        drop(conn);

        let mut conn = Connection::open(&path).unwrap();
        assert_eq!(ensure_schema(&mut conn).unwrap(), SCHEMA_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM item_deltas", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", i64::from(SCHEMA_VERSION + 1))
            .unwrap();

        let err = ensure_schema(&mut conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
        assert!(!object_exists(&conn, "table", "items"));
    }
}
