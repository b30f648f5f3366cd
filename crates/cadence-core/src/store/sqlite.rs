//! SQLite implementation of [`ItemStore`] and [`AuditSink`].
//!
//! One connection guarded by a mutex; every trait call takes the lock for the
//! duration of its statement(s). Runtime pragmas follow the usual defaults:
//! WAL journal, 5s busy timeout, foreign keys on.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};

use super::{ItemPatch, ItemStore, NewItem, schema};
use crate::audit::{AuditSink, Delta, DeltaSet};
use crate::error::StoreError;
use crate::model::{
    ItemId, ItemType, Iteration, IterationId, IterationState, ProjectId, RelationType, State,
    StateId, StateRelation, WorkItem,
};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str = "i.item_id, i.project_id, i.item_type, i.title, i.iteration_id, \
     i.state_id, i.plan_started_at_us, i.plan_finished_at_us, i.start_time_us, \
     i.finish_time_us, i.reopen_count, i.expiry_status";

const STATE_COLUMNS: &str = "state_id, project_id, item_type, name, belong, display_index";

/// A recorded audit row, as read back from `item_deltas`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelta {
    pub item_id: ItemId,
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
    pub reason: String,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store file, apply pragmas, and create the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring or preparing the schema fails.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
        let mut conn = Connection::open(path)
            .with_context(|| format!("open store database {}", path.display()))?;
        configure_connection(&conn).context("configure sqlite pragmas")?;
        schema::ensure_schema(&mut conn).context("prepare store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh in-memory store with the schema in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::ensure_schema(&mut conn).context("prepare store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("store connection mutex poisoned")))
    }

    /// Insert or replace a workflow state.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_state(&self, state: &State) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO states (state_id, project_id, item_type, name, belong, display_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.id.get(),
                state.project_id.get(),
                state.item_type.as_str(),
                state.name,
                state.belong.to_string(),
                state.index,
            ],
        )?;
        Ok(())
    }

    /// Insert a workflow edge. Duplicate edges are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_state_relation(&self, relation: &StateRelation) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO state_relations (project_id, item_type, start_state_id, end_state_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                relation.project_id.get(),
                relation.item_type.as_str(),
                relation.start_state_id.get(),
                relation.end_state_id.get(),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace an iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_iteration(&self, iteration: &Iteration) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO iterations (iteration_id, project_id, title, started_at_us, finished_at_us, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                iteration.id.get(),
                iteration.project_id.get(),
                iteration.title,
                iteration.started_at.timestamp_micros(),
                iteration.finished_at.timestamp_micros(),
                iteration.state.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Link two items. `parent -> child` for inclusion edges.
    ///
    /// # Errors
    ///
    /// Returns an error if either item is missing or the write fails.
    pub fn link(
        &self,
        issue_id: ItemId,
        related_issue: ItemId,
        relation_type: RelationType,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_relation(&conn, issue_id, related_issue, relation_type)
    }

    /// Audit rows recorded for one item, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recorded_deltas(&self, item_id: ItemId) -> Result<Vec<RecordedDelta>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, field, old_value, new_value, reason
             FROM item_deltas WHERE item_id = ?1 ORDER BY delta_id",
        )?;
        let rows = stmt.query_map(params![item_id.get()], |row| {
            Ok(RecordedDelta {
                item_id: ItemId(row.get(0)?),
                field: row.get(1)?,
                old: row.get(2)?,
                new: row.get(3)?,
                reason: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

fn insert_relation(
    conn: &Connection,
    issue_id: ItemId,
    related_issue: ItemId,
    relation_type: RelationType,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO relations (issue_id, related_issue, relation_type)
         VALUES (?1, ?2, ?3)",
        params![issue_id.get(), related_issue.get(), relation_type.as_str()],
    )?;
    Ok(())
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

#[derive(Debug, thiserror::Error)]
#[error("timestamp {0}us is out of range")]
struct TimestampOutOfRange(i64);

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|us| {
        DateTime::from_timestamp_micros(us).ok_or_else(|| conversion_error(idx, TimestampOutOfRange(us)))
    })
    .transpose()
}

fn required_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let us: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(us).ok_or_else(|| conversion_error(idx, TimestampOutOfRange(us)))
}

fn micros(value: Option<DateTime<Utc>>) -> Option<i64> {
    value.map(|t| t.timestamp_micros())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let reopen_count: i64 = row.get(10)?;
    Ok(WorkItem {
        id: ItemId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        item_type: parse_column(row, 2)?,
        title: row.get(3)?,
        iteration_id: IterationId(row.get(4)?),
        state: StateId(row.get(5)?),
        plan_started_at: time_column(row, 6)?,
        plan_finished_at: time_column(row, 7)?,
        start_time: time_column(row, 8)?,
        finish_time: time_column(row, 9)?,
        reopen_count: u32::try_from(reopen_count).map_err(|err| conversion_error(10, err))?,
        expiry_status: parse_column(row, 11)?,
    })
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<State> {
    Ok(State {
        id: StateId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        item_type: parse_column(row, 2)?,
        name: row.get(3)?,
        belong: parse_column(row, 4)?,
        index: row.get(5)?,
    })
}

fn row_to_state_relation(row: &Row<'_>) -> rusqlite::Result<StateRelation> {
    Ok(StateRelation {
        project_id: ProjectId(row.get(0)?),
        item_type: parse_column(row, 1)?,
        start_state_id: StateId(row.get(2)?),
        end_state_id: StateId(row.get(3)?),
    })
}

fn iteration_state(raw: &str) -> Option<IterationState> {
    match raw {
        "UNFILED" => Some(IterationState::Unfiled),
        "FILED" => Some(IterationState::Filed),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown iteration state '{0}'")]
struct UnknownIterationState(String);

fn row_to_iteration(row: &Row<'_>) -> rusqlite::Result<Iteration> {
    let raw_state: String = row.get(5)?;
    let state = iteration_state(&raw_state)
        .ok_or_else(|| conversion_error(5, UnknownIterationState(raw_state.clone())))?;
    Ok(Iteration {
        id: IterationId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        title: row.get(2)?,
        started_at: required_time_column(row, 3)?,
        finished_at: required_time_column(row, 4)?,
        state,
    })
}

fn type_placeholders(types: &[ItemType]) -> String {
    (0..types.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ")
}

fn scoped_params(project: ProjectId, types: &[ItemType]) -> Vec<Box<dyn ToSql>> {
    let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(project.get())];
    values.extend(
        types
            .iter()
            .map(|t| Box::new(t.as_str()) as Box<dyn ToSql>),
    );
    values
}

fn query_items(
    conn: &Connection,
    sql: &str,
    id: ItemId,
) -> Result<Vec<WorkItem>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![id.get()], row_to_item)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl ItemStore for SqliteStore {
    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items i WHERE i.item_id = ?1"),
            params![id.get()],
            row_to_item,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("item", id.get()))
    }

    fn create_item(&self, item: &NewItem) -> Result<WorkItem, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO items (
                project_id, item_type, title, iteration_id, state_id,
                plan_started_at_us, plan_finished_at_us, start_time_us, finish_time_us,
                reopen_count, expiry_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
            params![
                item.project_id.get(),
                item.item_type.as_str(),
                item.title,
                item.iteration_id.get(),
                item.state.get(),
                micros(item.plan_started_at),
                micros(item.plan_finished_at),
                micros(item.start_time),
                micros(item.finish_time),
                item.expiry_status.as_str(),
            ],
        )?;
        let id = ItemId(tx.last_insert_rowid());

        if let Some(parent) = item.parent_id {
            let parent_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM items WHERE item_id = ?1)",
                params![parent.get()],
                |row| row.get(0),
            )?;
            if !parent_exists {
                return Err(StoreError::not_found("item", parent.get()));
            }
            insert_relation(&tx, parent, id, RelationType::Inclusion)?;
        }
        tx.commit()?;

        Ok(WorkItem {
            id,
            project_id: item.project_id,
            item_type: item.item_type,
            title: item.title.clone(),
            iteration_id: item.iteration_id,
            state: item.state,
            plan_started_at: item.plan_started_at,
            plan_finished_at: item.plan_finished_at,
            start_time: item.start_time,
            finish_time: item.finish_time,
            reopen_count: 0,
            expiry_status: item.expiry_status,
        })
    }

    fn update_item(&self, id: ItemId, patch: &ItemPatch) -> Result<(), StoreError> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(state) = patch.state {
            sets.push("state_id");
            values.push(Box::new(state.get()));
        }
        if let Some(iteration_id) = patch.iteration_id {
            sets.push("iteration_id");
            values.push(Box::new(iteration_id.get()));
        }
        if let Some(value) = patch.plan_started_at {
            sets.push("plan_started_at_us");
            values.push(Box::new(micros(value)));
        }
        if let Some(value) = patch.plan_finished_at {
            sets.push("plan_finished_at_us");
            values.push(Box::new(micros(value)));
        }
        if let Some(value) = patch.start_time {
            sets.push("start_time_us");
            values.push(Box::new(micros(value)));
        }
        if let Some(value) = patch.finish_time {
            sets.push("finish_time_us");
            values.push(Box::new(micros(value)));
        }
        if let Some(value) = patch.reopen_count {
            sets.push("reopen_count");
            values.push(Box::new(i64::from(value)));
        }
        if let Some(value) = patch.expiry_status {
            sets.push("expiry_status");
            values.push(Box::new(value.as_str()));
        }

        let conn = self.lock()?;
        if sets.is_empty() {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM items WHERE item_id = ?1)",
                params![id.get()],
                |row| row.get(0),
            )?;
            return if exists {
                Ok(())
            } else {
                Err(StoreError::not_found("item", id.get()))
            };
        }

        let assignments = sets
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE items SET {assignments} WHERE item_id = ?{}",
            sets.len() + 1
        );
        values.push(Box::new(id.get()));

        let changed = conn.execute(&sql, params_from_iter(values.iter().map(|v| v.as_ref())))?;
        if changed == 0 {
            return Err(StoreError::not_found("item", id.get()));
        }
        Ok(())
    }

    fn get_iteration(&self, id: IterationId) -> Result<Iteration, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT iteration_id, project_id, title, started_at_us, finished_at_us, state
             FROM iterations WHERE iteration_id = ?1",
            params![id.get()],
            row_to_iteration,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("iteration", id.get()))
    }

    fn get_state(&self, id: StateId) -> Result<State, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {STATE_COLUMNS} FROM states WHERE state_id = ?1"),
            params![id.get()],
            row_to_state,
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("state", id.get()))
    }

    fn list_states(
        &self,
        project: ProjectId,
        item_type: ItemType,
    ) -> Result<Vec<State>, StoreError> {
        self.list_states_for_types(project, &[item_type])
    }

    fn get_state_relations(
        &self,
        project: ProjectId,
        item_type: ItemType,
    ) -> Result<Vec<StateRelation>, StoreError> {
        self.get_state_relations_for_types(project, &[item_type])
    }

    fn list_states_for_types(
        &self,
        project: ProjectId,
        types: &[ItemType],
    ) -> Result<Vec<State>, StoreError> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM states
             WHERE project_id = ?1 AND item_type IN ({})
             ORDER BY item_type, display_index, state_id",
            type_placeholders(types)
        );
        let values = scoped_params(project, types);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter().map(|v| v.as_ref())), row_to_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_state_relations_for_types(
        &self,
        project: ProjectId,
        types: &[ItemType],
    ) -> Result<Vec<StateRelation>, StoreError> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT project_id, item_type, start_state_id, end_state_id FROM state_relations
             WHERE project_id = ?1 AND item_type IN ({})
             ORDER BY item_type, start_state_id, end_state_id",
            type_placeholders(types)
        );
        let values = scoped_params(project, types);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(values.iter().map(|v| v.as_ref())),
            row_to_state_relation,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_inclusion_parents(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.lock()?;
        query_items(
            &conn,
            &format!(
                "SELECT {ITEM_COLUMNS} FROM relations r
                 JOIN items i ON i.item_id = r.issue_id
                 WHERE r.related_issue = ?1 AND r.relation_type = 'inclusion'
                 ORDER BY r.relation_id"
            ),
            id,
        )
    }

    fn get_inclusion_children(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.lock()?;
        query_items(
            &conn,
            &format!(
                "SELECT {ITEM_COLUMNS} FROM relations r
                 JOIN items i ON i.item_id = r.related_issue
                 WHERE r.issue_id = ?1 AND r.relation_type = 'inclusion'
                 ORDER BY r.relation_id"
            ),
            id,
        )
    }
}

impl AuditSink for SqliteStore {
    fn record_deltas(&self, item_id: ItemId, deltas: &DeltaSet) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let recorded_at = Utc::now().timestamp_micros();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO item_deltas (item_id, field, old_value, new_value, reason, recorded_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (field, Delta { old, new, reason }) in deltas {
                stmt.execute(params![
                    item_id.get(),
                    field.as_str(),
                    old,
                    new,
                    reason.as_str(),
                    recorded_at,
                ])?;
            }
        }
        tx.commit().context("commit audit deltas")?;
        Ok(())
    }
}
