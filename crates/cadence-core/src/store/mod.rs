//! Persistence seam consumed by the engine, and a SQLite reference backend.
//!
//! The engine never talks to a database directly. It reads and writes through
//! [`ItemStore`], which a host application implements over its own storage.
//! [`sqlite::SqliteStore`] is a complete implementation used by the
//! integration tests and by embedders that do not already have a store.

pub mod schema;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    ExpiryStatus, ItemId, ItemType, Iteration, IterationId, ProjectId, State, StateId,
    StateRelation, WorkItem,
};

pub use sqlite::SqliteStore;

/// Field-level write applied to one item. `None` leaves a field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub state: Option<StateId>,
    pub iteration_id: Option<IterationId>,
    pub plan_started_at: Option<Option<DateTime<Utc>>>,
    pub plan_finished_at: Option<Option<DateTime<Utc>>>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub finish_time: Option<Option<DateTime<Utc>>>,
    pub reopen_count: Option<u32>,
    pub expiry_status: Option<ExpiryStatus>,
}

impl ItemPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to an in-memory copy, mirroring what the store writes.
    pub fn apply_to(&self, item: &mut WorkItem) {
        if let Some(state) = self.state {
            item.state = state;
        }
        if let Some(iteration_id) = self.iteration_id {
            item.iteration_id = iteration_id;
        }
        if let Some(value) = self.plan_started_at {
            item.plan_started_at = value;
        }
        if let Some(value) = self.plan_finished_at {
            item.plan_finished_at = value;
        }
        if let Some(value) = self.start_time {
            item.start_time = value;
        }
        if let Some(value) = self.finish_time {
            item.finish_time = value;
        }
        if let Some(value) = self.reopen_count {
            item.reopen_count = value;
        }
        if let Some(value) = self.expiry_status {
            item.expiry_status = value;
        }
    }
}

/// A fully-resolved item ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub project_id: ProjectId,
    pub item_type: ItemType,
    pub title: String,
    pub iteration_id: IterationId,
    pub state: StateId,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_finished_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub expiry_status: ExpiryStatus,
    /// When set, an inclusion edge `parent -> new item` is created with it.
    pub parent_id: Option<ItemId>,
}

/// Storage operations the engine depends on.
///
/// Lookups of a missing record must return [`StoreError::NotFound`].
pub trait ItemStore: Send + Sync {
    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError>;

    fn create_item(&self, item: &NewItem) -> Result<WorkItem, StoreError>;

    /// Write every populated slot of `patch` in one atomic step.
    fn update_item(&self, id: ItemId, patch: &ItemPatch) -> Result<(), StoreError>;

    fn get_iteration(&self, id: IterationId) -> Result<Iteration, StoreError>;

    fn get_state(&self, id: StateId) -> Result<State, StoreError>;

    /// States of one (project, type) scope, in display order.
    fn list_states(&self, project: ProjectId, item_type: ItemType)
    -> Result<Vec<State>, StoreError>;

    fn get_state_relations(
        &self,
        project: ProjectId,
        item_type: ItemType,
    ) -> Result<Vec<StateRelation>, StoreError>;

    /// States of several scopes. Backends should answer with a single query.
    fn list_states_for_types(
        &self,
        project: ProjectId,
        types: &[ItemType],
    ) -> Result<Vec<State>, StoreError> {
        let mut out = Vec::new();
        for item_type in types {
            out.extend(self.list_states(project, *item_type)?);
        }
        Ok(out)
    }

    /// Transition edges of several scopes. Backends should answer with a
    /// single query.
    fn get_state_relations_for_types(
        &self,
        project: ProjectId,
        types: &[ItemType],
    ) -> Result<Vec<StateRelation>, StoreError> {
        let mut out = Vec::new();
        for item_type in types {
            out.extend(self.get_state_relations(project, *item_type)?);
        }
        Ok(out)
    }

    /// Items that include `id`.
    fn get_inclusion_parents(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError>;

    /// Items included by `id`, in listing order.
    fn get_inclusion_children(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError>;
}

/// Source of "now" for timestamps and day-relative repairs.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item() -> WorkItem {
        WorkItem {
            id: ItemId(1),
            project_id: ProjectId(1),
            item_type: ItemType::Task,
            title: "t".into(),
            iteration_id: IterationId::UNASSIGNED,
            state: StateId(1),
            plan_started_at: None,
            plan_finished_at: Some(Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap()),
            start_time: None,
            finish_time: None,
            reopen_count: 0,
            expiry_status: ExpiryStatus::Expired,
        }
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let patch = ItemPatch::default();
        assert!(patch.is_empty());
        let mut copy = item();
        patch.apply_to(&mut copy);
        assert_eq!(copy, item());
    }

    #[test]
    fn nested_none_clears_optional_fields() {
        let patch = ItemPatch {
            plan_finished_at: Some(None),
            expiry_status: Some(ExpiryStatus::Unspecified),
            reopen_count: Some(2),
            ..ItemPatch::default()
        };
        assert!(!patch.is_empty());

        let mut copy = item();
        patch.apply_to(&mut copy);
        assert_eq!(copy.plan_finished_at, None);
        assert_eq!(copy.expiry_status, ExpiryStatus::Unspecified);
        assert_eq!(copy.reopen_count, 2);
        assert_eq!(copy.state, StateId(1));
    }
}
