use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::DeltaSet;
use crate::model::{Belong, ItemId, ItemType, IterationId, ProjectId, StateId, WorkItem};
use crate::transition::Identity;

/// A caller's update of one item. Unset fields are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub item_id: ItemId,
    pub identity: Identity,
    pub state: Option<StateId>,
    pub iteration_id: Option<IterationId>,
    /// `Some(None)` clears the date.
    pub plan_started_at: Option<Option<DateTime<Utc>>>,
    pub plan_finished_at: Option<Option<DateTime<Utc>>>,
    /// Re-run the cascade on every inclusion child when the iteration moves.
    pub cascade_children: bool,
}

impl UpdateRequest {
    #[must_use]
    pub const fn new(item_id: ItemId, identity: Identity) -> Self {
        Self {
            item_id,
            identity,
            state: None,
            iteration_id: None,
            plan_started_at: None,
            plan_finished_at: None,
            cascade_children: false,
        }
    }

    #[must_use]
    pub const fn state(mut self, state: StateId) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub const fn iteration(mut self, iteration_id: IterationId) -> Self {
        self.iteration_id = Some(iteration_id);
        self
    }

    #[must_use]
    pub const fn plan_started_at(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.plan_started_at = Some(value);
        self
    }

    #[must_use]
    pub const fn plan_finished_at(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.plan_finished_at = Some(value);
        self
    }

    #[must_use]
    pub const fn cascade_to_children(mut self) -> Self {
        self.cascade_children = true;
        self
    }
}

/// A caller's request to create an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub project_id: ProjectId,
    pub item_type: ItemType,
    pub title: String,
    pub identity: Identity,
    pub state: StateId,
    pub iteration_id: IterationId,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_finished_at: Option<DateTime<Utc>>,
    /// Item that will include the new one.
    pub parent_id: Option<ItemId>,
}

/// What one mutation changed, computed once before any write and consumed by
/// the later cascade stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateIntent {
    pub item_id: ItemId,
    pub old_belong: Belong,
    pub new_belong: Belong,
    pub old_iteration: IterationId,
    pub new_iteration: IterationId,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_finished_at: Option<DateTime<Utc>>,
    pub cascade_children: bool,
}

impl UpdateIntent {
    #[must_use]
    pub fn iteration_changed(&self) -> bool {
        self.old_iteration.assigned() != self.new_iteration.assigned()
    }

    /// The item started work: it was OPEN and no longer is.
    #[must_use]
    pub fn left_open(&self) -> bool {
        self.old_belong == Belong::Open && self.new_belong != Belong::Open
    }

    #[must_use]
    pub fn wants_child_cascade(&self) -> bool {
        self.cascade_children && self.iteration_changed()
    }
}

/// Deferred re-propagation of an iteration change to the children of
/// `parent_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCascadeJob {
    pub parent_id: ItemId,
    pub iteration_id: IterationId,
}

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// The mutated item as stored after its own write.
    pub item: WorkItem,
    /// Deltas of the item's own write.
    pub deltas: DeltaSet,
    /// Child cascade still to run, if one was requested.
    pub pending_children: Option<ChildCascadeJob>,
}

/// What an explicit child cascade touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildCascadeReport {
    /// Every descendant visited, in processing order.
    pub visited: Vec<ItemId>,
    /// Descendants whose own fields were written.
    pub changed: Vec<ItemId>,
}
