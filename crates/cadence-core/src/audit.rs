//! Field deltas handed to the audit/notification collaborator.
//!
//! Every write the engine makes is described as a [`DeltaSet`]: for each
//! field that actually changed, the old value, the new value, and a
//! [`ReasonTag`] saying why. Recording is fire-and-forget: a failing sink is
//! logged and never fails the mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::{ItemId, WorkItem};
use crate::store::ItemPatch;

/// Item fields the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    State,
    IterationId,
    PlanStartedAt,
    PlanFinishedAt,
    StartTime,
    FinishTime,
    ReopenCount,
    ExpiryStatus,
}

impl Field {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::IterationId => "iteration_id",
            Self::PlanStartedAt => "plan_started_at",
            Self::PlanFinishedAt => "plan_finished_at",
            Self::StartTime => "start_time",
            Self::FinishTime => "finish_time",
            Self::ReopenCount => "reopen_count",
            Self::ExpiryStatus => "expiry_status",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a field changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonTag {
    Created,
    /// Requested directly by the caller.
    Updated,
    /// Plan finish moved because the item changed iteration.
    IterationChanged,
    /// Plan start pulled back to the plan finish day.
    PlanStartAdjusted,
    /// Parent advanced because a child started work.
    ChildrenInProgress,
    /// Parent schedule rolled up from its children.
    ChildrenPlanUpdated,
}

impl ReasonTag {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::IterationChanged => "iteration changed",
            Self::PlanStartAdjusted => "plan start adjusted",
            Self::ChildrenInProgress => "children in progress",
            Self::ChildrenPlanUpdated => "children plan updated",
        }
    }
}

impl fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One changed field: `[old, new, reason]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub old: Option<String>,
    pub new: Option<String>,
    pub reason: ReasonTag,
}

pub type DeltaSet = BTreeMap<Field, Delta>;

/// Audit/notification collaborator.
pub trait AuditSink: Send + Sync {
    fn record_deltas(&self, item_id: ItemId, deltas: &DeltaSet) -> anyhow::Result<()>;
}

/// Sink that emits one `tracing` event per write, deltas as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record_deltas(&self, item_id: ItemId, deltas: &DeltaSet) -> anyhow::Result<()> {
        let rendered = serde_json::to_string(deltas)?;
        tracing::info!(%item_id, changed = deltas.len(), deltas = %rendered, "item fields changed");
        Ok(())
    }
}

/// Hand deltas to the sink, logging instead of propagating failures.
pub(crate) fn record_best_effort(sink: &dyn AuditSink, item_id: ItemId, deltas: &DeltaSet) {
    if deltas.is_empty() {
        return;
    }
    if let Err(err) = sink.record_deltas(item_id, deltas) {
        tracing::warn!(%item_id, error = %err, "audit sink failed; continuing");
    }
}

fn render_time(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

/// Describe what `patch` changes on `before`. Slots whose value equals the
/// current one produce no delta.
pub fn deltas_for(
    before: &WorkItem,
    patch: &ItemPatch,
    reason: impl Fn(Field) -> ReasonTag,
) -> DeltaSet {
    let mut out = DeltaSet::new();
    let mut push = |field: Field, old: Option<String>, new: Option<String>| {
        if old != new {
            out.insert(
                field,
                Delta {
                    old,
                    new,
                    reason: reason(field),
                },
            );
        }
    };

    if let Some(state) = patch.state {
        push(
            Field::State,
            Some(before.state.get().to_string()),
            Some(state.get().to_string()),
        );
    }
    if let Some(iteration_id) = patch.iteration_id {
        push(
            Field::IterationId,
            Some(before.iteration_id.get().to_string()),
            Some(iteration_id.get().to_string()),
        );
    }
    if let Some(value) = patch.plan_started_at {
        push(
            Field::PlanStartedAt,
            render_time(before.plan_started_at),
            render_time(value),
        );
    }
    if let Some(value) = patch.plan_finished_at {
        push(
            Field::PlanFinishedAt,
            render_time(before.plan_finished_at),
            render_time(value),
        );
    }
    if let Some(value) = patch.start_time {
        push(Field::StartTime, render_time(before.start_time), render_time(value));
    }
    if let Some(value) = patch.finish_time {
        push(Field::FinishTime, render_time(before.finish_time), render_time(value));
    }
    if let Some(value) = patch.reopen_count {
        push(
            Field::ReopenCount,
            Some(before.reopen_count.to_string()),
            Some(value.to_string()),
        );
    }
    if let Some(value) = patch.expiry_status {
        push(
            Field::ExpiryStatus,
            Some(before.expiry_status.to_string()),
            Some(value.to_string()),
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExpiryStatus, ItemType, IterationId, ProjectId, StateId};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn item() -> WorkItem {
        WorkItem {
            id: ItemId(5),
            project_id: ProjectId(1),
            item_type: ItemType::Bug,
            title: "crash on save".into(),
            iteration_id: IterationId(2),
            state: StateId(1),
            plan_started_at: None,
            plan_finished_at: None,
            start_time: None,
            finish_time: None,
            reopen_count: 0,
            expiry_status: ExpiryStatus::Unspecified,
        }
    }

    #[test]
    fn unchanged_slots_produce_no_delta() {
        let patch = ItemPatch {
            state: Some(StateId(1)),
            iteration_id: Some(IterationId(3)),
            ..ItemPatch::default()
        };
        let deltas = deltas_for(&item(), &patch, |_| ReasonTag::Updated);
        assert_eq!(deltas.len(), 1);
        let delta = &deltas[&Field::IterationId];
        assert_eq!(delta.old.as_deref(), Some("2"));
        assert_eq!(delta.new.as_deref(), Some("3"));
    }

    #[test]
    fn reason_is_chosen_per_field() {
        let finish = Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap();
        let patch = ItemPatch {
            iteration_id: Some(IterationId(3)),
            plan_finished_at: Some(Some(finish)),
            ..ItemPatch::default()
        };
        let deltas = deltas_for(&item(), &patch, |field| match field {
            Field::PlanFinishedAt => ReasonTag::IterationChanged,
            _ => ReasonTag::Updated,
        });
        assert_eq!(deltas[&Field::PlanFinishedAt].reason, ReasonTag::IterationChanged);
        assert_eq!(deltas[&Field::PlanFinishedAt].old, None);
        assert_eq!(deltas[&Field::IterationId].reason, ReasonTag::Updated);
    }

    struct FailingSink(Mutex<usize>);

    impl AuditSink for FailingSink {
        fn record_deltas(&self, _item_id: ItemId, _deltas: &DeltaSet) -> anyhow::Result<()> {
            *self.0.lock().expect("lock") += 1;
            anyhow::bail!("notification service unavailable")
        }
    }

    #[test]
    fn sink_failure_is_swallowed_and_empty_sets_are_skipped() {
        let sink = FailingSink(Mutex::new(0));
        record_best_effort(&sink, ItemId(1), &DeltaSet::new());
        assert_eq!(*sink.0.lock().unwrap(), 0);

        let mut deltas = DeltaSet::new();
        deltas.insert(
            Field::State,
            Delta {
                old: Some("1".into()),
                new: Some("2".into()),
                reason: ReasonTag::ChildrenInProgress,
            },
        );
        record_best_effort(&sink, ItemId(1), &deltas);
        assert_eq!(*sink.0.lock().unwrap(), 1);
    }

    #[test]
    fn reason_tags_render_human_text() {
        assert_eq!(ReasonTag::ChildrenInProgress.to_string(), "children in progress");
        assert_eq!(ReasonTag::ChildrenPlanUpdated.to_string(), "children plan updated");
    }
}
