//! Which states an item may move to, and whether the caller may move it.
//!
//! Computing buttons is two explicit steps:
//!
//! 1. [`TransitionGraph::buttons_from`] answers the structural question from
//!    the configured state relations alone.
//! 2. [`authorize`] narrows the structurally legal buttons through the
//!    [`Authorizer`], memoizing decisions in an [`AuthContext`].
//!
//! The single-item and batch entry points below both go through step 1 on
//! the same graph construction, so they agree for every start state.

pub mod authorize;
pub mod graph;

use std::collections::BTreeMap;

pub use authorize::{AllowAll, AuthContext, Authorizer, Identity, StaticPolicy, authorize};
pub use graph::{Button, TransitionGraph};

use crate::error::{EngineError, StoreError};
use crate::model::{ItemType, ProjectId, StateId, WorkItem};
use crate::store::ItemStore;

/// `type → start state → buttons`.
pub type BatchButtons = BTreeMap<ItemType, BTreeMap<StateId, Vec<Button>>>;

/// Structural buttons for one item currently in `current`.
///
/// # Errors
///
/// Returns a lookup error when `current` is not a state of the scope, and
/// propagates store failures.
pub fn compute_legal_transitions(
    store: &dyn ItemStore,
    project: ProjectId,
    item_type: ItemType,
    current: StateId,
) -> Result<Vec<Button>, EngineError> {
    let graph = TransitionGraph::load(store, project, item_type)?;
    graph
        .buttons_from(current)
        .ok_or_else(|| StoreError::not_found("state", current.get()).into())
}

/// Structural buttons for every (type, start state) pair of `types`, from two
/// store queries in total.
///
/// # Errors
///
/// Propagates store failures.
#[tracing::instrument(skip(store))]
pub fn compute_legal_transitions_batch(
    store: &dyn ItemStore,
    project: ProjectId,
    types: &[ItemType],
) -> Result<BatchButtons, EngineError> {
    let states = store.list_states_for_types(project, types)?;
    let relations = store.get_state_relations_for_types(project, types)?;

    let mut out = BatchButtons::new();
    for &item_type in types {
        if out.contains_key(&item_type) {
            continue;
        }
        let scoped = states.iter().filter(|s| s.item_type == item_type).cloned();
        let graph = TransitionGraph::from_parts(project, item_type, scoped, &relations);
        out.insert(item_type, graph.all_buttons());
    }

    tracing::debug!(types = out.len(), "computed batch buttons");
    Ok(out)
}

/// Buttons for one item as its caller may use them.
///
/// # Errors
///
/// See [`compute_legal_transitions`].
pub fn buttons_for_item(
    store: &dyn ItemStore,
    authorizer: &dyn Authorizer,
    ctx: &mut AuthContext,
    item: &WorkItem,
) -> Result<Vec<Button>, EngineError> {
    let mut buttons = compute_legal_transitions(store, item.project_id, item.item_type, item.state)?;
    authorize(&mut buttons, ctx, authorizer, item);
    Ok(buttons)
}

/// Buttons for a page of items, sharing one batch computation and one memo.
/// Items whose current state is missing from their scope get no entry.
///
/// # Errors
///
/// Propagates store failures.
pub fn buttons_for_items(
    store: &dyn ItemStore,
    authorizer: &dyn Authorizer,
    ctx: &mut AuthContext,
    project: ProjectId,
    items: &[WorkItem],
) -> Result<BTreeMap<crate::model::ItemId, Vec<Button>>, EngineError> {
    let mut types: Vec<ItemType> = items.iter().map(|i| i.item_type).collect();
    types.sort_unstable();
    types.dedup();

    let batch = compute_legal_transitions_batch(store, project, &types)?;
    let mut out = BTreeMap::new();
    for item in items.iter().filter(|i| i.project_id == project) {
        let Some(buttons) = batch.get(&item.item_type).and_then(|m| m.get(&item.state)) else {
            tracing::warn!(item_id = %item.id, state = %item.state, "item state is not in its scope");
            continue;
        };
        let mut buttons = buttons.clone();
        authorize(&mut buttons, ctx, authorizer, item);
        out.insert(item.id, buttons);
    }
    Ok(out)
}

/// Typed rejection for moving `item` to `target`.
///
/// # Errors
///
/// [`EngineError::IllegalTransition`] when no edge exists,
/// [`EngineError::Forbidden`] when the caller is not permitted.
pub fn check_transition(
    graph: &TransitionGraph,
    ctx: &mut AuthContext,
    authorizer: &dyn Authorizer,
    item: &WorkItem,
    target: StateId,
) -> Result<(), EngineError> {
    let from = item.state;
    if !graph.contains(target) || !graph.is_legal(from, target) {
        return Err(EngineError::IllegalTransition {
            item_id: item.id,
            from,
            to: target,
        });
    }
    if !ctx.permits(authorizer, item.project_id, item.item_type, from, target) {
        return Err(EngineError::Forbidden {
            item_id: item.id,
            from,
            to: target,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::model::{Belong, ExpiryStatus, ItemId, IterationId, State, StateRelation};
    use crate::store::SqliteStore;

    fn seed() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open store");
        let states = [
            (1, ItemType::Task, "todo", Belong::Open),
            (2, ItemType::Task, "doing", Belong::Working),
            (3, ItemType::Task, "done", Belong::Done),
            (11, ItemType::Bug, "new", Belong::Open),
            (12, ItemType::Bug, "fixed", Belong::Resolved),
        ];
        for (index, (id, item_type, name, belong)) in states.into_iter().enumerate() {
            store
                .put_state(&State {
                    id: StateId(id),
                    project_id: ProjectId(1),
                    item_type,
                    name: name.into(),
                    belong,
                    index: i64::try_from(index).expect("small index"),
                })
                .expect("put state");
        }
        for (item_type, from, to) in [
            (ItemType::Task, 1, 2),
            (ItemType::Task, 2, 3),
            (ItemType::Task, 3, 2),
            (ItemType::Bug, 11, 12),
        ] {
            store
                .put_state_relation(&StateRelation {
                    project_id: ProjectId(1),
                    item_type,
                    start_state_id: StateId(from),
                    end_state_id: StateId(to),
                })
                .expect("put relation");
        }
        store
    }

    fn task(state: i64) -> WorkItem {
        WorkItem {
            id: ItemId(7),
            project_id: ProjectId(1),
            item_type: ItemType::Task,
            title: "write docs".into(),
            iteration_id: IterationId::UNASSIGNED,
            state: StateId(state),
            plan_started_at: None,
            plan_finished_at: None,
            start_time: None,
            finish_time: None,
            reopen_count: 0,
            expiry_status: ExpiryStatus::Unspecified,
        }
    }

    #[test]
    fn batch_agrees_with_single_item_path() {
        let store = seed();
        let batch =
            compute_legal_transitions_batch(&store, ProjectId(1), &[ItemType::Task, ItemType::Bug])
                .expect("batch");
        for (item_type, by_state) in &batch {
            for (state, buttons) in by_state {
                let single = compute_legal_transitions(&store, ProjectId(1), *item_type, *state)
                    .expect("single");
                assert_eq!(&single, buttons, "{item_type} {state}");
            }
        }
        assert_eq!(batch[&ItemType::Bug].len(), 2);
        assert_eq!(batch[&ItemType::Bug][&StateId(12)].len(), 1);
    }

    #[test]
    fn unknown_current_state_is_a_lookup_error() {
        let store = seed();
        let err = compute_legal_transitions(&store, ProjectId(1), ItemType::Task, StateId(11))
            .expect_err("bug state is not a task state");
        assert_eq!(err.category(), ErrorCategory::Lookup);
    }

    #[test]
    fn check_transition_separates_illegal_from_forbidden() {
        let store = seed();
        let graph = TransitionGraph::load(&store, ProjectId(1), ItemType::Task).expect("graph");
        let policy = StaticPolicy::new().deny(ItemType::Task, StateId(2));
        let mut ctx = AuthContext::new(Identity::user("ann"));

        let illegal = check_transition(&graph, &mut ctx, &policy, &task(1), StateId(3))
            .expect_err("no 1 -> 3 edge");
        assert_eq!(illegal.category(), ErrorCategory::IllegalTransition);

        let denied = check_transition(&graph, &mut ctx, &policy, &task(1), StateId(2))
            .expect_err("2 is denied");
        assert_eq!(denied.category(), ErrorCategory::Forbidden);

        check_transition(&graph, &mut ctx, &policy, &task(1), StateId(1)).expect("no-op");
        check_transition(&graph, &mut ctx, &policy, &task(2), StateId(3)).expect("allowed");
    }

    #[test]
    fn page_of_items_shares_one_memo() {
        let store = seed();
        let policy = StaticPolicy::new();
        let mut ctx = AuthContext::new(Identity::user("ann"));
        let mut items: Vec<WorkItem> = (0..10).map(|_| task(1)).collect();
        for (n, item) in items.iter_mut().enumerate() {
            item.id = ItemId(i64::try_from(n).expect("small") + 1);
        }
        let page = buttons_for_items(&store, &policy, &mut ctx, ProjectId(1), &items).expect("page");
        assert_eq!(page.len(), 10);
        assert_eq!(ctx.authorizer_calls(), 1);

        let single = buttons_for_item(&store, &policy, &mut ctx, &task(1)).expect("single");
        assert_eq!(single, page[&ItemId(1)]);
    }
}
