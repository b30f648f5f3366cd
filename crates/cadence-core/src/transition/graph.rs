//! Structural transition graph for one (project, item type) scope.
//!
//! ## Edge Direction
//!
//! An edge `A → B` means "an item in state A may move to state B". Edges come
//! straight from `state_relations`; there is no implicit self edge, but the
//! no-op transition `A → A` is always legal.
//!
//! Everything here is structural. Whether a particular caller may take an
//! edge is decided afterwards by [`super::authorize`].

#![allow(clippy::module_name_repetitions)]

use std::collections::BTreeMap;

use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{Belong, ItemType, ProjectId, State, StateId, StateRelation};
use crate::store::ItemStore;

/// A candidate target state.
///
/// Before authorization `permission` means "structurally reachable"; after
/// authorization it also means "this caller may take it".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub state_id: StateId,
    pub name: String,
    pub belong: Belong,
    pub permission: bool,
}

impl Button {
    fn for_state(state: &State, permission: bool) -> Self {
        Self {
            state_id: state.id,
            name: state.name.clone(),
            belong: state.belong,
            permission,
        }
    }
}

/// States of one scope plus the configured edges between them.
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    project_id: ProjectId,
    item_type: ItemType,
    /// In display order.
    states: Vec<State>,
    edges: DiGraphMap<StateId, ()>,
}

impl TransitionGraph {
    /// Build from already-loaded rows. Rows outside the scope are ignored, as
    /// are edges whose endpoints are not states of the scope.
    #[must_use]
    pub fn from_parts(
        project_id: ProjectId,
        item_type: ItemType,
        states: impl IntoIterator<Item = State>,
        relations: &[StateRelation],
    ) -> Self {
        let mut states: Vec<State> = states
            .into_iter()
            .filter(|s| s.project_id == project_id && s.item_type == item_type)
            .collect();
        states.sort_by_key(|s| (s.index, s.id));

        let mut edges = DiGraphMap::with_capacity(states.len(), relations.len());
        for state in &states {
            edges.add_node(state.id);
        }

        for relation in relations
            .iter()
            .filter(|r| r.project_id == project_id && r.item_type == item_type)
        {
            let (from, to) = (relation.start_state_id, relation.end_state_id);
            if edges.contains_node(from) && edges.contains_node(to) {
                edges.add_edge(from, to, ());
            } else {
                tracing::debug!(
                    %project_id,
                    %item_type,
                    %from,
                    %to,
                    "ignoring state relation with an endpoint outside the scope"
                );
            }
        }

        Self {
            project_id,
            item_type,
            states,
            edges,
        }
    }

    /// Load the states and edges of one scope.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[tracing::instrument(skip(store))]
    pub fn load(
        store: &dyn ItemStore,
        project_id: ProjectId,
        item_type: ItemType,
    ) -> Result<Self, StoreError> {
        let states = store.list_states(project_id, item_type)?;
        let relations = store.get_state_relations(project_id, item_type)?;
        Ok(Self::from_parts(project_id, item_type, states, &relations))
    }

    #[must_use]
    pub const fn project_id(&self) -> ProjectId {
        self.project_id
    }

    #[must_use]
    pub const fn item_type(&self) -> ItemType {
        self.item_type
    }

    #[must_use]
    pub fn states(&self) -> &[State] {
        &self.states
    }

    #[must_use]
    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: StateId) -> bool {
        self.edges.contains_node(id)
    }

    /// `from → to` is configured, or is the no-op.
    #[must_use]
    pub fn is_legal(&self, from: StateId, to: StateId) -> bool {
        from == to || self.edges.contains_edge(from, to)
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.edge_count()
    }

    /// Structural buttons for an item currently in `current`.
    ///
    /// Every state of the scope gets a button, reachable ones (and the current
    /// state) with `permission = true`. A state without outgoing edges yields
    /// only its own button. Returns `None` when `current` is not part of the
    /// scope.
    #[must_use]
    pub fn buttons_from(&self, current: StateId) -> Option<Vec<Button>> {
        let own = self.state(current)?;

        let has_exit = self.edges.neighbors(current).any(|next| next != current);
        if !has_exit {
            return Some(vec![Button::for_state(own, true)]);
        }

        Some(
            self.states
                .iter()
                .map(|state| Button::for_state(state, self.is_legal(current, state.id)))
                .collect(),
        )
    }

    /// Buttons for every state of the scope, keyed by start state.
    #[must_use]
    pub fn all_buttons(&self) -> BTreeMap<StateId, Vec<Button>> {
        self.states
            .iter()
            .filter_map(|state| Some((state.id, self.buttons_from(state.id)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: i64, name: &str, belong: Belong, index: i64) -> State {
        State {
            id: StateId(id),
            project_id: ProjectId(1),
            item_type: ItemType::Task,
            name: name.into(),
            belong,
            index,
        }
    }

    fn edge(from: i64, to: i64) -> StateRelation {
        StateRelation {
            project_id: ProjectId(1),
            item_type: ItemType::Task,
            start_state_id: StateId(from),
            end_state_id: StateId(to),
        }
    }

    fn graph() -> TransitionGraph {
        TransitionGraph::from_parts(
            ProjectId(1),
            ItemType::Task,
            vec![
                state(3, "done", Belong::Done, 2),
                state(1, "todo", Belong::Open, 0),
                state(2, "doing", Belong::Working, 1),
            ],
            &[edge(1, 2), edge(2, 3), edge(3, 3)],
        )
    }

    #[test]
    fn buttons_cover_every_state_in_display_order() {
        let buttons = graph().buttons_from(StateId(1)).expect("state in scope");
        let ids: Vec<_> = buttons.iter().map(|b| b.state_id.get()).collect();
        assert_eq!(ids, [1, 2, 3]);
        let flags: Vec<_> = buttons.iter().map(|b| b.permission).collect();
        assert_eq!(flags, [true, true, false]);
    }

    #[test]
    fn state_without_exits_only_offers_itself() {
        // 3 -> 3 is a self edge, which is not an exit.
        let buttons = graph().buttons_from(StateId(3)).expect("state in scope");
        assert_eq!(buttons.len(), 1);
        assert_eq!(buttons[0].state_id, StateId(3));
        assert!(buttons[0].permission);
    }

    #[test]
    fn unknown_state_has_no_buttons() {
        assert!(graph().buttons_from(StateId(42)).is_none());
    }

    #[test]
    fn noop_is_always_legal() {
        let g = graph();
        assert!(g.is_legal(StateId(1), StateId(1)));
        assert!(g.is_legal(StateId(1), StateId(2)));
        assert!(!g.is_legal(StateId(2), StateId(1)));
    }

    #[test]
    fn foreign_rows_are_ignored() {
        let mut foreign = state(9, "elsewhere", Belong::Open, 0);
        foreign.item_type = ItemType::Bug;
        let g = TransitionGraph::from_parts(
            ProjectId(1),
            ItemType::Task,
            vec![state(1, "todo", Belong::Open, 0), foreign],
            &[edge(1, 9)],
        );
        assert_eq!(g.states().len(), 1);
        assert_eq!(g.edge_count(), 0);
        assert!(!g.contains(StateId(9)));
    }

    #[test]
    fn all_buttons_match_single_lookups() {
        let g = graph();
        for (start, buttons) in g.all_buttons() {
            assert_eq!(Some(buttons), g.buttons_from(start));
        }
    }
}
