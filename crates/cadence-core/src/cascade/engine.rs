//! The cascading update engine.
//!
//! # Stages
//!
//! A mutation runs through a fixed sequence:
//!
//! 1. **Validated**: the transition is checked for legality and permission,
//!    and the target schedule against invariants. Any failure aborts before
//!    a single write.
//! 2. **OwnFieldsRepaired**: plan dates are repaired after an iteration or
//!    date move, lifecycle stamps are derived, and the item is written in one
//!    atomic patch together with the requested fields.
//! 3. **ParentAdvanced**: when the item left OPEN and its parent is still
//!    OPEN, the parent moves to its first permitted WORKING state.
//! 4. **ParentRolledUp**: the parent's plan window is recomputed from all of
//!    its children.
//! 5. **ChildrenCascaded**: only on request, via [`CascadeEngine::cascade_children`].
//!    Descendants go through stages 1 and 2; parents are rolled up per level.
//!
//! Stages 2 to 5 commit independently. A failure there is reported as
//! [`EngineError::Cascade`] naming the item and stage; earlier writes stay.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{self, AuditSink, DeltaSet, Field, ReasonTag};
use crate::cache::LookupCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::model::{Belong, ItemId, Iteration, IterationId, State, StateId, WorkItem};
use crate::schedule::{self, ScheduleError};
use crate::store::{Clock, ItemPatch, ItemStore, NewItem, SystemClock};
use crate::transition::{self, AuthContext, Authorizer, Identity, TransitionGraph};

use super::CascadeStage;
use super::intent::{
    CascadeOutcome, ChildCascadeJob, ChildCascadeReport, CreateRequest, UpdateIntent,
    UpdateRequest,
};

/// Plan dates an update will leave on the item, and why each moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedDates {
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    started_reason: ReasonTag,
    finished_reason: ReasonTag,
}

/// Runs creates, updates and child cascades against the collaborators.
///
/// Cheap to share behind an `Arc`; the only interior state is the lookup
/// cache, which does its own locking.
pub struct CascadeEngine {
    store: Arc<dyn ItemStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    cache: LookupCache,
    max_depth: usize,
    system_bypass: bool,
}

impl fmt::Debug for CascadeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeEngine")
            .field("cache", &self.cache)
            .field("max_depth", &self.max_depth)
            .field("system_bypass", &self.system_bypass)
            .finish_non_exhaustive()
    }
}

impl CascadeEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn ItemStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::with_config(store, authorizer, audit, &EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(
        store: Arc<dyn ItemStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            authorizer,
            audit,
            clock: Arc::new(SystemClock),
            cache: LookupCache::new(config.cache.ttl()),
            max_depth: config.cascade.max_depth,
            system_bypass: config.permissions.system_bypass,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn store(&self) -> &dyn ItemStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    #[must_use]
    pub const fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// A fresh permission memo for one chain, honoring the bypass setting.
    #[must_use]
    pub fn auth_context(&self, identity: Identity) -> AuthContext {
        AuthContext::new(identity).with_system_bypass(self.system_bypass)
    }

    fn load_state(&self, id: StateId) -> Result<State, EngineError> {
        Ok(self.cache.get_state(id, |id| self.store.get_state(id))?)
    }

    fn load_iteration(&self, id: IterationId) -> Result<Option<Iteration>, EngineError> {
        Ok(self.cache.get_iteration(id, |id| self.store.get_iteration(id))?)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Apply an update and run stages 1 to 4.
    ///
    /// A requested child cascade is not run here; it is handed back in
    /// [`CascadeOutcome::pending_children`] for the caller to schedule.
    ///
    /// # Errors
    ///
    /// Validation failures leave the store untouched. Failures in the parent
    /// stages are [`EngineError::Cascade`] and leave the item's write in place.
    #[tracing::instrument(skip(self, request), fields(item_id = %request.item_id))]
    pub fn update_item(&self, request: &UpdateRequest) -> Result<CascadeOutcome, EngineError> {
        let mut ctx = self.auth_context(request.identity.clone());
        let (outcome, intent) = self.update_own_fields(request, &mut ctx)?;
        self.cascade_to_parent(&outcome.item, &intent)?;
        Ok(outcome)
    }

    /// Create an item and run stages 1 to 4 before returning.
    ///
    /// # Errors
    ///
    /// Validation failures create nothing. Parent stage failures are returned
    /// as [`EngineError::Cascade`] with the new item already stored.
    #[tracing::instrument(
        skip(self, request),
        fields(project = %request.project_id, item_type = %request.item_type)
    )]
    pub fn create_item(&self, request: &CreateRequest) -> Result<CascadeOutcome, EngineError> {
        if request.title.trim().is_empty() {
            return Err(EngineError::Malformed("title must not be empty".to_string()));
        }

        let now = self.clock.now();
        let state = self.load_state(request.state)?;
        if state.project_id != request.project_id || state.item_type != request.item_type {
            return Err(EngineError::ForeignState {
                item_id: ItemId::UNSAVED,
                state: state.id,
                belong: state.belong,
            });
        }
        let iteration = self.load_iteration(request.iteration_id)?;

        validate_placement(
            iteration.as_ref(),
            &state,
            request.plan_started_at,
            request.plan_finished_at,
        )
        .map_err(|source| EngineError::schedule(ItemId::UNSAVED, source))?;

        let new_item = NewItem {
            project_id: request.project_id,
            item_type: request.item_type,
            title: request.title.clone(),
            iteration_id: request.iteration_id,
            state: state.id,
            plan_started_at: request.plan_started_at,
            plan_finished_at: request.plan_finished_at,
            start_time: (state.belong != Belong::Open).then_some(now),
            finish_time: state.belong.is_finished().then_some(now),
            expiry_status: schedule::expiry_status(request.plan_finished_at, now),
            parent_id: request.parent_id,
        };
        let item = self.store.create_item(&new_item)?;

        let deltas = created_deltas(&item);
        audit::record_best_effort(self.audit.as_ref(), item.id, &deltas);
        tracing::info!(item_id = %item.id, state = %item.state, "item created");

        let intent = UpdateIntent {
            item_id: item.id,
            old_belong: Belong::Open,
            new_belong: state.belong,
            old_iteration: item.iteration_id,
            new_iteration: item.iteration_id,
            plan_started_at: item.plan_started_at,
            plan_finished_at: item.plan_finished_at,
            cascade_children: false,
        };
        self.cascade_to_parent(&item, &intent)?;

        Ok(CascadeOutcome {
            item,
            deltas,
            pending_children: None,
        })
    }

    /// Move every descendant of `job.parent_id` to the new iteration, depth
    /// first in listing order, repairing each one's own dates. Each parent is
    /// rolled up once its children have all moved.
    ///
    /// # Errors
    ///
    /// Stops at the first failing descendant and returns
    /// [`EngineError::Cascade`] naming it. A revisited item is
    /// [`EngineError::CycleDetected`]; a hierarchy deeper than the configured
    /// limit is [`EngineError::DepthExceeded`].
    #[tracing::instrument(
        skip(self),
        fields(parent_id = %job.parent_id, iteration_id = %job.iteration_id)
    )]
    pub fn cascade_children(&self, job: ChildCascadeJob) -> Result<ChildCascadeReport, EngineError> {
        let mut visited = HashSet::from([job.parent_id]);
        let mut report = ChildCascadeReport::default();
        let mut ctx = self.auth_context(Identity::system());

        self.cascade_level(
            job.parent_id,
            job.iteration_id,
            1,
            &mut visited,
            &mut ctx,
            &mut report,
        )?;

        tracing::info!(
            visited = report.visited.len(),
            changed = report.changed.len(),
            "child cascade finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Stages 1 and 2
    // -----------------------------------------------------------------------

    fn update_own_fields(
        &self,
        request: &UpdateRequest,
        ctx: &mut AuthContext,
    ) -> Result<(CascadeOutcome, UpdateIntent), EngineError> {
        let now = self.clock.now();
        let item = self.store.get_item(request.item_id)?;
        let old_state = self.load_state(item.state)?;

        let new_state = match request.state {
            Some(target) if target != item.state => {
                let state = self.load_state(target)?;
                if state.project_id != item.project_id || state.item_type != item.item_type {
                    return Err(EngineError::ForeignState {
                        item_id: item.id,
                        state: state.id,
                        belong: state.belong,
                    });
                }
                let graph = TransitionGraph::load(self.store(), item.project_id, item.item_type)?;
                transition::check_transition(&graph, ctx, self.authorizer(), &item, target)?;
                state
            }
            _ => old_state.clone(),
        };

        let new_iteration = request.iteration_id.unwrap_or(item.iteration_id);
        let iteration = self.load_iteration(new_iteration)?;

        let mut intent = UpdateIntent {
            item_id: item.id,
            old_belong: old_state.belong,
            new_belong: new_state.belong,
            old_iteration: item.iteration_id,
            new_iteration,
            plan_started_at: item.plan_started_at,
            plan_finished_at: item.plan_finished_at,
            cascade_children: request.cascade_children,
        };

        let planned = plan_dates(
            &item,
            request,
            iteration.as_ref(),
            &new_state,
            intent.iteration_changed(),
            now,
        )
        .map_err(|source| EngineError::schedule(item.id, source))?;
        intent.plan_started_at = planned.started;
        intent.plan_finished_at = planned.finished;

        let mut patch = ItemPatch::default();
        if new_state.id != item.state {
            patch.state = Some(new_state.id);
        }
        if new_iteration != item.iteration_id {
            patch.iteration_id = Some(new_iteration);
        }
        apply_lifecycle(&mut patch, &item, old_state.belong, new_state.belong, now);
        apply_dates(&mut patch, &item, planned.started, planned.finished, now);

        let deltas = audit::deltas_for(&item, &patch, |field| match field {
            Field::PlanStartedAt => planned.started_reason,
            Field::PlanFinishedAt | Field::ExpiryStatus => planned.finished_reason,
            _ => ReasonTag::Updated,
        });
        let item = self.write(item, &patch, &deltas)?;

        let pending_children = intent.wants_child_cascade().then_some(ChildCascadeJob {
            parent_id: item.id,
            iteration_id: new_iteration,
        });

        Ok((
            CascadeOutcome {
                item,
                deltas,
                pending_children,
            },
            intent,
        ))
    }

    fn write(
        &self,
        mut item: WorkItem,
        patch: &ItemPatch,
        deltas: &DeltaSet,
    ) -> Result<WorkItem, EngineError> {
        if patch.is_empty() {
            tracing::debug!(item_id = %item.id, "nothing to write");
            return Ok(item);
        }
        self.store.update_item(item.id, patch)?;
        patch.apply_to(&mut item);
        audit::record_best_effort(self.audit.as_ref(), item.id, deltas);
        tracing::info!(item_id = %item.id, fields = deltas.len(), "item written");
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Stages 3 and 4
    // -----------------------------------------------------------------------

    fn cascade_to_parent(&self, item: &WorkItem, intent: &UpdateIntent) -> Result<(), EngineError> {
        let parent = self
            .parent_of(item.id)
            .map_err(|err| err.at_stage(item.id, CascadeStage::ParentAdvanced))?;
        let Some(mut parent) = parent else {
            return Ok(());
        };

        if intent.left_open() {
            if let Some(advanced) = self
                .advance_parent(&parent)
                .map_err(|err| err.at_stage(parent.id, CascadeStage::ParentAdvanced))?
            {
                parent = advanced;
            }
        }

        self.roll_up_parent(&parent)
            .map_err(|err| err.at_stage(parent.id, CascadeStage::ParentRolledUp))?;
        Ok(())
    }

    fn parent_of(&self, id: ItemId) -> Result<Option<WorkItem>, EngineError> {
        let mut parents = self.store.get_inclusion_parents(id)?;
        if parents.len() > 1 {
            tracing::warn!(
                item_id = %id,
                parents = parents.len(),
                "item has several inclusion parents; cascading to the first"
            );
        }
        Ok(if parents.is_empty() {
            None
        } else {
            Some(parents.swap_remove(0))
        })
    }

    fn advance_parent(&self, parent: &WorkItem) -> Result<Option<WorkItem>, EngineError> {
        let parent_state = self.load_state(parent.state)?;
        if parent_state.belong != Belong::Open {
            tracing::debug!(parent_id = %parent.id, belong = %parent_state.belong, "parent already started");
            return Ok(None);
        }
        if self
            .load_iteration(parent.iteration_id)?
            .is_some_and(|it| it.is_filed())
        {
            tracing::debug!(parent_id = %parent.id, "parent sits in a filed iteration");
            return Ok(None);
        }

        let graph = TransitionGraph::load(self.store(), parent.project_id, parent.item_type)?;
        let mut buttons = graph
            .buttons_from(parent.state)
            .ok_or_else(|| StoreError::not_found("state", parent.state.get()))?;
        let mut ctx = self.auth_context(Identity::system());
        transition::authorize(&mut buttons, &mut ctx, self.authorizer(), parent);

        let Some(target) = buttons
            .iter()
            .find(|b| b.permission && b.state_id != parent.state && b.belong == Belong::Working)
        else {
            tracing::debug!(parent_id = %parent.id, "no permitted WORKING state for parent");
            return Ok(None);
        };

        let mut patch = ItemPatch {
            state: Some(target.state_id),
            ..ItemPatch::default()
        };
        apply_lifecycle(
            &mut patch,
            parent,
            parent_state.belong,
            target.belong,
            self.clock.now(),
        );
        let deltas = audit::deltas_for(parent, &patch, |_| ReasonTag::ChildrenInProgress);
        tracing::info!(parent_id = %parent.id, state = %target.state_id, "advancing parent");
        self.write(parent.clone(), &patch, &deltas).map(Some)
    }

    fn roll_up_parent(&self, parent: &WorkItem) -> Result<Option<WorkItem>, EngineError> {
        let children = self.store.get_inclusion_children(parent.id)?;

        let mut started = children
            .iter()
            .filter_map(|c| c.plan_started_at)
            .min()
            .or(parent.plan_started_at);
        let finished = children
            .iter()
            .filter_map(|c| c.plan_finished_at)
            .max()
            .or(parent.plan_finished_at);
        if schedule::validate_order(started, finished).is_err() {
            started = schedule::adjust_plan_started(true, finished);
        }

        if started == parent.plan_started_at && finished == parent.plan_finished_at {
            tracing::debug!(parent_id = %parent.id, "parent schedule already rolled up");
            return Ok(None);
        }

        let iteration = self.load_iteration(parent.iteration_id)?;
        schedule::validate_within_iteration(iteration.as_ref(), started)
            .and_then(|()| schedule::validate_within_iteration(iteration.as_ref(), finished))
            .map_err(|source| EngineError::schedule(parent.id, source))?;

        let mut patch = ItemPatch::default();
        apply_dates(&mut patch, parent, started, finished, self.clock.now());
        let deltas = audit::deltas_for(parent, &patch, |_| ReasonTag::ChildrenPlanUpdated);
        self.write(parent.clone(), &patch, &deltas).map(Some)
    }

    // -----------------------------------------------------------------------
    // Stage 5
    // -----------------------------------------------------------------------

    fn cascade_level(
        &self,
        parent_id: ItemId,
        iteration_id: IterationId,
        depth: usize,
        visited: &mut HashSet<ItemId>,
        ctx: &mut AuthContext,
        report: &mut ChildCascadeReport,
    ) -> Result<(), EngineError> {
        let children = self
            .store
            .get_inclusion_children(parent_id)
            .map_err(|err| EngineError::from(err).at_stage(parent_id, CascadeStage::ChildrenCascaded))?;
        let has_children = !children.is_empty();

        for child in children {
            if !visited.insert(child.id) {
                tracing::error!(item_id = %child.id, parent_id = %parent_id, "inclusion cycle");
                return Err(EngineError::CycleDetected { item_id: child.id });
            }
            if depth > self.max_depth {
                return Err(EngineError::DepthExceeded {
                    item_id: parent_id,
                    limit: self.max_depth,
                });
            }
            report.visited.push(child.id);

            let request = UpdateRequest::new(child.id, ctx.identity().clone())
                .iteration(iteration_id)
                .cascade_to_children();
            let (outcome, _) = self
                .update_own_fields(&request, ctx)
                .map_err(|err| err.at_stage(child.id, CascadeStage::ChildrenCascaded))?;
            if !outcome.deltas.is_empty() {
                report.changed.push(child.id);
            }

            // A child already in the target iteration may still have
            // descendants left behind by an earlier partial run.
            self.cascade_level(child.id, iteration_id, depth + 1, visited, ctx, report)?;
        }

        if has_children {
            // Once per level: siblings still in the old iteration would fail
            // the window check against the parent's new one.
            let parent = self.store.get_item(parent_id).map_err(|err| {
                EngineError::from(err).at_stage(parent_id, CascadeStage::ParentRolledUp)
            })?;
            self.roll_up_parent(&parent)
                .map_err(|err| err.at_stage(parent_id, CascadeStage::ParentRolledUp))?;
        }
        Ok(())
    }
}

/// Invariants 1 to 3 for a fresh placement.
fn validate_placement(
    iteration: Option<&Iteration>,
    state: &State,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
) -> Result<(), ScheduleError> {
    schedule::validate_state_against_iteration(iteration, state)?;
    schedule::validate_within_iteration(iteration, started)?;
    schedule::validate_within_iteration(iteration, finished)?;
    schedule::validate_order(started, finished)
}

/// Decide the plan dates an update leaves behind.
///
/// Explicit dates must be valid as given. Derived dates are repaired:
/// the finish moves with the iteration, and a stored start that ends up
/// after the finish or outside the new window is pulled to the finish day.
fn plan_dates(
    item: &WorkItem,
    request: &UpdateRequest,
    iteration: Option<&Iteration>,
    state: &State,
    iteration_changed: bool,
    now: DateTime<Utc>,
) -> Result<PlannedDates, ScheduleError> {
    schedule::validate_state_against_iteration(iteration, state)?;
    if let Some(started) = request.plan_started_at {
        schedule::validate_within_iteration(iteration, started)?;
    }
    if let Some(finished) = request.plan_finished_at {
        schedule::validate_within_iteration(iteration, finished)?;
    }

    let mut planned = PlannedDates {
        started: request.plan_started_at.unwrap_or(item.plan_started_at),
        finished: request.plan_finished_at.unwrap_or(item.plan_finished_at),
        started_reason: ReasonTag::Updated,
        finished_reason: ReasonTag::Updated,
    };

    let mut finish_derived = false;
    if request.plan_finished_at.is_none() {
        if let Some(adjusted) = schedule::adjust_plan_finished(iteration_changed, iteration, now) {
            planned.finished = Some(adjusted);
            planned.finished_reason = ReasonTag::IterationChanged;
            finish_derived = true;
        }
    }

    if request.plan_started_at.is_some() && !finish_derived {
        schedule::validate_order(planned.started, planned.finished)?;
    }

    let after_finish = schedule::validate_order(planned.started, planned.finished).is_err();
    let outside_window = iteration_changed
        && request.plan_started_at.is_none()
        && schedule::validate_within_iteration(iteration, planned.started).is_err();
    if after_finish || outside_window {
        if let Some(adjusted) = schedule::adjust_plan_started(true, planned.finished) {
            planned.started = Some(adjusted);
            planned.started_reason = ReasonTag::PlanStartAdjusted;
        }
    }

    schedule::validate_order(planned.started, planned.finished)?;
    Ok(planned)
}

/// Stamps and counters that follow a belong change.
fn apply_lifecycle(
    patch: &mut ItemPatch,
    item: &WorkItem,
    old: Belong,
    new: Belong,
    now: DateTime<Utc>,
) {
    if old == new {
        return;
    }
    if new == Belong::Reopen {
        patch.reopen_count = Some(item.reopen_count.saturating_add(1));
    }
    if old == Belong::Open && item.start_time.is_none() {
        patch.start_time = Some(Some(now));
    }
    if new.is_finished() && !old.is_finished() {
        patch.finish_time = Some(Some(now));
    } else if old.is_finished() && !new.is_finished() && item.finish_time.is_some() {
        patch.finish_time = Some(None);
    }
}

/// Write slots for dates that differ from the stored ones. A moved finish
/// recomputes the expiry bucket.
fn apply_dates(
    patch: &mut ItemPatch,
    item: &WorkItem,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    if started != item.plan_started_at {
        patch.plan_started_at = Some(started);
    }
    if finished != item.plan_finished_at {
        patch.plan_finished_at = Some(finished);
        let expiry = schedule::expiry_status(finished, now);
        if expiry != item.expiry_status {
            patch.expiry_status = Some(expiry);
        }
    }
}

fn created_deltas(item: &WorkItem) -> DeltaSet {
    let blank = WorkItem {
        iteration_id: IterationId::UNASSIGNED,
        state: StateId(0),
        plan_started_at: None,
        plan_finished_at: None,
        start_time: None,
        finish_time: None,
        reopen_count: 0,
        expiry_status: crate::model::ExpiryStatus::Unspecified,
        ..item.clone()
    };
    let patch = ItemPatch {
        state: Some(item.state),
        iteration_id: Some(item.iteration_id),
        plan_started_at: Some(item.plan_started_at),
        plan_finished_at: Some(item.plan_finished_at),
        start_time: Some(item.start_time),
        finish_time: Some(item.finish_time),
        reopen_count: None,
        expiry_status: Some(item.expiry_status),
    };
    let mut deltas = audit::deltas_for(&blank, &patch, |_| ReasonTag::Created);
    if let Some(delta) = deltas.get_mut(&Field::State) {
        delta.old = None;
    }
    deltas
}
