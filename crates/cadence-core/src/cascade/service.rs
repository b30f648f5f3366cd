use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::audit::{AuditSink, DeltaSet};
use crate::config::{self, EngineConfig};
use crate::error::EngineError;
use crate::model::{ItemId, WorkItem};
use crate::store::{Clock, ItemStore};
use crate::transition::{self, Authorizer, Button, Identity};

use super::engine::CascadeEngine;
use super::intent::{CascadeOutcome, ChildCascadeJob, ChildCascadeReport, CreateRequest, UpdateRequest};
use super::pool::{CascadeFailure, CascadePool, CascadeTicket, SubmitError};

/// What happened to the child cascade an update asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildCascadeStatus {
    NotRequested,
    /// Queued on the background pool. Completion is not awaited.
    Scheduled(CascadeTicket),
    /// The pool refused the job; the item's own update still stands.
    Rejected(SubmitError),
    /// Ran inline before returning.
    Completed(ChildCascadeReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReceipt {
    pub item: WorkItem,
    pub deltas: DeltaSet,
    pub children: ChildCascadeStatus,
}

/// Entry point for hosts: the engine plus, when configured, the background
/// pool that runs update-triggered child cascades.
#[derive(Debug)]
pub struct LifecycleService {
    engine: Arc<CascadeEngine>,
    pool: Option<CascadePool>,
}

impl LifecycleService {
    #[must_use]
    pub fn new(engine: CascadeEngine, config: &EngineConfig) -> Self {
        let engine = Arc::new(engine);
        let cascade = &config.cascade;
        let pool = cascade.children_in_background.then(|| {
            CascadePool::start(Arc::clone(&engine), cascade.workers, cascade.queue_capacity)
        });
        Self { engine, pool }
    }

    /// Build from `<root>/.cadence/config.toml` and the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn open(
        root: &Path,
        store: Arc<dyn ItemStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = config::load_engine_config(root)?;
        let engine = CascadeEngine::with_config(store, authorizer, audit, &config).with_clock(clock);
        Ok(Self::new(engine, &config))
    }

    #[must_use]
    pub fn engine(&self) -> &CascadeEngine {
        &self.engine
    }

    /// Buttons `identity` sees for one item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item or its workflow cannot be loaded.
    pub fn buttons(&self, identity: Identity, item_id: ItemId) -> Result<Vec<Button>, EngineError> {
        let item = self.engine.store().get_item(item_id)?;
        let mut ctx = self.engine.auth_context(identity);
        transition::buttons_for_item(self.engine.store(), self.engine.authorizer(), &mut ctx, &item)
    }

    /// Create an item; parent stages run before this returns.
    ///
    /// # Errors
    ///
    /// See [`CascadeEngine::create_item`].
    pub fn create_item(&self, request: &CreateRequest) -> Result<CascadeOutcome, EngineError> {
        self.engine.create_item(request)
    }

    /// Update an item and dispatch any requested child cascade.
    ///
    /// # Errors
    ///
    /// Errors of the item's own update and of its parent stages. A background
    /// child cascade never fails this call; an inline one does.
    pub fn update_item(&self, request: &UpdateRequest) -> Result<UpdateReceipt, EngineError> {
        let outcome = self.engine.update_item(request)?;

        let children = match outcome.pending_children {
            None => ChildCascadeStatus::NotRequested,
            Some(job) => self.dispatch(job)?,
        };

        Ok(UpdateReceipt {
            item: outcome.item,
            deltas: outcome.deltas,
            children,
        })
    }

    fn dispatch(&self, job: ChildCascadeJob) -> Result<ChildCascadeStatus, EngineError> {
        let Some(pool) = &self.pool else {
            return self
                .engine
                .cascade_children(job)
                .map(ChildCascadeStatus::Completed);
        };
        Ok(match pool.submit(job) {
            Ok(ticket) => ChildCascadeStatus::Scheduled(ticket),
            Err(err) => {
                tracing::error!(parent_id = %job.parent_id, error = %err, "child cascade not scheduled");
                ChildCascadeStatus::Rejected(err)
            }
        })
    }

    /// Run a child cascade now, regardless of the background setting.
    ///
    /// # Errors
    ///
    /// See [`CascadeEngine::cascade_children`].
    pub fn cascade_children(&self, job: ChildCascadeJob) -> Result<ChildCascadeReport, EngineError> {
        self.engine.cascade_children(job)
    }

    /// Background failures reported since the last call.
    pub fn drain_failures(&self) -> Vec<CascadeFailure> {
        self.pool
            .as_ref()
            .map(CascadePool::drain_failures)
            .unwrap_or_default()
    }

    /// Wait for queued child cascades to finish, then return any failures
    /// not yet drained.
    pub fn shutdown(self) -> Vec<CascadeFailure> {
        self.pool.map(CascadePool::shutdown).unwrap_or_default()
    }
}
