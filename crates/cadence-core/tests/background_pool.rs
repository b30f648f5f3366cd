//! Child cascades on the background pool.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::audit::AuditSink;
use cadence_core::cascade::{
    CascadeEngine, CascadePool, ChildCascadeJob, ChildCascadeStatus, LifecycleService,
    SubmitError, UpdateRequest,
};
use cadence_core::config::EngineConfig;
use cadence_core::error::{EngineError, StoreError};
use cadence_core::model::{
    ItemId, ItemType, Iteration, IterationId, ProjectId, State, StateId, StateRelation, WorkItem,
};
use cadence_core::store::{ItemPatch, ItemStore, NewItem, SqliteStore};
use cadence_core::transition::{AllowAll, Identity};
use fixtures::*;

const WAIT: Duration = Duration::from_secs(10);

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the pool");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn background_cascade_moves_children_after_update_returns() {
    let config = EngineConfig::default();
    let fx = Fixture::with(Arc::new(AllowAll), &config);
    let req = fx.create(ItemType::Requirement, REQ_NEW, SPRINT_1, None, (None, None));
    let children: Vec<_> = (0..3)
        .map(|_| fx.create(ItemType::Task, TODO, SPRINT_1, Some(req.id), (None, None)))
        .collect();

    let Fixture { store, engine } = fx;
    let service = LifecycleService::new(engine, &config);
    let receipt = service
        .update_item(
            &UpdateRequest::new(req.id, Identity::user("ann"))
                .iteration(SPRINT_2)
                .cascade_to_children(),
        )
        .unwrap();

    match receipt.children {
        ChildCascadeStatus::Scheduled(ticket) => assert_eq!(ticket.job.parent_id, req.id),
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(receipt.item.iteration_id, SPRINT_2);

    assert!(service.shutdown().is_empty());
    for child in children {
        assert_eq!(store.get_item(child.id).unwrap().iteration_id, SPRINT_2);
    }
}

#[test]
fn background_failure_is_drained_not_returned() {
    let config = EngineConfig::default();
    let fx = Fixture::with(Arc::new(AllowAll), &config);
    let req = fx.create(ItemType::Requirement, REQ_DONE, SPRINT_1, None, (None, None));
    let open = fx.create(ItemType::Task, TODO, SPRINT_1, Some(req.id), (None, None));

    let Fixture { store, engine } = fx;
    let pool = CascadePool::start(Arc::new(engine), 1, 4);
    let ticket = pool
        .submit(ChildCascadeJob {
            parent_id: req.id,
            iteration_id: ARCHIVED,
        })
        .unwrap();

    wait_until(|| pool.finished() == 1);
    let failures = pool.drain_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].ticket, ticket);
    assert!(matches!(
        failures[0].error,
        EngineError::Cascade { item_id, .. } if item_id == open.id
    ));

    assert!(pool.drain_failures().is_empty());
    assert!(pool.shutdown().is_empty());
    assert_eq!(store.get_item(open.id).unwrap().iteration_id, SPRINT_1);
}

#[test]
fn undrained_failures_are_capped_at_queue_capacity() {
    let config = EngineConfig::default();
    let fx = Fixture::with(Arc::new(AllowAll), &config);
    let req = fx.create(ItemType::Requirement, REQ_DONE, SPRINT_1, None, (None, None));
    fx.create(ItemType::Task, TODO, SPRINT_1, Some(req.id), (None, None));

    let pool = CascadePool::start(Arc::new(fx.engine), 1, 2);
    let mut tickets = Vec::new();
    for round in 1..=4 {
        let ticket = pool
            .submit(ChildCascadeJob {
                parent_id: req.id,
                iteration_id: ARCHIVED,
            })
            .unwrap();
        tickets.push(ticket);
        wait_until(|| pool.finished() == round);
    }

    assert_eq!(pool.dropped_failures(), 2);
    let kept: Vec<_> = pool.drain_failures().into_iter().map(|f| f.ticket).collect();
    assert_eq!(kept, tickets[..2]);
    assert!(pool.shutdown().is_empty());
}

#[test]
fn pool_sizes_are_clamped_and_idle_shutdown_is_clean() {
    let service = LifecycleService::new(Fixture::new().engine, &EngineConfig::default());
    assert!(service.shutdown().is_empty());

    let pool = CascadePool::start(Arc::new(Fixture::new().engine), 0, 0);
    assert_eq!(pool.worker_count(), 1);
    pool.submit(ChildCascadeJob {
        parent_id: ItemId(1),
        iteration_id: SPRINT_1,
    })
    .unwrap();
    assert!(pool.shutdown().is_empty());
}

// ---------------------------------------------------------------------------
// Queue pressure
// ---------------------------------------------------------------------------

/// Store whose first child listing blocks until released.
struct GatedStore {
    inner: Arc<SqliteStore>,
    armed: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl ItemStore for GatedStore {
    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        self.inner.get_item(id)
    }

    fn create_item(&self, item: &NewItem) -> Result<WorkItem, StoreError> {
        self.inner.create_item(item)
    }

    fn update_item(&self, id: ItemId, patch: &ItemPatch) -> Result<(), StoreError> {
        self.inner.update_item(id, patch)
    }

    fn get_iteration(&self, id: IterationId) -> Result<Iteration, StoreError> {
        self.inner.get_iteration(id)
    }

    fn get_state(&self, id: StateId) -> Result<State, StoreError> {
        self.inner.get_state(id)
    }

    fn list_states(&self, project: ProjectId, item_type: ItemType) -> Result<Vec<State>, StoreError> {
        self.inner.list_states(project, item_type)
    }

    fn get_state_relations(
        &self,
        project: ProjectId,
        item_type: ItemType,
    ) -> Result<Vec<StateRelation>, StoreError> {
        self.inner.get_state_relations(project, item_type)
    }

    fn get_inclusion_parents(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError> {
        self.inner.get_inclusion_parents(id)
    }

    fn get_inclusion_children(&self, id: ItemId) -> Result<Vec<WorkItem>, StoreError> {
        if self.armed.swap(false, Ordering::AcqRel) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv_timeout(WAIT);
        }
        self.inner.get_inclusion_children(id)
    }
}

#[test]
fn full_queue_rejects_without_blocking() {
    let sqlite = Arc::new(seeded_store());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gated = Arc::new(GatedStore {
        inner: Arc::clone(&sqlite),
        armed: AtomicBool::new(true),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let audit: Arc<dyn AuditSink> = sqlite;
    let engine = CascadeEngine::new(gated, Arc::new(AllowAll), audit);
    let pool = CascadePool::start(Arc::new(engine), 1, 1);

    let job = |parent| ChildCascadeJob {
        parent_id: ItemId(parent),
        iteration_id: SPRINT_1,
    };

    pool.submit(job(1)).unwrap();
    entered_rx.recv_timeout(WAIT).expect("worker picked up the first job");

    pool.submit(job(2)).unwrap();
    let started = Instant::now();
    let rejected = pool.submit(job(3)).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        rejected,
        SubmitError::QueueFull {
            job: job(3),
            capacity: 1,
        }
    );

    release_tx.send(()).unwrap();
    wait_until(|| pool.finished() == 2);
    assert!(pool.shutdown().is_empty());
}
