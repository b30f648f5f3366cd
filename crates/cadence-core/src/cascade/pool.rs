//! Bounded background pool for child cascades.
//!
//! Jobs go through a bounded queue to a fixed set of worker threads. `submit`
//! never blocks: a full queue is reported back to the caller immediately.
//! Failures are logged and also kept on a failure channel that owners can
//! drain; they never reach the request that scheduled the job. That channel
//! holds at most `capacity` undrained failures. Later ones are only logged
//! and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::EngineError;

use super::engine::CascadeEngine;
use super::intent::ChildCascadeJob;

/// Acknowledgement that a job was queued. It says nothing about completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeTicket {
    pub id: u64,
    pub job: ChildCascadeJob,
}

/// A background cascade that stopped with an error.
#[derive(Debug)]
pub struct CascadeFailure {
    pub ticket: CascadeTicket,
    pub error: EngineError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("cascade queue is full ({capacity} pending); dropped job for {}", .job.parent_id)]
    QueueFull { job: ChildCascadeJob, capacity: usize },

    #[error("cascade pool is shut down; dropped job for {}", .job.parent_id)]
    ShutDown { job: ChildCascadeJob },
}

#[derive(Debug)]
pub struct CascadePool {
    sender: Option<SyncSender<CascadeTicket>>,
    workers: Vec<JoinHandle<()>>,
    failures: Mutex<Receiver<CascadeFailure>>,
    next_ticket: AtomicU64,
    finished: Arc<AtomicU64>,
    dropped_failures: Arc<AtomicU64>,
    capacity: usize,
}

impl CascadePool {
    /// Spawn `workers` threads (at least one) sharing a queue of `capacity`
    /// pending jobs (at least one). The same bound applies to undrained
    /// failures.
    #[must_use]
    pub fn start(engine: Arc<CascadeEngine>, workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::sync_channel::<CascadeTicket>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let (failure_tx, failure_rx) = mpsc::sync_channel(capacity);
        let finished = Arc::new(AtomicU64::new(0));
        let dropped_failures = Arc::new(AtomicU64::new(0));

        let handles: Vec<JoinHandle<()>> = (0..workers.max(1))
            .filter_map(|index| {
                let engine = Arc::clone(&engine);
                let receiver = Arc::clone(&receiver);
                let failures = failure_tx.clone();
                let counters = Counters {
                    finished: Arc::clone(&finished),
                    dropped_failures: Arc::clone(&dropped_failures),
                };
                thread::Builder::new()
                    .name(format!("cadence-cascade-{index}"))
                    .spawn(move || worker_loop(index, &engine, &receiver, &failures, &counters))
                    .map_err(|err| {
                        tracing::error!(worker = index, error = %err, "failed to spawn cascade worker");
                    })
                    .ok()
            })
            .collect();

        tracing::debug!(workers = handles.len(), capacity, "cascade pool started");

        Self {
            sender: Some(sender),
            workers: handles,
            failures: Mutex::new(failure_rx),
            next_ticket: AtomicU64::new(1),
            finished,
            dropped_failures,
            capacity,
        }
    }

    /// Queue a job without waiting.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueFull`] when `capacity` jobs are already pending,
    /// [`SubmitError::ShutDown`] once the pool is closing.
    pub fn submit(&self, job: ChildCascadeJob) -> Result<CascadeTicket, SubmitError> {
        let Some(sender) = &self.sender else {
            return Err(SubmitError::ShutDown { job });
        };
        let ticket = CascadeTicket {
            id: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            job,
        };

        match sender.try_send(ticket) {
            Ok(()) => {
                tracing::debug!(ticket = ticket.id, parent_id = %job.parent_id, "child cascade scheduled");
                Ok(ticket)
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(parent_id = %job.parent_id, capacity = self.capacity, "cascade queue full");
                Err(SubmitError::QueueFull {
                    job,
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown { job }),
        }
    }

    /// Failures reported since the last drain.
    pub fn drain_failures(&self) -> Vec<CascadeFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_iter()
            .collect()
    }

    /// Jobs that ran to an end, successful or not.
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    /// Failures discarded because the failure channel was full.
    #[must_use]
    pub fn dropped_failures(&self) -> u64 {
        self.dropped_failures.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs, let the workers drain the queue, and return any
    /// failures not yet drained.
    pub fn shutdown(mut self) -> Vec<CascadeFailure> {
        self.close();
        self.drain_failures()
    }

    fn close(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("cascade worker panicked");
            }
        }
    }
}

impl Drop for CascadePool {
    fn drop(&mut self) {
        self.close();
    }
}

struct Counters {
    finished: Arc<AtomicU64>,
    dropped_failures: Arc<AtomicU64>,
}

fn worker_loop(
    index: usize,
    engine: &CascadeEngine,
    receiver: &Mutex<Receiver<CascadeTicket>>,
    failures: &SyncSender<CascadeFailure>,
    counters: &Counters,
) {
    loop {
        let next = receiver.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(ticket) = next else {
            tracing::debug!(worker = index, "cascade queue closed");
            return;
        };

        match engine.cascade_children(ticket.job) {
            Ok(report) => tracing::debug!(
                worker = index,
                ticket = ticket.id,
                changed = report.changed.len(),
                "background child cascade done"
            ),
            Err(error) => {
                tracing::error!(
                    worker = index,
                    ticket = ticket.id,
                    parent_id = %ticket.job.parent_id,
                    code = %error.code(),
                    error = %error,
                    "background child cascade failed"
                );
                // Full or abandoned channel: the log line stands.
                if failures.try_send(CascadeFailure { ticket, error }).is_err() {
                    counters.dropped_failures.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!(worker = index, ticket = ticket.id, "failure channel full");
                }
            }
        }
        counters.finished.fetch_add(1, Ordering::Release);
    }
}
