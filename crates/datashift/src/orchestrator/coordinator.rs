//! Worker pool coordinator.
//!
//! [`start`] builds a [`PoolHandle`] over either a single in-process
//! executor (fewer than two workers) or a set of isolated workers. The
//! handle is the only owner of worker state and progress counters:
//! workers report deltas, and every report is applied here, so nothing is
//! shared or locked.
//!
//! `dispatch` hands a unit to the lowest-numbered `Ready` worker. With no
//! worker ready it waits on the report channel; it never fails because
//! the pool is busy.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{BackendCatalog, Environment};
use crate::error::{Result, TransferError};
use crate::worker::{CoordinatorMessage, WorkUnit, WorkerExecutor, WorkerMessage};

use super::spawn::{spawn_worker, Launcher, WorkerEvent, WorkerLink};

/// Progress counters owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressStats {
    pub processed_count: u64,
    pub total_expected: u64,
    pub peak_memory_ratio: f64,
    pub failed_units: u64,
    pub dispatched_units: u64,
}

/// An error reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub worker_id: usize,
    /// The unit that was in flight, if any.
    pub unit: Option<WorkUnit>,
    pub message: String,
    pub fatal: bool,
}

pub type ProgressListener = Box<dyn FnMut(&ProgressStats) + Send>;
pub type ErrorListener = Box<dyn FnMut(&WorkerFailure) + Send>;
pub type CompletionListener = Box<dyn FnMut(&ProgressStats) + Send>;

/// Coordinator view of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Working(WorkUnit),
    /// Channel closed unexpectedly; never dispatched to again.
    Lost,
}

enum Pool {
    InProcess {
        executor: Box<WorkerExecutor>,
        pending: VecDeque<WorkerEvent>,
    },
    Isolated {
        links: Vec<WorkerLink>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    },
}

impl Pool {
    /// Deliver `message` to worker `id`. Returns `false` if it is gone.
    async fn send(&mut self, id: usize, message: CoordinatorMessage) -> bool {
        match self {
            Pool::InProcess { executor, pending } => {
                if let Some(reply) = executor.handle(message).await {
                    pending.push_back(WorkerEvent::message(id, reply));
                }
                true
            }
            Pool::Isolated { links, .. } => links
                .get(id)
                .map(|link| link.send(message))
                .unwrap_or(false),
        }
    }

    async fn next_event(&mut self) -> Option<WorkerEvent> {
        match self {
            Pool::InProcess { pending, .. } => pending.pop_front(),
            Pool::Isolated { events, .. } => events.recv().await,
        }
    }

    fn try_next_event(&mut self) -> Option<WorkerEvent> {
        match self {
            Pool::InProcess { pending, .. } => pending.pop_front(),
            Pool::Isolated { events, .. } => events.try_recv().ok(),
        }
    }
}

/// Start a pool of `worker_count` workers for `environment`.
///
/// Fewer than two workers runs a single executor inline, without message
/// passing or isolation; `launcher` is then unused.
pub async fn start(
    environment: Environment,
    worker_count: usize,
    catalog: Arc<BackendCatalog>,
    launcher: &Launcher,
) -> Result<PoolHandle> {
    let total_expected = environment.statistics.records_expected;

    if worker_count < 2 {
        let mut executor = WorkerExecutor::new(catalog);
        let mut pending = VecDeque::new();
        let init = CoordinatorMessage::Initialize {
            id: 0,
            environment,
        };
        if let Some(reply) = executor.handle(init).await {
            pending.push_back(WorkerEvent::message(0, reply));
        }
        info!("Started in-process worker");
        let pool = Pool::InProcess {
            executor: Box::new(executor),
            pending,
        };
        return Ok(PoolHandle::new(pool, 1, total_expected));
    }

    let (events_tx, events) = mpsc::unbounded_channel();
    let mut links = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let link = spawn_worker(launcher, id, &catalog, events_tx.clone())?;
        link.send(CoordinatorMessage::Initialize {
            id,
            environment: environment.clone(),
        });
        links.push(link);
    }
    info!("Started {} {} workers", worker_count, launcher.kind());

    Ok(PoolHandle::new(
        Pool::Isolated { links, events },
        worker_count,
        total_expected,
    ))
}

/// Handle to a running pool.
pub struct PoolHandle {
    pool: Pool,
    workers: Vec<WorkerState>,
    stats: ProgressStats,
    source_exhausted: bool,
    completed: bool,
    terminated: bool,
    progress_listeners: Vec<ProgressListener>,
    error_listeners: Vec<ErrorListener>,
    completion_listeners: Vec<CompletionListener>,
}

impl PoolHandle {
    fn new(pool: Pool, worker_count: usize, total_expected: u64) -> Self {
        Self {
            pool,
            workers: vec![WorkerState::Ready; worker_count],
            stats: ProgressStats {
                total_expected,
                ..Default::default()
            },
            source_exhausted: false,
            completed: false,
            terminated: false,
            progress_listeners: Vec::new(),
            error_listeners: Vec::new(),
            completion_listeners: Vec::new(),
        }
    }

    pub fn on_progress(&mut self, listener: impl FnMut(&ProgressStats) + Send + 'static) {
        self.progress_listeners.push(Box::new(listener));
    }

    pub fn on_error(&mut self, listener: impl FnMut(&WorkerFailure) + Send + 'static) {
        self.error_listeners.push(Box::new(listener));
    }

    pub fn on_complete(&mut self, listener: impl FnMut(&ProgressStats) + Send + 'static) {
        self.completion_listeners.push(Box::new(listener));
    }

    pub fn stats(&self) -> &ProgressStats {
        &self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_states(&self) -> &[WorkerState] {
        &self.workers
    }

    /// A worker has reported that the source has no more records.
    pub fn source_exhausted(&self) -> bool {
        self.source_exhausted
    }

    /// Completion listeners have fired.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Send `[offset, offset + size)` to the first ready worker, waiting
    /// for one if all are busy.
    pub async fn dispatch(&mut self, offset: u64, size: usize) -> Result<()> {
        let unit = WorkUnit::new(offset, size);
        while let Some(event) = self.pool.try_next_event() {
            self.process(event).await;
        }
        loop {
            if self.terminated {
                return Err(TransferError::pool(
                    "pool is terminated",
                    format!("dispatching {}", unit),
                ));
            }

            if let Some(id) = self.workers.iter().position(|w| *w == WorkerState::Ready) {
                self.workers[id] = WorkerState::Working(unit);
                if !self.pool.send(id, CoordinatorMessage::work(unit)).await {
                    warn!("Worker {} is gone, redispatching {}", id, unit);
                    self.workers[id] = WorkerState::Lost;
                    continue;
                }
                self.stats.dispatched_units += 1;
                debug!("Dispatched {} to worker {}", unit, id);
                while let Some(event) = self.pool.try_next_event() {
                    self.process(event).await;
                }
                return Ok(());
            }

            if self.workers.iter().all(|w| *w == WorkerState::Lost) {
                return Err(TransferError::pool(
                    "all workers lost",
                    format!("dispatching {}", unit),
                ));
            }

            match self.pool.next_event().await {
                Some(event) => self.process(event).await,
                None => {
                    return Err(TransferError::pool(
                        "worker channels closed",
                        format!("dispatching {}", unit),
                    ))
                }
            }
        }
    }

    /// Wait for in-flight units, fire completion if it has not fired, then
    /// terminate and join every worker.
    pub async fn finish(&mut self) -> ProgressStats {
        while self.workers.iter().any(|w| matches!(w, WorkerState::Working(_))) {
            match self.pool.next_event().await {
                Some(event) => self.process(event).await,
                None => {
                    for worker in self.workers.iter_mut() {
                        if matches!(worker, WorkerState::Working(_)) {
                            *worker = WorkerState::Lost;
                        }
                    }
                }
            }
        }
        if !self.completed {
            self.fire_completion();
        }
        self.shutdown().await;
        self.stats.clone()
    }

    /// Terminate and join every worker without waiting for in-flight units
    /// beyond what termination itself implies.
    pub async fn shutdown(&mut self) {
        self.terminate_all().await;
        if let Pool::Isolated { links, .. } = &mut self.pool {
            join_all(links.drain(..).map(WorkerLink::join)).await;
        }
    }

    async fn terminate_all(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        for id in 0..self.workers.len() {
            if self.workers[id] != WorkerState::Lost {
                self.pool.send(id, CoordinatorMessage::Terminate).await;
            }
        }
        debug!("Terminate sent to all workers");
    }

    async fn process(&mut self, event: WorkerEvent) {
        let id = event.worker_id;
        let Some(previous) = self.workers.get(id).copied() else {
            warn!("Report from unknown worker {}", id);
            return;
        };

        match event.message {
            Some(WorkerMessage::Done {
                processed,
                memory_usage,
                end_of_stream,
            }) => {
                if previous != WorkerState::Lost {
                    self.workers[id] = WorkerState::Ready;
                }
                self.stats.processed_count += processed;
                self.stats.peak_memory_ratio =
                    self.stats.peak_memory_ratio.max(memory_usage.ratio);
                if end_of_stream {
                    self.source_exhausted = true;
                }
                for listener in self.progress_listeners.iter_mut() {
                    listener(&self.stats);
                }
            }
            Some(WorkerMessage::Error { message, fatal }) => {
                let unit = match previous {
                    WorkerState::Working(unit) => Some(unit),
                    _ => None,
                };
                if previous != WorkerState::Lost {
                    self.workers[id] = WorkerState::Ready;
                }
                if unit.is_some() {
                    self.stats.failed_units += 1;
                }
                self.report(WorkerFailure {
                    worker_id: id,
                    unit,
                    message,
                    fatal,
                });
            }
            None => {
                self.workers[id] = WorkerState::Lost;
                if self.terminated {
                    return;
                }
                warn!("Worker {} exited unexpectedly", id);
                if let WorkerState::Working(unit) = previous {
                    self.stats.failed_units += 1;
                    self.report(WorkerFailure {
                        worker_id: id,
                        unit: Some(unit),
                        message: format!("worker {} exited while processing {}", id, unit),
                        fatal: false,
                    });
                }
            }
        }

        self.check_completion().await;
    }

    fn report(&mut self, failure: WorkerFailure) {
        for listener in self.error_listeners.iter_mut() {
            listener(&failure);
        }
    }

    async fn check_completion(&mut self) {
        if self.completed || self.stats.processed_count != self.stats.total_expected {
            return;
        }
        if self
            .workers
            .iter()
            .any(|w| matches!(w, WorkerState::Working(_)))
        {
            return;
        }
        self.fire_completion();
        self.terminate_all().await;
    }

    fn fire_completion(&mut self) {
        self.completed = true;
        info!(
            "Pool complete: {} of {} records",
            self.stats.processed_count, self.stats.total_expected
        );
        for listener in self.completion_listeners.iter_mut() {
            listener(&self.stats);
        }
    }
}
