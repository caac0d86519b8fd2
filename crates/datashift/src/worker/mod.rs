//! Worker executor.
//!
//! A worker owns one source and one target backend instance and processes
//! the coordinator's messages strictly one at a time:
//!
//! ```text
//! Uninitialized --Initialize--> Ready <--Work--> Working
//!                                 |
//!                             Terminate --> Terminated
//! ```
//!
//! - [`protocol`]: Message types and line codec
//! - [`runner`]: Serving the protocol over a byte stream (stdio)

pub mod protocol;
pub mod runner;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::{Backend, BackendCatalog, BackendContext, Environment, Role};
use crate::error::Result;
use crate::pipeline::{with_retry, MemoryGate};

pub use protocol::{CoordinatorMessage, WorkUnit, WorkerMessage};
pub use runner::{serve, serve_stdio};

/// Lifecycle state of a [`WorkerExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Uninitialized,
    Ready,
    Working,
    Terminated,
}

struct Backends {
    source: Box<dyn Backend>,
    target: Box<dyn Backend>,
}

/// Executes work units against per-worker backend instances.
pub struct WorkerExecutor {
    catalog: Arc<BackendCatalog>,
    state: ExecutorState,
    id: Option<usize>,
    env: Option<Environment>,
    backends: Option<Backends>,
    gate: Option<MemoryGate>,
}

impl WorkerExecutor {
    pub fn new(catalog: Arc<BackendCatalog>) -> Self {
        Self {
            catalog,
            state: ExecutorState::Uninitialized,
            id: None,
            env: None,
            backends: None,
            gate: None,
        }
    }

    /// Use `gate` instead of the one built from the environment's memory config.
    pub fn with_gate(mut self, gate: MemoryGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Handle one coordinator message, returning the reply to send back.
    pub async fn handle(&mut self, message: CoordinatorMessage) -> Option<WorkerMessage> {
        match message {
            CoordinatorMessage::Initialize { id, environment } => {
                self.initialize(id, environment).await
            }
            CoordinatorMessage::Work { offset, size } => {
                Some(self.work(WorkUnit::new(offset, size)).await)
            }
            CoordinatorMessage::Terminate => {
                self.terminate().await;
                None
            }
        }
    }

    async fn initialize(&mut self, id: usize, env: Environment) -> Option<WorkerMessage> {
        if self.state != ExecutorState::Uninitialized {
            return Some(WorkerMessage::error(
                format!("worker {} is already initialized", id),
                true,
            ));
        }
        self.id = Some(id);

        match self.open_backends(id, &env).await {
            Ok(backends) => {
                if self.gate.is_none() {
                    self.gate = Some(MemoryGate::from_config(&env.options.memory));
                }
                self.backends = Some(backends);
                self.env = Some(env);
                self.state = ExecutorState::Ready;
                debug!("Worker {} ready", id);
                None
            }
            Err(e) => {
                error!("Worker {} failed to initialize: {}", id, e);
                Some(WorkerMessage::error(
                    format!("worker {} failed to initialize: {}", id, e),
                    true,
                ))
            }
        }
    }

    async fn open_backends(&self, id: usize, env: &Environment) -> Result<Backends> {
        let source = self.catalog.create(
            &env.options.source,
            BackendContext::worker(Role::Source, id),
        )?;
        let target = self.catalog.create(
            &env.options.target,
            BackendContext::worker(Role::Target, id),
        )?;
        source.prepare(env).await?;
        target.prepare(env).await?;
        Ok(Backends { source, target })
    }

    async fn work(&mut self, unit: WorkUnit) -> WorkerMessage {
        let (Some(env), Some(backends), Some(gate)) =
            (self.env.as_ref(), self.backends.as_ref(), self.gate.as_mut())
        else {
            return WorkerMessage::error(format!("unit {}: worker is not initialized", unit), true);
        };
        self.state = ExecutorState::Working;

        let sample = gate.await_capacity().await;
        let result = run_unit(env, backends, unit).await;
        self.state = ExecutorState::Ready;

        match result {
            Ok((processed, end_of_stream)) => WorkerMessage::Done {
                processed,
                memory_usage: gate.latest().unwrap_or(sample),
                end_of_stream,
            },
            Err(e) => {
                warn!("Worker {:?}: unit {} failed: {}", self.id, unit, e);
                WorkerMessage::error(format!("unit {}: {}", unit, e), !e.is_retryable())
            }
        }
    }

    async fn terminate(&mut self) {
        if let (Some(env), Some(backends)) = (self.env.as_ref(), self.backends.as_ref()) {
            if let Err(e) = backends.target.end(env).await {
                error!("Worker {:?}: target end hook failed: {}", self.id, e);
            }
        }
        self.state = ExecutorState::Terminated;
        info!("Worker {:?} terminated", self.id);
    }
}

/// Fetch then store one unit. Returns `(records processed, end of stream)`.
async fn run_unit(env: &Environment, backends: &Backends, unit: WorkUnit) -> Result<(u64, bool)> {
    let attempts = env.options.transfer.get_max_retries();
    let source: &dyn Backend = backends.source.as_ref();
    let target: &dyn Backend = backends.target.as_ref();

    let page = with_retry(attempts, "fetch page", move |_| {
        source.get_data(env, unit.offset, unit.size)
    })
    .await?;

    if !page.is_empty() {
        let records = page.records.as_slice();
        with_retry(attempts, "store page", move |_| target.put_data(env, records)).await?;
    }

    Ok((page.len() as u64, page.exhausted))
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
