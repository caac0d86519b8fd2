//! Isolated worker spawning.
//!
//! A worker is reachable only through an unbounded command channel; its
//! replies arrive on the coordinator's shared event channel tagged with
//! the worker id. When a worker goes away for any reason a final event
//! with no message is sent, so the coordinator never waits on a dead
//! worker.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::BackendCatalog;
use crate::error::{Result, TransferError};
use crate::worker::protocol::{decode, encode};
use crate::worker::{CoordinatorMessage, WorkerExecutor, WorkerMessage};

/// How long a terminated worker process may take to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(30);

/// How isolated workers are started.
#[derive(Debug, Clone)]
pub enum Launcher {
    /// Run `program args...` once per worker; it must serve the worker
    /// protocol on stdin/stdout.
    Process { program: PathBuf, args: Vec<String> },
    /// Run each worker as a tokio task with its own backend instances.
    Task,
}

impl Launcher {
    pub fn kind(&self) -> &'static str {
        match self {
            Launcher::Process { .. } => "process",
            Launcher::Task => "task",
        }
    }
}

/// A report from a worker. `None` means the worker's channel closed.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub worker_id: usize,
    pub message: Option<WorkerMessage>,
}

impl WorkerEvent {
    pub fn message(worker_id: usize, message: WorkerMessage) -> Self {
        Self {
            worker_id,
            message: Some(message),
        }
    }

    pub fn closed(worker_id: usize) -> Self {
        Self {
            worker_id,
            message: None,
        }
    }
}

/// Coordinator side of one isolated worker.
pub(crate) struct WorkerLink {
    id: usize,
    tx: Option<mpsc::UnboundedSender<CoordinatorMessage>>,
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
}

impl WorkerLink {
    /// Queue a message for the worker. Returns `false` if it is gone.
    pub fn send(&self, message: CoordinatorMessage) -> bool {
        self.tx
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Close the command channel and wait for the worker to exit.
    pub async fn join(mut self) {
        self.tx = None;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    warn!("Worker {} exited with {}", self.id, status)
                }
                Ok(Ok(_)) => debug!("Worker {} exited", self.id),
                Ok(Err(e)) => warn!("Worker {}: wait failed: {}", self.id, e),
                Err(_) => {
                    warn!("Worker {} did not exit after {:?}, killing", self.id, EXIT_GRACE);
                    if let Err(e) = child.kill().await {
                        error!("Worker {}: kill failed: {}", self.id, e);
                    }
                }
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Worker {} I/O task failed: {}", self.id, e);
            }
        }
    }
}

/// Start worker `id`.
pub(crate) fn spawn_worker(
    launcher: &Launcher,
    id: usize,
    catalog: &Arc<BackendCatalog>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerLink> {
    match launcher {
        Launcher::Process { program, args } => spawn_process(program, args, id, events),
        Launcher::Task => Ok(spawn_task(id, catalog.clone(), events)),
    }
}

fn spawn_task(
    id: usize,
    catalog: Arc<BackendCatalog>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerLink {
    let (tx, mut rx) = mpsc::unbounded_channel::<CoordinatorMessage>();

    let handle = tokio::spawn(async move {
        let serve = async {
            let mut executor = WorkerExecutor::new(catalog);
            while let Some(message) = rx.recv().await {
                let terminate = matches!(message, CoordinatorMessage::Terminate);
                if let Some(reply) = executor.handle(message).await {
                    if events.send(WorkerEvent::message(id, reply)).is_err() {
                        return;
                    }
                }
                if terminate {
                    return;
                }
            }
            executor.handle(CoordinatorMessage::Terminate).await;
        };
        if AssertUnwindSafe(serve).catch_unwind().await.is_err() {
            error!("Worker {} panicked", id);
        }
        let _ = events.send(WorkerEvent::closed(id));
    });

    WorkerLink {
        id,
        tx: Some(tx),
        tasks: vec![handle],
        child: None,
    }
}

fn spawn_process(
    program: &Path,
    args: &[String],
    id: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerLink> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // Keep terminal signals away from workers; the coordinator cancels
    // and then terminates them over the protocol.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| {
            TransferError::pool(
                e.to_string(),
                format!("spawning worker {} ({})", id, program.display()),
            )
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransferError::pool("stdin not captured", format!("worker {}", id)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransferError::pool("stdout not captured", format!("worker {}", id)))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<CoordinatorMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let terminate = matches!(message, CoordinatorMessage::Terminate);
            let mut line = match encode(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("Worker {}: {}", id, e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!("Worker {}: write failed: {}", id, e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!("Worker {}: flush failed: {}", id, e);
                break;
            }
            if terminate {
                break;
            }
        }
        // Dropping stdin closes the worker's input.
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match decode::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if events.send(WorkerEvent::message(id, message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Worker {}: ignoring output line: {}", id, e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Worker {}: read failed: {}", id, e);
                    break;
                }
            }
        }
        let _ = events.send(WorkerEvent::closed(id));
    });

    debug!("Spawned worker process {} ({:?})", id, child.id());
    Ok(WorkerLink {
        id,
        tx: Some(tx),
        tasks: vec![writer, reader],
        child: Some(child),
    })
}
