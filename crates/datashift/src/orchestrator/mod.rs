//! Transfer orchestrator - main workflow coordinator.
//!
//! A run resolves and checks both backends on the coordinating side, copies
//! metadata, then streams the source through the worker pool page by page.
//!
//! - [`coordinator`]: Worker pool, dispatch and report handling
//! - [`spawn`]: Process and task worker isolation

pub mod coordinator;
pub mod spawn;

pub use coordinator::{start, PoolHandle, ProgressStats, WorkerFailure, WorkerState};
pub use spawn::Launcher;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Isolation};
use crate::core::{BackendCatalog, BackendContext, Environment, Role, Statistics};
use crate::error::{Result, TransferError};

/// Transfer orchestrator.
pub struct Orchestrator {
    config: Config,
    catalog: Arc<BackendCatalog>,
    worker_program: Option<(PathBuf, Vec<String>)>,
    dry_run: bool,
    progress_output: bool,
}

/// Result of a transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// How the run ended.
    pub status: RunStatus,

    /// SHA-256 of the configuration the run used.
    pub config_hash: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Records the run set out to move.
    pub records_expected: u64,

    /// Records written to the target.
    pub records_processed: u64,

    /// Units that failed and were skipped.
    pub failed_units: u64,

    /// Highest worker memory ratio reported.
    pub peak_memory_ratio: f64,

    /// Pool size.
    pub workers: usize,

    /// Average throughput.
    pub records_per_second: f64,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Finished, with some units skipped under `ignore_errors`.
    CompletedWithErrors,
    Cancelled,
    DryRun,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed with errors",
            RunStatus::Cancelled => "cancelled",
            RunStatus::DryRun => "dry run",
        };
        f.write_str(name)
    }
}

impl RunSummary {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// `Err(Cancelled)` for a cancelled run, `Ok` for every other status.
    pub fn outcome(&self) -> Result<()> {
        match self.status {
            RunStatus::Cancelled => Err(TransferError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Logs progress at debug, every tenth at info, and optionally as JSON lines on stderr.
struct ProgressReporter {
    last_decile: u64,
    json_lines: bool,
}

impl ProgressReporter {
    fn report(&mut self, stats: &ProgressStats) {
        debug!(
            "Progress: {}/{} records, {} units dispatched, {} failed",
            stats.processed_count, stats.total_expected, stats.dispatched_units, stats.failed_units
        );
        if stats.total_expected > 0 {
            let decile = (stats.processed_count.saturating_mul(10) / stats.total_expected).min(10);
            if decile > self.last_decile {
                self.last_decile = decile;
                info!(
                    "Progress: {}% ({}/{} records)",
                    decile * 10,
                    stats.processed_count,
                    stats.total_expected
                );
            }
        }
        if self.json_lines {
            let line = json!({
                "type": "progress",
                "processed": stats.processed_count,
                "total": stats.total_expected,
                "failed_units": stats.failed_units,
                "peak_memory_ratio": stats.peak_memory_ratio,
            });
            eprintln!("{}", line);
        }
    }
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(config: Config, catalog: Arc<BackendCatalog>) -> Self {
        Self {
            config,
            catalog,
            worker_program: None,
            dry_run: false,
            progress_output: false,
        }
    }

    /// Program (and arguments) that serves the worker protocol, for
    /// process isolation.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.worker_program = Some((program.into(), args));
        self
    }

    /// Stop after pre-flight checks and metadata copy.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Write progress updates to stderr as JSON lines.
    pub fn with_progress_output(mut self, enabled: bool) -> Self {
        self.progress_output = enabled;
        self
    }

    fn launcher(&self, workers: usize) -> Result<Launcher> {
        match self.config.transfer.isolation {
            Isolation::Task => Ok(Launcher::Task),
            Isolation::Process => match &self.worker_program {
                Some((program, args)) => Ok(Launcher::Process {
                    program: program.clone(),
                    args: args.clone(),
                }),
                None if workers < 2 => Ok(Launcher::Task),
                None => Err(TransferError::Config(
                    "process isolation needs a worker program; set transfer.isolation to 'task'"
                        .to_string(),
                )),
            },
        }
    }

    /// Run the transfer.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary> {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let config_hash = self.config.hash();
        let transfer = &self.config.transfer;

        info!("Starting transfer run: {}", run_id);

        // Phase 1: Resolve and verify backends
        let source = self.catalog.create(
            &self.config.source,
            BackendContext::coordinator(Role::Source),
        )?;
        let target = self.catalog.create(
            &self.config.target,
            BackendContext::coordinator(Role::Target),
        )?;
        let mut problems = source.verify_options();
        problems.extend(target.verify_options());
        if !problems.is_empty() {
            return Err(TransferError::Config(problems.join("; ")));
        }
        let workers = transfer.get_workers();
        let launcher = self.launcher(workers)?;

        // Phase 2: Statistics
        let mut env = Environment::new(self.config.clone());
        source.reset(&env).await?;
        // A dry run must leave existing target records in place.
        if !self.dry_run {
            target.reset(&env).await?;
        }
        let source_stats = source.get_source_stats(&env).await?;
        let target_stats = target.get_target_stats(&env).await?;
        let records_expected = match transfer.max_records {
            Some(cap) => source_stats.total_record_count.min(cap),
            None => source_stats.total_record_count,
        };
        info!(
            "Source {} v{} ({}): {} records, transferring {}",
            source.get_info().id,
            source_stats.version,
            source_stats.status,
            source_stats.total_record_count,
            records_expected
        );
        info!(
            "Target {} v{} ({})",
            target.get_info().id,
            target_stats.version,
            target_stats.status
        );
        env.statistics = Statistics {
            source: Some(source_stats),
            target: Some(target_stats),
            records_expected,
        };

        // Phase 3: Metadata
        if transfer.transfer_meta {
            let meta = source.get_meta(&env).await?;
            target.put_meta(&env, &meta).await?;
            info!("Copied metadata to target");
        }
        drop(source);
        drop(target);

        let summary = |status: RunStatus, stats: &ProgressStats, workers: usize| {
            let duration = clock.elapsed().as_secs_f64();
            RunSummary {
                run_id: run_id.clone(),
                status,
                config_hash: config_hash.clone(),
                started_at,
                completed_at: Utc::now(),
                duration_seconds: duration,
                records_expected,
                records_processed: stats.processed_count,
                failed_units: stats.failed_units,
                peak_memory_ratio: stats.peak_memory_ratio,
                workers,
                records_per_second: if duration > 0.0 {
                    stats.processed_count as f64 / duration
                } else {
                    0.0
                },
            }
        };

        if self.dry_run {
            info!("Dry run: {} records would be transferred", records_expected);
            let stats = ProgressStats {
                total_expected: records_expected,
                ..Default::default()
            };
            return Ok(summary(RunStatus::DryRun, &stats, workers));
        }

        // Phase 4: Transfer
        let mut pool = start(env, workers, self.catalog.clone(), &launcher).await?;
        let pool_size = pool.worker_count();

        let failures: Arc<Mutex<Vec<WorkerFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let ignore_errors = transfer.ignore_errors;
        pool.on_error(move |failure| {
            if ignore_errors && !failure.fatal {
                warn!("Ignoring failed unit: {}", failure.message);
            } else {
                error!("Worker {} failed: {}", failure.worker_id, failure.message);
            }
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(failure.clone());
        });
        let mut reporter = ProgressReporter {
            last_decile: 0,
            json_lines: self.progress_output,
        };
        pool.on_progress(move |stats| reporter.report(stats));
        pool.on_complete(|stats| {
            debug!("Completion: {} records processed", stats.processed_count);
        });

        let page_size = transfer.get_page_size();
        let mut offset = 0u64;
        let mut cancelled = false;
        let mut abort: Option<TransferError> = None;

        while offset < records_expected {
            if cancel.is_cancelled() {
                warn!("Cancellation requested, stopping dispatch at offset {}", offset);
                cancelled = true;
                break;
            }
            if pool.source_exhausted() {
                info!("Source exhausted at offset {}", offset);
                break;
            }
            if pool.is_complete() {
                break;
            }
            if let Some(e) = first_failure(&failures, ignore_errors) {
                abort = Some(e);
                break;
            }

            let size = page_size.min((records_expected - offset) as usize);
            if let Err(e) = pool.dispatch(offset, size).await {
                abort = Some(e);
                break;
            }
            offset += size as u64;
        }

        let stats = pool.finish().await;
        if abort.is_none() {
            abort = first_failure(&failures, ignore_errors);
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if stats.failed_units > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        let result = summary(status, &stats, pool_size);

        if let Some(e) = abort {
            error!(
                "Transfer failed after {}/{} records: {}",
                result.records_processed, result.records_expected, e
            );
            return Err(e);
        }

        info!(
            "Transfer {}: {} of {} records in {:.1}s ({:.0} records/s, {} failed units)",
            result.status,
            result.records_processed,
            result.records_expected,
            result.duration_seconds,
            result.records_per_second,
            result.failed_units
        );
        Ok(result)
    }
}

/// The error that should stop the run, if any: fatal failures always do,
/// unit failures only when errors are not ignored.
fn first_failure(failures: &Mutex<Vec<WorkerFailure>>, ignore_errors: bool) -> Option<TransferError> {
    let failures = failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(fatal) = failures.iter().find(|f| f.fatal) {
        return Some(TransferError::fatal(
            format!("worker {}", fatal.worker_id),
            fatal.message.clone(),
        ));
    }
    if ignore_errors {
        return None;
    }
    failures.first().map(|f| {
        let (offset, end) = f.unit.map(|u| (u.offset, u.end())).unwrap_or((0, 0));
        TransferError::WorkUnit {
            offset,
            end,
            message: f.message.clone(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::drivers::MemoryStores;
    use crate::testing::{scripted, ScriptedFactory};
    use crate::core::Record;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn memory_config(workers: usize, page_size: usize) -> Config {
        let mut config = Config::new(
            BackendConfig::new("memory").with_option("store", "src"),
            BackendConfig::new("memory").with_option("store", "dst"),
        );
        config.transfer.workers = Some(workers);
        config.transfer.page_size = Some(page_size);
        config.transfer.isolation = Isolation::Task;
        config
    }

    fn seeded_stores(count: u64) -> MemoryStores {
        let stores = MemoryStores::default();
        stores
            .store("src")
            .upsert((0..count).map(|i| Record::new(format!("r{}", i), json!({ "n": i }))));
        stores.store("src").set_meta(json!({"fields": ["n"]}));
        stores
    }

    fn scripted_config(workers: usize, page_size: usize, max_retries: u32) -> Config {
        let mut config = Config::new(
            BackendConfig::new("scripted"),
            BackendConfig::new("scripted"),
        );
        config.transfer.workers = Some(workers);
        config.transfer.page_size = Some(page_size);
        config.transfer.max_retries = Some(max_retries);
        config.transfer.isolation = Isolation::Task;
        config
    }

    #[tokio::test]
    async fn test_memory_transfer_with_task_workers() {
        let stores = seeded_stores(100);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores.clone()));

        let summary = Orchestrator::new(memory_config(3, 7), catalog)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.records_expected, 100);
        assert_eq!(summary.records_processed, 100);
        assert_eq!(summary.workers, 3);
        assert_eq!(stores.store("dst").len(), 100);
        assert_eq!(stores.store("dst").meta(), Some(json!({"fields": ["n"]})));
    }

    #[tokio::test]
    async fn test_single_worker_runs_in_process() {
        let stores = seeded_stores(10);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores.clone()));
        let mut config = memory_config(1, 3);
        config.transfer.isolation = Isolation::Process;

        let summary = Orchestrator::new(config, catalog)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.workers, 1);
        assert_eq!(summary.records_processed, 10);
        assert_eq!(stores.store("dst").len(), 10);
    }

    #[tokio::test]
    async fn test_max_records_caps_transfer() {
        let stores = seeded_stores(50);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores.clone()));
        let mut config = memory_config(2, 10);
        config.transfer.max_records = Some(25);

        let summary = Orchestrator::new(config, catalog)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_expected, 25);
        assert_eq!(summary.records_processed, 25);
        assert_eq!(stores.store("dst").len(), 25);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let stores = seeded_stores(10);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores.clone()));
        let mut config = memory_config(2, 5);
        config.transfer.transfer_meta = false;

        let summary = Orchestrator::new(config, catalog)
            .with_dry_run(true)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::DryRun);
        assert_eq!(summary.records_expected, 10);
        assert_eq!(summary.records_processed, 0);
        assert!(stores.store("dst").is_empty());
        assert!(summary.to_json().unwrap().contains("\"dry_run\""));
    }

    #[tokio::test]
    async fn test_dry_run_keeps_existing_target_records() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.jsonl");
        let target = dir.path().join("out.jsonl");
        std::fs::write(&source, "{\"id\": \"a\"}\n{\"id\": \"b\"}\n").unwrap();
        std::fs::write(&target, "{\"id\": \"keep-me\"}\n").unwrap();
        let mut config = Config::new(
            BackendConfig::new("file").with_option("path", source.to_str().unwrap()),
            BackendConfig::new("file").with_option("path", target.to_str().unwrap()),
        );
        config.transfer.isolation = Isolation::Task;

        let summary = Orchestrator::new(config, Arc::new(BackendCatalog::with_builtins()))
            .with_dry_run(true)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::DryRun);
        assert_eq!(summary.records_expected, 2);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "{\"id\": \"keep-me\"}\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_options_are_config_errors() {
        let catalog = Arc::new(BackendCatalog::with_builtins());
        let config = Config::new(BackendConfig::new("memory"), BackendConfig::new("memory"));

        let err = Orchestrator::new(config, catalog)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_process_isolation_requires_worker_program() {
        let stores = seeded_stores(10);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores));
        let mut config = memory_config(2, 5);
        config.transfer.isolation = Isolation::Process;

        let err = Orchestrator::new(config, catalog)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unit_failure_aborts_run() {
        let state = scripted(20);
        state.get_failures.store(usize::MAX, Ordering::SeqCst);
        let factory = ScriptedFactory::new(state);

        let err = Orchestrator::new(scripted_config(2, 5, 2), factory.catalog())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::WorkUnit { .. }));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(factory.state.put_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ignored_failures_are_counted() {
        let state = scripted(10);
        state.get_failures.store(2, Ordering::SeqCst);
        let factory = ScriptedFactory::new(state);
        let mut config = scripted_config(2, 2, 1);
        config.transfer.ignore_errors = true;

        let summary = Orchestrator::new(config, factory.catalog())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::CompletedWithErrors);
        assert_eq!(summary.failed_units, 2);
        assert_eq!(summary.records_processed, 6);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts_even_when_ignoring() {
        let state = scripted(10);
        state.fatal_get.store(true, Ordering::SeqCst);
        let factory = ScriptedFactory::new(state);
        let mut config = scripted_config(2, 5, 3);
        config.transfer.ignore_errors = true;

        let err = Orchestrator::new(config, factory.catalog())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let stores = seeded_stores(10);
        let catalog = Arc::new(BackendCatalog::with_memory_stores(stores.clone()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = Orchestrator::new(memory_config(2, 5), catalog)
            .run(cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        let err = summary.outcome().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(summary.records_processed, 0);
        assert!(stores.store("dst").is_empty());
    }
}
